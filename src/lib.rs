//! Peer-to-peer LAN session library.
//!
//! A set of processes forms a named session identified by an
//! application GUID and an instance GUID: one host admits joiners,
//! every participant keeps a direct TCP connection to every other
//! (full mesh), application payloads travel reliably over TCP or
//! best-effort over UDP, and hosts on the local network are
//! discoverable via UDP broadcast.
//!
//! The embedding application implements [`SessionHandler`] and drives
//! a [`Session`]: `host` or `connect`, `send_to`, `set_peer_info`,
//! `set_application_desc`, and finally `close`.

mod enumerator;
mod group;
mod handle;
mod io;
mod logging;
mod ops;
mod peer;
mod proto;
mod sendqueue;

pub mod error;
pub mod event;
pub mod message;
pub mod packet;
pub mod session;
pub mod types;

pub use enumerator::EnumHostsParams;
pub use error::{PacketError, SessionError};
pub use event::{
    DestroyReason, EnumHostInfo, IndicateReply, NullHandler, ReceiveAction, SessionHandler,
};
pub use session::{ConnectParams, HostParams, Session, SessionConfig};
pub use types::*;
