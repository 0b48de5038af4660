//! The callback contract between the session core and the embedding
//! application.
//!
//! The core never holds the session lock while calling into a handler;
//! a handler may therefore call back into the [`crate::Session`] it was
//! registered with (to read the application description, player info,
//! and so on). Events for a single peer arrive in protocol order, the
//! completion of an operation arrives after all events that operation
//! produced, and `destroy_player` for the local player is the last
//! event a session ever delivers.

use crate::error::SessionError;
use crate::types::*;
use std::net::SocketAddrV4;

/// Why a player left the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// Clean departure: graceful close on either side.
    Normal,
    /// Transport failure or abrupt close.
    ConnectionLost,
    /// The session itself was terminated by the host.
    SessionTerminated,
    /// The host ejected this player with `destroy_peer`.
    HostDestroyedPlayer,
}

/// What the handler wants done with a received payload buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveAction {
    /// The core may reuse the buffer as soon as the handler returns.
    Release,
    /// The core keeps the buffer alive until
    /// [`crate::Session::return_buffer`] is called with this event's
    /// buffer handle.
    Retain,
}

/// Host-side verdict on an incoming join, produced by
/// [`SessionHandler::indicate_connect`].
#[derive(Debug, Clone, Default)]
pub struct IndicateReply {
    /// false rejects the join; the joiner sees a host-rejected code
    /// plus `reply_data`.
    pub reject: bool,
    /// Opaque reply forwarded to the joiner in either direction.
    pub reply_data: Option<Vec<u8>>,
    /// Player context to attach to the new player on this instance.
    pub player_ctx: UserContext,
}

impl IndicateReply {
    pub fn accept() -> IndicateReply {
        IndicateReply::default()
    }

    pub fn reject_with(reply_data: Option<Vec<u8>>) -> IndicateReply {
        IndicateReply {
            reject: true,
            reply_data,
            player_ctx: 0,
        }
    }
}

/// One discovery reply, delivered per responding host.
#[derive(Debug, Clone)]
pub struct EnumHostInfo {
    pub desc: ApplicationDesc,
    /// Where the response came from; connect to this address to join.
    pub from: SocketAddrV4,
    /// Opaque response attached by the host's `enum_hosts_query`.
    pub response_data: Option<Vec<u8>>,
    /// Request-to-response round trip, from the echoed tick stamp.
    pub round_trip_ms: u32,
}

/// Embedding-application event sink. All methods have no-op defaults so
/// implementations only write the events they care about.
///
/// Handlers run on the session's I/O and worker tasks; blocking inside
/// one stalls that connection's pipeline but nothing else.
pub trait SessionHandler: Send + Sync + 'static {
    /// A player entered the session (including the local player). The
    /// returned value replaces the player's context.
    fn create_player(&self, _player: PlayerId, ctx: UserContext) -> UserContext {
        ctx
    }

    /// A player left. For the local player this is the final event.
    fn destroy_player(&self, _player: PlayerId, _ctx: UserContext, _reason: DestroyReason) {}

    /// Host only: an admission decision for a validated join request.
    fn indicate_connect(
        &self,
        _connect_data: Option<&[u8]>,
        _addr: SocketAddrV4,
    ) -> IndicateReply {
        IndicateReply::accept()
    }

    /// Joiner only: terminal result of a `connect` call. `local` is the
    /// assigned player id when the result is `Ok`.
    fn connect_complete(
        &self,
        _handle: AsyncHandle,
        _ctx: UserContext,
        _result: Result<(), SessionError>,
        _reply_data: Option<&[u8]>,
        _local: PlayerId,
    ) {
    }

    /// An application payload arrived. The payload borrow ends when the
    /// handler returns unless it answers [`ReceiveAction::Retain`].
    fn receive(&self, _from: PlayerId, _payload: &[u8], _buffer: BufferHandle) -> ReceiveAction {
        ReceiveAction::Release
    }

    /// A retained buffer was released via `return_buffer`.
    fn return_buffer(&self, _buffer: BufferHandle, _result: Result<(), SessionError>) {}

    /// Host only: a discovery query passed the application-GUID filter.
    /// The returned bytes ride back in the response.
    fn enum_hosts_query(
        &self,
        _user_data: Option<&[u8]>,
        _from: SocketAddrV4,
    ) -> Option<Vec<u8>> {
        None
    }

    /// One host answered an `enum_hosts` operation.
    fn enum_hosts_response(&self, _handle: AsyncHandle, _ctx: UserContext, _info: &EnumHostInfo) {}

    /// Terminal completion of an asynchronous enumeration or peer-info
    /// update. Exactly one per operation, and never in sync mode.
    fn async_op_complete(
        &self,
        _handle: AsyncHandle,
        _ctx: UserContext,
        _result: Result<(), SessionError>,
    ) {
    }

    /// Terminal completion of an asynchronous `send_to`.
    fn send_complete(
        &self,
        _handle: AsyncHandle,
        _ctx: UserContext,
        _result: Result<(), SessionError>,
    ) {
    }

    /// A remote player changed its name/data with `set_peer_info`.
    fn peer_info(&self, _player: PlayerId, _ctx: UserContext) {}

    /// The application description changed; `get_application_desc`
    /// already returns the new values.
    fn app_desc_changed(&self) {}

    /// A group was created somewhere in the session. The returned value
    /// becomes the group's context on this instance.
    fn group_create(&self, _group: GroupId, ctx: UserContext) -> UserContext {
        ctx
    }

    /// A group was destroyed; its id is retired for the session.
    fn group_destroy(&self, _group: GroupId, _ctx: UserContext, _reason: DestroyReason) {}

    /// The session is over: host terminated it, the host connection was
    /// lost, or this instance was ejected via `destroy_peer`.
    fn terminate_session(&self, _result: Result<(), SessionError>, _data: Option<&[u8]>) {}
}

/// Handler that ignores every event. Useful for enumeration-only
/// instances and tests.
pub struct NullHandler;

impl SessionHandler for NullHandler {}
