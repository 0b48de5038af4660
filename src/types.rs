//! Session-wide constants and small shared types.

use rand::RngCore;
use std::fmt;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Default UDP port on which hosts listen for discovery broadcasts.
/// Sessions themselves bind a caller-chosen TCP/UDP port pair.
pub const DEFAULT_DISCOVERY_PORT: u16 = 6073;

/// Maximum accepted frame size, header included.
/// A frame whose outer length exceeds this kills the connection it
/// arrived on; it is never surfaced to the application.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Best-effort payloads ride in single datagrams, so they are bounded by
/// what fits under the frame header without IP fragmentation going wild.
pub const MAX_DATAGRAM_SIZE: usize = 63 * 1024;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// TCP connect timeout for host and peer-mesh edges.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// How long a graceful close waits for the remote to close its side
/// after our send queue has drained.
pub const CLOSE_LINGER_MS: u64 = 500;

/// EnumHosts defaults, used when the caller passes 0.
pub const DEFAULT_ENUM_COUNT: u32 = 3;
pub const DEFAULT_ENUM_RETRY_MS: u64 = 1500;
pub const DEFAULT_ENUM_TIMEOUT_MS: u64 = 1500;

// =============================================================================
// IDS AND OPAQUE VALUES
// =============================================================================

/// Session-wide player identifier. 0 is never a valid player id; it is
/// the `ALL_PLAYERS` broadcast sentinel in `send_to`.
pub type PlayerId = u32;

/// Group identifier. Once destroyed, a group id is retired for the
/// lifetime of the session.
pub type GroupId = u32;

/// Broadcast sentinel for `Session::send_to`.
pub const ALL_PLAYERS: PlayerId = 0;

/// Opaque application context value. The core copies it verbatim and
/// hands it back on later events; it never interprets it.
pub type UserContext = u64;

/// Opaque handle for an asynchronous operation. 0 means "no handle"
/// (synchronous calls and failed submissions).
pub type AsyncHandle = u32;

/// Handle to a received payload buffer retained past its receive event.
pub type BufferHandle = u64;

// =============================================================================
// GUID
// =============================================================================

/// 128-bit identifier for applications and session instances.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub const NIL: Guid = Guid([0; 16]);

    /// Random instance GUID for a freshly hosted session.
    pub fn random() -> Guid {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Guid(bytes)
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Guid {
        Guid(bytes)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex::encode(&self.0[0..4]),
            hex::encode(&self.0[4..6]),
            hex::encode(&self.0[6..8]),
            hex::encode(&self.0[8..10]),
            hex::encode(&self.0[10..16]),
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}

// =============================================================================
// WIRE RESULT CODES
// =============================================================================
// Carried as DWORD fields in CONNECT_HOST_FAIL, CONNECT_PEER_FAIL and ACK
// records. error.rs maps them to and from SessionError.

pub const RESULT_OK: u32 = 0;
pub const ERR_GENERIC: u32 = 1;
pub const ERR_INVALID_APPLICATION: u32 = 2;
pub const ERR_INVALID_INSTANCE: u32 = 3;
pub const ERR_INVALID_PASSWORD: u32 = 4;
pub const ERR_SESSION_FULL: u32 = 5;
pub const ERR_HOST_REJECTED: u32 = 6;
pub const ERR_CONNECTION_LOST: u32 = 7;
pub const ERR_USER_CANCEL: u32 = 8;

// =============================================================================
// OPERATION FLAGS
// =============================================================================

/// `send_to`: block until the completion fires; no handle is produced.
pub const SEND_SYNC: u32 = 1 << 0;
/// `send_to`: deliver over the reliable per-peer TCP stream.
pub const SEND_GUARANTEED: u32 = 1 << 1;
/// `send_to`: allow the transport to coalesce with other queued sends.
pub const SEND_COALESCE: u32 = 1 << 2;
/// `send_to`: complete only once the receiver has processed the payload.
pub const SEND_COMPLETEONPROCESS: u32 = 1 << 3;
/// `send_to(ALL_PLAYERS)`: skip the local loopback delivery.
pub const SEND_NOLOOPBACK: u32 = 1 << 4;

/// Flag bits that travel in the MESSAGE record so the receiver can see
/// how the payload was sent.
pub const SEND_WIRE_MASK: u32 = SEND_GUARANTEED | SEND_COALESCE | SEND_COMPLETEONPROCESS;

/// `connect`: block until the join completes or fails.
pub const CONNECT_SYNC: u32 = 1 << 0;

/// `enum_hosts`: block until the retry schedule ends. No completion
/// event is dispatched in this mode.
pub const ENUM_HOSTS_SYNC: u32 = 1 << 0;

/// `set_peer_info`: block until every peer has acknowledged.
pub const SET_INFO_SYNC: u32 = 1 << 0;

/// `close`: drop all connections immediately instead of draining.
pub const CLOSE_IMMEDIATE: u32 = 1 << 0;

// =============================================================================
// CANCELLATION SCOPES
// =============================================================================

pub const CANCEL_ENUMS: u32 = 1 << 0;
pub const CANCEL_CONNECTS: u32 = 1 << 1;
pub const CANCEL_SENDS: u32 = 1 << 2;
pub const CANCEL_PLAYER_INFOS: u32 = 1 << 3;
pub const CANCEL_ALL_OPERATIONS: u32 =
    CANCEL_ENUMS | CANCEL_CONNECTS | CANCEL_SENDS | CANCEL_PLAYER_INFOS;

// =============================================================================
// APPLICATION DESCRIPTION
// =============================================================================

/// The shared session description. The host is the authority; changes
/// propagate to every peer via APPDESC.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationDesc {
    pub instance: Guid,
    pub application: Guid,
    /// 0 = unlimited.
    pub max_players: u32,
    pub current_players: u32,
    pub session_name: String,
    pub password: Option<String>,
    pub application_data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_random_not_nil() {
        let g = Guid::random();
        assert!(!g.is_nil());
        assert_ne!(g, Guid::random());
    }

    #[test]
    fn guid_display_groups() {
        let g = Guid([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ]);
        assert_eq!(g.to_string(), "01020304-0506-0708-090a-0b0c0d0e0f10");
    }
}
