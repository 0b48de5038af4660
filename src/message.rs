//! Wire message catalogue.
//!
//! One struct per message id, each carrying its exact field layout in
//! wire order. Everything that knows what a given message looks like on
//! the wire lives here; the protocol handlers only see typed structs.

use crate::error::PacketError;
use crate::packet::{PacketBuilder, PacketReader};
use crate::types::{Guid, PlayerId};
use std::net::{Ipv4Addr, SocketAddrV4};

// =============================================================================
// MESSAGE IDS
// =============================================================================

/// Discovery query, caller → host, UDP broadcast.
pub const MSG_HOST_ENUM_REQUEST: u32 = 1;
/// Discovery reply, host → caller, UDP unicast.
pub const MSG_HOST_ENUM_RESPONSE: u32 = 2;
/// Join request, joiner → host, TCP.
pub const MSG_CONNECT_HOST: u32 = 3;
/// Join accepted, host → joiner, TCP.
pub const MSG_CONNECT_HOST_OK: u32 = 4;
/// Join rejected, host → joiner, TCP; host closes afterwards.
pub const MSG_CONNECT_HOST_FAIL: u32 = 5;
/// Application payload, TCP or UDP.
pub const MSG_MESSAGE: u32 = 6;
/// Player identity update, any → any, TCP, acked.
pub const MSG_PLAYERINFO: u32 = 7;
/// Completion of an acked message, any → any, TCP.
pub const MSG_ACK: u32 = 8;
/// Application description update, host → peer, TCP, acked.
pub const MSG_APPDESC: u32 = 9;
/// Mesh edge request, new joiner → existing peer, TCP.
pub const MSG_CONNECT_PEER: u32 = 10;
/// Mesh edge accepted, existing peer → new joiner, TCP.
pub const MSG_CONNECT_PEER_OK: u32 = 11;
/// Mesh edge rejected, existing peer → new joiner, TCP.
pub const MSG_CONNECT_PEER_FAIL: u32 = 12;
/// Host-initiated ejection, host → victim and → all other peers.
pub const MSG_DESTROY_PEER: u32 = 13;
/// Host is destroying the session, host → all.
pub const MSG_TERMINATE_SESSION: u32 = 14;
/// A group has been created, originator → all, acked.
pub const MSG_GROUP_CREATE: u32 = 16;
/// A group has been destroyed and its id retired, originator → all, acked.
pub const MSG_GROUP_DESTROY: u32 = 17;

pub fn msg_name(id: u32) -> &'static str {
    match id {
        MSG_HOST_ENUM_REQUEST => "HOST_ENUM_REQUEST",
        MSG_HOST_ENUM_RESPONSE => "HOST_ENUM_RESPONSE",
        MSG_CONNECT_HOST => "CONNECT_HOST",
        MSG_CONNECT_HOST_OK => "CONNECT_HOST_OK",
        MSG_CONNECT_HOST_FAIL => "CONNECT_HOST_FAIL",
        MSG_MESSAGE => "MESSAGE",
        MSG_PLAYERINFO => "PLAYERINFO",
        MSG_ACK => "ACK",
        MSG_APPDESC => "APPDESC",
        MSG_CONNECT_PEER => "CONNECT_PEER",
        MSG_CONNECT_PEER_OK => "CONNECT_PEER_OK",
        MSG_CONNECT_PEER_FAIL => "CONNECT_PEER_FAIL",
        MSG_DESTROY_PEER => "DESTROY_PEER",
        MSG_TERMINATE_SESSION => "TERMINATE_SESSION",
        MSG_GROUP_CREATE => "GROUP_CREATE",
        MSG_GROUP_DESTROY => "GROUP_DESTROY",
        _ => "UNKNOWN",
    }
}

// IPv4 addresses travel as a DWORD holding the four octets in memory
// order, the port as a plain DWORD.
fn encode_ip(ip: Ipv4Addr) -> u32 {
    u32::from_le_bytes(ip.octets())
}

fn decode_ip(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value.to_le_bytes())
}

// =============================================================================
// DISCOVERY
// =============================================================================

/// `HOST_ENUM_REQUEST`: GUID|NULL application filter, DATA|NULL user
/// payload, DWORD sender tick stamp (echoed back for latency).
pub struct HostEnumRequest {
    pub application: Option<Guid>,
    pub user_data: Option<Vec<u8>>,
    pub tick: u32,
}

impl HostEnumRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_HOST_ENUM_REQUEST);
        b.opt_guid(self.application.as_ref())
            .opt_data(self.user_data.as_deref())
            .dword(self.tick);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<HostEnumRequest, PacketError> {
        Ok(HostEnumRequest {
            application: r.opt_guid(0)?,
            user_data: r.opt_data(1)?.map(<[u8]>::to_vec),
            tick: r.dword(2)?,
        })
    }
}

/// `HOST_ENUM_RESPONSE`: DWORD flags (reserved, 0), GUID instance, GUID
/// application, DWORD max players, DWORD current players, WSTRING
/// session name, DATA|NULL application data, DATA|NULL response data,
/// DWORD echoed tick.
pub struct HostEnumResponse {
    pub instance: Guid,
    pub application: Guid,
    pub max_players: u32,
    pub current_players: u32,
    pub session_name: String,
    pub application_data: Option<Vec<u8>>,
    pub response_data: Option<Vec<u8>>,
    pub tick: u32,
}

impl HostEnumResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_HOST_ENUM_RESPONSE);
        b.dword(0)
            .guid(&self.instance)
            .guid(&self.application)
            .dword(self.max_players)
            .dword(self.current_players)
            .wstring(&self.session_name)
            .opt_data(self.application_data.as_deref())
            .opt_data(self.response_data.as_deref())
            .dword(self.tick);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<HostEnumResponse, PacketError> {
        Ok(HostEnumResponse {
            instance: r.guid(1)?,
            application: r.guid(2)?,
            max_players: r.dword(3)?,
            current_players: r.dword(4)?,
            session_name: r.wstring(5)?,
            application_data: r.opt_data(6)?.map(<[u8]>::to_vec),
            response_data: r.opt_data(7)?.map(<[u8]>::to_vec),
            tick: r.dword(8)?,
        })
    }
}

// =============================================================================
// JOIN PROTOCOL
// =============================================================================

/// `CONNECT_HOST`: GUID|NULL instance filter, GUID application,
/// WSTRING|NULL password, DATA|NULL connect request data, WSTRING
/// player name (empty = none), DATA player data (empty = none).
pub struct ConnectHost {
    pub instance: Option<Guid>,
    pub application: Guid,
    pub password: Option<String>,
    pub connect_data: Option<Vec<u8>>,
    pub player_name: String,
    pub player_data: Vec<u8>,
}

impl ConnectHost {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_CONNECT_HOST);
        b.opt_guid(self.instance.as_ref())
            .guid(&self.application)
            .opt_wstring(self.password.as_deref())
            .opt_data(self.connect_data.as_deref())
            .wstring(&self.player_name)
            .data(&self.player_data);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<ConnectHost, PacketError> {
        Ok(ConnectHost {
            instance: r.opt_guid(0)?,
            application: r.guid(1)?,
            password: r.opt_wstring(2)?,
            connect_data: r.opt_data(3)?.map(<[u8]>::to_vec),
            player_name: r.wstring(4)?,
            player_data: r.data(5)?.to_vec(),
        })
    }
}

/// One `(player id, address)` entry in the CONNECT_HOST_OK peer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub player_id: PlayerId,
    pub addr: SocketAddrV4,
}

/// `CONNECT_HOST_OK`: GUID instance, DWORD host player id, DWORD
/// assigned player id, DWORD peer count, then per peer (DWORD player
/// id, DWORD IPv4, DWORD port), then DATA|NULL application reply,
/// WSTRING host name, DATA host data, DWORD max players, WSTRING
/// session name, WSTRING password (empty = none), DATA application
/// data.
pub struct ConnectHostOk {
    pub instance: Guid,
    pub host_player_id: PlayerId,
    pub player_id: PlayerId,
    pub peers: Vec<PeerEntry>,
    pub reply_data: Option<Vec<u8>>,
    pub host_name: String,
    pub host_data: Vec<u8>,
    pub max_players: u32,
    pub session_name: String,
    pub password: String,
    pub application_data: Vec<u8>,
}

impl ConnectHostOk {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_CONNECT_HOST_OK);
        b.guid(&self.instance)
            .dword(self.host_player_id)
            .dword(self.player_id)
            .dword(self.peers.len() as u32);
        for p in &self.peers {
            b.dword(p.player_id)
                .dword(encode_ip(*p.addr.ip()))
                .dword(p.addr.port() as u32);
        }
        b.opt_data(self.reply_data.as_deref())
            .wstring(&self.host_name)
            .data(&self.host_data)
            .dword(self.max_players)
            .wstring(&self.session_name)
            .wstring(&self.password)
            .data(&self.application_data);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<ConnectHostOk, PacketError> {
        let n_peers = r.dword(3)? as usize;
        let mut peers = Vec::with_capacity(n_peers.min(1024));
        let mut at = 4;
        for _ in 0..n_peers {
            let player_id = r.dword(at)?;
            let ip = decode_ip(r.dword(at + 1)?);
            let port = r.dword(at + 2)?;
            if port > u16::MAX as u32 {
                return Err(PacketError::Malformed);
            }
            peers.push(PeerEntry {
                player_id,
                addr: SocketAddrV4::new(ip, port as u16),
            });
            at += 3;
        }
        Ok(ConnectHostOk {
            instance: r.guid(0)?,
            host_player_id: r.dword(1)?,
            player_id: r.dword(2)?,
            peers,
            reply_data: r.opt_data(at)?.map(<[u8]>::to_vec),
            host_name: r.wstring(at + 1)?,
            host_data: r.data(at + 2)?.to_vec(),
            max_players: r.dword(at + 3)?,
            session_name: r.wstring(at + 4)?,
            password: r.wstring(at + 5)?,
            application_data: r.data(at + 6)?.to_vec(),
        })
    }
}

/// `CONNECT_HOST_FAIL`: DWORD error code, DATA|NULL application reply.
/// The host closes the connection after sending this.
pub struct ConnectHostFail {
    pub code: u32,
    pub reply_data: Option<Vec<u8>>,
}

impl ConnectHostFail {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_CONNECT_HOST_FAIL);
        b.dword(self.code).opt_data(self.reply_data.as_deref());
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<ConnectHostFail, PacketError> {
        Ok(ConnectHostFail {
            code: r.dword(0)?,
            reply_data: r.opt_data(1)?.map(<[u8]>::to_vec),
        })
    }
}

/// `CONNECT_PEER`: GUID instance, GUID application, WSTRING password
/// (empty = none), DWORD player id, WSTRING name, DATA data.
pub struct ConnectPeer {
    pub instance: Guid,
    pub application: Guid,
    pub password: String,
    pub player_id: PlayerId,
    pub player_name: String,
    pub player_data: Vec<u8>,
}

impl ConnectPeer {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_CONNECT_PEER);
        b.guid(&self.instance)
            .guid(&self.application)
            .wstring(&self.password)
            .dword(self.player_id)
            .wstring(&self.player_name)
            .data(&self.player_data);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<ConnectPeer, PacketError> {
        Ok(ConnectPeer {
            instance: r.guid(0)?,
            application: r.guid(1)?,
            password: r.wstring(2)?,
            player_id: r.dword(3)?,
            player_name: r.wstring(4)?,
            player_data: r.data(5)?.to_vec(),
        })
    }
}

/// `CONNECT_PEER_OK`: WSTRING name, DATA data of the responding peer.
pub struct ConnectPeerOk {
    pub player_name: String,
    pub player_data: Vec<u8>,
}

impl ConnectPeerOk {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_CONNECT_PEER_OK);
        b.wstring(&self.player_name).data(&self.player_data);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<ConnectPeerOk, PacketError> {
        Ok(ConnectPeerOk {
            player_name: r.wstring(0)?,
            player_data: r.data(1)?.to_vec(),
        })
    }
}

/// `CONNECT_PEER_FAIL`: DWORD error code.
pub struct ConnectPeerFail {
    pub code: u32,
}

impl ConnectPeerFail {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_CONNECT_PEER_FAIL);
        b.dword(self.code);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<ConnectPeerFail, PacketError> {
        Ok(ConnectPeerFail { code: r.dword(0)? })
    }
}

// =============================================================================
// IN-SESSION TRAFFIC
// =============================================================================

/// `MESSAGE`: DWORD sender player id, DATA payload, DWORD send flags.
pub struct AppMessage {
    pub sender: PlayerId,
    pub payload: Vec<u8>,
    pub flags: u32,
}

impl AppMessage {
    pub fn encode(sender: PlayerId, payload: &[u8], flags: u32) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_MESSAGE);
        b.dword(sender).data(payload).dword(flags);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<AppMessage, PacketError> {
        Ok(AppMessage {
            sender: r.dword(0)?,
            payload: r.data(1)?.to_vec(),
            flags: r.dword(2)?,
        })
    }
}

/// `PLAYERINFO`: DWORD player id (always the sender's), WSTRING name,
/// DATA data, DWORD ack id.
pub struct PlayerInfo {
    pub player_id: PlayerId,
    pub player_name: String,
    pub player_data: Vec<u8>,
    pub ack_id: u32,
}

impl PlayerInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_PLAYERINFO);
        b.dword(self.player_id)
            .wstring(&self.player_name)
            .data(&self.player_data)
            .dword(self.ack_id);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<PlayerInfo, PacketError> {
        Ok(PlayerInfo {
            player_id: r.dword(0)?,
            player_name: r.wstring(1)?,
            player_data: r.data(2)?.to_vec(),
            ack_id: r.dword(3)?,
        })
    }
}

/// `ACK`: DWORD ack id, DWORD result code, optional DATA response.
pub struct Ack {
    pub ack_id: u32,
    pub result: u32,
    pub response: Option<Vec<u8>>,
}

impl Ack {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_ACK);
        b.dword(self.ack_id).dword(self.result);
        if let Some(response) = &self.response {
            b.data(response);
        }
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<Ack, PacketError> {
        let response = if r.num_fields() > 2 {
            r.opt_data(2)?.map(<[u8]>::to_vec)
        } else {
            None
        };
        Ok(Ack {
            ack_id: r.dword(0)?,
            result: r.dword(1)?,
            response,
        })
    }
}

/// `APPDESC`: DWORD max players, WSTRING session name, WSTRING password
/// (empty = none), DATA application data, DWORD ack id.
pub struct AppDescUpdate {
    pub max_players: u32,
    pub session_name: String,
    pub password: String,
    pub application_data: Vec<u8>,
    pub ack_id: u32,
}

impl AppDescUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_APPDESC);
        b.dword(self.max_players)
            .wstring(&self.session_name)
            .wstring(&self.password)
            .data(&self.application_data)
            .dword(self.ack_id);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<AppDescUpdate, PacketError> {
        Ok(AppDescUpdate {
            max_players: r.dword(0)?,
            session_name: r.wstring(1)?,
            password: r.wstring(2)?,
            application_data: r.data(3)?.to_vec(),
            ack_id: r.dword(4)?,
        })
    }
}

// =============================================================================
// TEARDOWN
// =============================================================================

/// `DESTROY_PEER`: DWORD player id of the ejected peer, DATA terminate
/// data (meaningful only host → victim; empty elsewhere).
pub struct DestroyPeerMsg {
    pub player_id: PlayerId,
    pub data: Vec<u8>,
}

impl DestroyPeerMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_DESTROY_PEER);
        b.dword(self.player_id).data(&self.data);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<DestroyPeerMsg, PacketError> {
        Ok(DestroyPeerMsg {
            player_id: r.dword(0)?,
            data: r.data(1)?.to_vec(),
        })
    }
}

/// `TERMINATE_SESSION`: DATA terminate data.
pub struct TerminateSessionMsg {
    pub data: Vec<u8>,
}

impl TerminateSessionMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_TERMINATE_SESSION);
        b.data(&self.data);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<TerminateSessionMsg, PacketError> {
        Ok(TerminateSessionMsg {
            data: r.data(0)?.to_vec(),
        })
    }
}

// =============================================================================
// GROUPS
// =============================================================================

/// `GROUP_CREATE`: DWORD group id, WSTRING name, DATA data, DWORD ack id.
pub struct GroupCreateMsg {
    pub group_id: u32,
    pub name: String,
    pub data: Vec<u8>,
    pub ack_id: u32,
}

impl GroupCreateMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_GROUP_CREATE);
        b.dword(self.group_id)
            .wstring(&self.name)
            .data(&self.data)
            .dword(self.ack_id);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<GroupCreateMsg, PacketError> {
        Ok(GroupCreateMsg {
            group_id: r.dword(0)?,
            name: r.wstring(1)?,
            data: r.data(2)?.to_vec(),
            ack_id: r.dword(3)?,
        })
    }
}

/// `GROUP_DESTROY`: DWORD group id, DWORD ack id. After this the group
/// id is permanently retired within the session.
pub struct GroupDestroyMsg {
    pub group_id: u32,
    pub ack_id: u32,
}

impl GroupDestroyMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = PacketBuilder::new(MSG_GROUP_DESTROY);
        b.dword(self.group_id).dword(self.ack_id);
        b.finish()
    }

    pub fn decode(r: &PacketReader<'_>) -> Result<GroupDestroyMsg, PacketError> {
        Ok(GroupDestroyMsg {
            group_id: r.dword(0)?,
            ack_id: r.dword(1)?,
        })
    }
}
