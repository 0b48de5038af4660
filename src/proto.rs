//! Inbound protocol handlers.
//!
//! One handler per message id, dispatched from the socket tasks. A
//! handler returning `Err` is a protocol violation and kills the
//! connection it arrived on; protocol failures are never surfaced to
//! the caller as typed errors. Handlers follow the lock discipline of
//! session.rs: mutate under the lock, release it around every call
//! into the application, re-verify on reacquire.

use crate::error::{PacketError, SessionError};
use crate::event::DestroyReason;
use crate::group::GroupRecord;
use crate::io;
use crate::message::*;
use crate::ops::PendingOp;
use crate::packet::PacketReader;
use crate::peer::{PeerRecord, PeerState};
use crate::session::{SessionPhase, SessionShared};
use crate::types::*;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Dispatch one framed packet that arrived on a peer's TCP stream.
pub(crate) fn handle_frame(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    frame: &[u8],
) -> Result<(), PacketError> {
    let r = PacketReader::parse(frame)?;
    trace!(peer_id, msg = msg_name(r.msg_id()), "frame");
    match r.msg_id() {
        MSG_CONNECT_HOST => handle_connect_host(shared, peer_id, &r),
        MSG_CONNECT_HOST_OK => handle_connect_host_ok(shared, peer_id, &r),
        MSG_CONNECT_HOST_FAIL => handle_connect_host_fail(shared, peer_id, &r),
        MSG_CONNECT_PEER => handle_connect_peer(shared, peer_id, &r),
        MSG_CONNECT_PEER_OK => handle_connect_peer_ok(shared, peer_id, &r),
        MSG_CONNECT_PEER_FAIL => handle_connect_peer_fail(shared, peer_id, &r),
        MSG_MESSAGE => handle_message(shared, peer_id, &r),
        MSG_PLAYERINFO => handle_playerinfo(shared, peer_id, &r),
        MSG_ACK => handle_ack(shared, peer_id, &r),
        MSG_APPDESC => handle_appdesc(shared, peer_id, &r),
        MSG_DESTROY_PEER => handle_destroy_peer(shared, peer_id, &r),
        MSG_TERMINATE_SESSION => handle_terminate_session(shared, peer_id, &r),
        MSG_GROUP_CREATE => handle_group_create(shared, peer_id, &r),
        MSG_GROUP_DESTROY => handle_group_destroy(shared, peer_id, &r),
        other => {
            warn!(peer_id, msg = other, "unexpected message on peer stream");
            Err(PacketError::Malformed)
        }
    }
}

/// Dispatch a datagram from the session UDP socket (best-effort
/// application messages, unicast enumeration requests).
pub(crate) fn handle_udp_frame(shared: &Arc<SessionShared>, frame: &[u8], from: SocketAddrV4) {
    let Ok(r) = PacketReader::parse(frame) else {
        return;
    };
    match r.msg_id() {
        MSG_MESSAGE => {
            let Ok(msg) = AppMessage::decode(&r) else {
                return;
            };
            let known = {
                let st = shared.lock();
                st.in_session()
                    && st
                        .peer_by_player(msg.sender)
                        .and_then(|id| st.peers.get(&id))
                        .map(|p| p.state == PeerState::Connected)
                        .unwrap_or(false)
            };
            // A sender we do not know (yet, or anymore) is a race
            // inherent to best-effort delivery; drop silently.
            if known {
                shared.deliver_payload(msg.sender, msg.payload);
            }
        }
        MSG_HOST_ENUM_REQUEST => {
            if let Ok(req) = HostEnumRequest::decode(&r) {
                handle_enum_request(shared, req, from);
            }
        }
        _ => {}
    }
}

// =============================================================================
// DISCOVERY (HOST SIDE)
// =============================================================================

pub(crate) fn handle_enum_request(
    shared: &Arc<SessionShared>,
    req: HostEnumRequest,
    from: SocketAddrV4,
) {
    // Filter before bothering the application: wrong-application
    // queries emit no event at all.
    {
        let st = shared.lock();
        if st.phase != SessionPhase::Hosting {
            return;
        }
        if let Some(filter) = req.application {
            if filter != st.desc.application {
                return;
            }
        }
    }

    let response_data = shared.handler.enum_hosts_query(req.user_data.as_deref(), from);

    let (frame, udp) = {
        let st = shared.lock();
        if st.phase != SessionPhase::Hosting {
            return;
        }
        let response = HostEnumResponse {
            instance: st.desc.instance,
            application: st.desc.application,
            max_players: st.desc.max_players,
            current_players: st.current_players(),
            session_name: st.desc.session_name.clone(),
            application_data: if st.desc.application_data.is_empty() {
                None
            } else {
                Some(st.desc.application_data.clone())
            },
            response_data,
            tick: req.tick,
        };
        (response.encode(), st.udp.clone())
    };
    if let Some(udp) = udp {
        let _ = udp.try_send_to(&frame, std::net::SocketAddr::V4(from));
    }
}

// =============================================================================
// JOIN PROTOCOL: HOST SIDE
// =============================================================================

fn handle_connect_host(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = ConnectHost::decode(r)?;

    enum Verdict {
        Fail(u32),
        Indicate(Option<Vec<u8>>, SocketAddrV4),
    }

    let verdict = {
        let st = shared.lock();
        let Some(p) = st.peers.get(&peer_id) else {
            return Ok(());
        };
        if p.state != PeerState::Accepted {
            return Err(PacketError::Malformed);
        }
        let from = p.addr;

        // Address tie: a join request from an address the host is still
        // trying to connect out to supersedes the older attempt.
        let stale: Vec<u64> = if st.phase == SessionPhase::Hosting {
            st.peers
                .iter()
                .filter(|(id, q)| {
                    **id != peer_id
                        && q.addr.ip() == from.ip()
                        && matches!(
                            q.state,
                            PeerState::ConnectingHost
                                | PeerState::RequestingHost
                                | PeerState::ConnectingPeer
                                | PeerState::RequestingPeer
                        )
                })
                .map(|(id, _)| *id)
                .collect()
        } else {
            Vec::new()
        };
        drop(st);
        for id in stale {
            debug!(old = id, new = peer_id, "dropping superseded connect attempt");
            shared.destroy_peer_record(id, None, SessionError::ConnectionLost);
        }

        let mut st = shared.lock();
        let verdict = if st.phase != SessionPhase::Hosting {
            Verdict::Fail(ERR_GENERIC)
        } else if msg.application != st.desc.application {
            Verdict::Fail(ERR_INVALID_APPLICATION)
        } else if msg.instance.is_some() && msg.instance != Some(st.desc.instance) {
            Verdict::Fail(ERR_INVALID_INSTANCE)
        } else if st.desc.password.is_some() && msg.password != st.desc.password {
            Verdict::Fail(ERR_INVALID_PASSWORD)
        } else if st.desc.max_players != 0 && st.current_players() + 1 > st.desc.max_players {
            Verdict::Fail(ERR_SESSION_FULL)
        } else {
            Verdict::Indicate(msg.connect_data.clone(), from)
        };

        let Some(p) = st.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        match &verdict {
            Verdict::Fail(code) => {
                debug!(peer_id, code = *code, "join rejected");
                p.enqueue_final(
                    ConnectHostFail {
                        code: *code,
                        reply_data: None,
                    }
                    .encode(),
                );
                p.state = PeerState::Closing;
                return Ok(());
            }
            Verdict::Indicate(..) => {
                p.state = PeerState::Indicating;
                p.player_name = msg.player_name.clone();
                p.player_data = msg.player_data.clone();
            }
        }
        verdict
    };

    let Verdict::Indicate(connect_data, from) = verdict else {
        return Ok(());
    };

    // Admission is the application's call; it may block for as long as
    // it likes, so the lock is released around it.
    let reply = shared.handler.indicate_connect(connect_data.as_deref(), from);

    let created = {
        let mut st = shared.lock();
        if st.phase != SessionPhase::Hosting {
            return Ok(());
        }
        let Some(p) = st.peers.get(&peer_id) else {
            return Ok(()); // gone while the application deliberated
        };
        if p.state != PeerState::Indicating {
            return Ok(());
        }

        if reply.reject {
            debug!(peer_id, "application vetoed join");
            let p = st.peers.get_mut(&peer_id).expect("verified above");
            p.enqueue_final(
                ConnectHostFail {
                    code: ERR_HOST_REJECTED,
                    reply_data: reply.reply_data.clone(),
                }
                .encode(),
            );
            p.state = PeerState::Closing;
            None
        } else {
            let player_id = st.alloc_player_id();
            let peers: Vec<PeerEntry> = st
                .peers
                .iter()
                .filter(|(id, q)| **id != peer_id && q.state == PeerState::Connected)
                .map(|(_, q)| PeerEntry {
                    player_id: q.player_id,
                    addr: q.addr,
                })
                .collect();
            let ok = ConnectHostOk {
                instance: st.desc.instance,
                host_player_id: st.host_player_id,
                player_id,
                peers,
                reply_data: reply.reply_data.clone(),
                host_name: st.local_name.clone(),
                host_data: st.local_data.clone(),
                max_players: st.desc.max_players,
                session_name: st.desc.session_name.clone(),
                password: st.desc.password.clone().unwrap_or_default(),
                application_data: st.desc.application_data.clone(),
            };
            let p = st.peers.get_mut(&peer_id).expect("verified above");
            p.state = PeerState::Connected;
            p.player_id = player_id;
            p.enqueue(ok.encode(), 0, None);
            st.player_to_peer.insert(player_id, peer_id);
            debug!(peer_id, player_id, "player admitted");
            Some(player_id)
        }
    };

    if let Some(player_id) = created {
        shared.dispatch_create_player_peer(peer_id, player_id, reply.player_ctx);
    }
    Ok(())
}

// =============================================================================
// JOIN PROTOCOL: JOINER SIDE
// =============================================================================

fn handle_connect_host_ok(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = ConnectHostOk::decode(r)?;

    let attempts = {
        let mut st = shared.lock();
        {
            let Some(p) = st.peers.get(&peer_id) else {
                return Ok(());
            };
            if p.state != PeerState::RequestingHost
                || st.phase != SessionPhase::ConnectingToHost
                || st.connect.is_none()
            {
                return Err(PacketError::Malformed);
            }
        }

        st.desc.instance = msg.instance;
        st.desc.max_players = msg.max_players;
        st.desc.session_name = msg.session_name;
        st.desc.password = if msg.password.is_empty() {
            None
        } else {
            Some(msg.password)
        };
        st.desc.application_data = msg.application_data;
        st.host_player_id = msg.host_player_id;
        st.local_player_id = msg.player_id;
        st.phase = SessionPhase::ConnectingToPeers;

        {
            let p = st.peers.get_mut(&peer_id).expect("verified above");
            p.state = PeerState::Connected;
            p.player_id = msg.host_player_id;
            p.player_name = msg.host_name;
            p.player_data = msg.host_data;
        }
        st.player_to_peer.insert(msg.host_player_id, peer_id);

        if let Some(cs) = st.connect.as_mut() {
            cs.reply_data = msg.reply_data;
        }

        let Some(local_addr) = st.local_addr else {
            return Err(PacketError::Malformed);
        };
        let mut attempts = Vec::with_capacity(msg.peers.len());
        for entry in &msg.peers {
            let id = st.alloc_peer_id();
            let mut record = PeerRecord::new(PeerState::ConnectingPeer, entry.addr);
            record.player_id = entry.player_id;
            st.peers.insert(id, record);
            if let Some(cs) = st.connect.as_mut() {
                cs.pending_edges.insert(id);
            }
            attempts.push((id, entry.addr, local_addr));
        }
        debug!(
            player_id = msg.player_id,
            edges = attempts.len(),
            "host accepted; completing mesh"
        );
        attempts
    };

    for (id, addr, local_addr) in attempts {
        let task = io::spawn_connect_attempt(shared, id, addr, local_addr);
        let mut st = shared.lock();
        if let Some(p) = st.peers.get_mut(&id) {
            p.tasks.push(task);
        }
    }

    connect_check(shared);
    Ok(())
}

fn handle_connect_host_fail(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = ConnectHostFail::decode(r)?;
    {
        let st = shared.lock();
        let Some(p) = st.peers.get(&peer_id) else {
            return Ok(());
        };
        if p.state != PeerState::RequestingHost {
            return Err(PacketError::Malformed);
        }
    }
    let err = SessionError::from_wire_code(msg.code)
        .err()
        .unwrap_or(SessionError::Rejected(ERR_GENERIC));
    connect_fail(shared, err, msg.reply_data);
    Ok(())
}

fn handle_connect_peer(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = ConnectPeer::decode(r)?;

    let created = {
        let mut st = shared.lock();
        let Some(p) = st.peers.get(&peer_id) else {
            return Ok(());
        };
        if p.state != PeerState::Accepted {
            return Err(PacketError::Malformed);
        }

        let in_session = st.in_session() || st.phase == SessionPhase::ConnectingToPeers;
        let fail_code = if !in_session || st.phase == SessionPhase::Hosting {
            // Mesh edges only ever land on non-host peers.
            Some(ERR_GENERIC)
        } else if msg.application != st.desc.application {
            Some(ERR_INVALID_APPLICATION)
        } else if msg.instance != st.desc.instance {
            Some(ERR_INVALID_INSTANCE)
        } else if st.desc.password.as_deref().unwrap_or("") != msg.password {
            Some(ERR_INVALID_PASSWORD)
        } else if st.player_to_peer.contains_key(&msg.player_id) {
            Some(ERR_GENERIC)
        } else {
            None
        };

        if let Some(code) = fail_code {
            debug!(peer_id, code, "mesh edge rejected");
            let p = st.peers.get_mut(&peer_id).expect("verified above");
            p.enqueue_final(ConnectPeerFail { code }.encode());
            p.state = PeerState::Closing;
            None
        } else {
            let ok = ConnectPeerOk {
                player_name: st.local_name.clone(),
                player_data: st.local_data.clone(),
            };
            let p = st.peers.get_mut(&peer_id).expect("verified above");
            p.state = PeerState::Connected;
            p.player_id = msg.player_id;
            p.player_name = msg.player_name;
            p.player_data = msg.player_data;
            p.enqueue(ok.encode(), 0, None);
            st.player_to_peer.insert(msg.player_id, peer_id);
            debug!(peer_id, player_id = msg.player_id, "mesh edge accepted");
            Some(msg.player_id)
        }
    };

    if let Some(player_id) = created {
        shared.dispatch_create_player_peer(peer_id, player_id, 0);
    }
    Ok(())
}

fn handle_connect_peer_ok(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = ConnectPeerOk::decode(r)?;
    {
        let mut st = shared.lock();
        let Some(p) = st.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        if p.state != PeerState::RequestingPeer {
            return Err(PacketError::Malformed);
        }
        p.state = PeerState::Connected;
        p.player_name = msg.player_name;
        p.player_data = msg.player_data;
        let player_id = p.player_id;
        st.player_to_peer.insert(player_id, peer_id);
        if let Some(cs) = st.connect.as_mut() {
            cs.pending_edges.remove(&peer_id);
        }
    }
    connect_check(shared);
    Ok(())
}

fn handle_connect_peer_fail(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = ConnectPeerFail::decode(r)?;
    {
        let st = shared.lock();
        let Some(p) = st.peers.get(&peer_id) else {
            return Ok(());
        };
        if p.state != PeerState::RequestingPeer {
            return Err(PacketError::Malformed);
        }
    }
    // One failed edge sinks the whole join.
    connect_fail(
        shared,
        SessionError::from_wire_code(msg.code)
            .err()
            .unwrap_or(SessionError::Rejected(ERR_GENERIC)),
        None,
    );
    Ok(())
}

/// Called whenever a mesh edge resolves: once every edge is in, the
/// join is complete and the application hears about it in the fixed
/// order self, host, connect-complete, everyone else.
pub(crate) fn connect_check(shared: &Arc<SessionShared>) {
    let finalize = {
        let mut st = shared.lock();
        if st.phase != SessionPhase::ConnectingToPeers {
            return;
        }
        match st.connect.as_ref() {
            Some(cs) if cs.pending_edges.is_empty() => {}
            _ => return,
        }
        let cs = st.connect.take().expect("checked above");
        st.phase = SessionPhase::Connected;
        if cs.handle != 0 {
            st.ops.remove(cs.handle);
        }
        let local = st.local_player_id;
        let host_player = st.host_player_id;
        let others: Vec<(u64, PlayerId)> = st
            .peers
            .iter()
            .filter(|(id, p)| **id != cs.host_peer_id && p.state == PeerState::Connected)
            .map(|(id, p)| (*id, p.player_id))
            .collect();
        (cs, local, host_player, others)
    };
    let (cs, local, host_player, others) = finalize;

    debug!(player_id = local, "join complete");
    shared.dispatch_create_player_local(local, cs.player_ctx);
    shared.dispatch_create_player_peer(cs.host_peer_id, host_player, 0);
    shared.handler.connect_complete(
        cs.handle,
        cs.async_ctx,
        Ok(()),
        cs.reply_data.as_deref(),
        local,
    );
    for (peer_id, player) in others {
        shared.dispatch_create_player_peer(peer_id, player, 0);
    }
    if let Some(w) = cs.waiter {
        let _ = w.send(Ok(()));
    }
}

/// Abort an in-flight join: roll back every connection it opened and
/// deliver the (single) connect completion with `err`.
pub(crate) fn connect_fail(shared: &Arc<SessionShared>, err: SessionError, reply: Option<Vec<u8>>) {
    let rollback = {
        let mut st = shared.lock();
        let Some(cs) = st.connect.take() else {
            return;
        };
        st.phase = SessionPhase::ConnectFailed;
        if cs.handle != 0 {
            st.ops.remove(cs.handle);
        }
        st.local_player_id = 0;
        st.host_player_id = 0;
        st.player_to_peer.clear();
        let peer_ids: Vec<u64> = st.peers.keys().copied().collect();
        (cs, peer_ids)
    };
    let (cs, peer_ids) = rollback;

    debug!(?err, "connect failed; rolling back");
    for id in peer_ids {
        // None of these ever announced a create-player, so they go
        // quietly.
        shared.destroy_peer_record(id, None, err.clone());
    }
    let reply = reply.or(cs.reply_data);
    shared
        .handler
        .connect_complete(cs.handle, cs.async_ctx, Err(err.clone()), reply.as_deref(), 0);
    if let Some(w) = cs.waiter {
        let _ = w.send(Err(err));
    }
}

// =============================================================================
// IN-SESSION TRAFFIC
// =============================================================================

fn handle_message(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = AppMessage::decode(r)?;
    let from = {
        let st = shared.lock();
        let Some(p) = st.peers.get(&peer_id) else {
            return Ok(());
        };
        match p.state {
            PeerState::Connected => p.player_id,
            // A closing peer still drains its own queue at us, but its
            // application payloads are no longer delivered.
            PeerState::Closing => return Ok(()),
            _ => return Err(PacketError::Malformed),
        }
    };
    shared.deliver_payload(from, msg.payload);
    Ok(())
}

fn handle_playerinfo(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = PlayerInfo::decode(r)?;
    let announce = {
        let mut st = shared.lock();
        let Some(p) = st.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        match p.state {
            PeerState::Connected => {}
            PeerState::Closing => return Ok(()),
            _ => return Err(PacketError::Malformed),
        }
        if msg.player_id != p.player_id {
            return Err(PacketError::Malformed);
        }
        p.player_name = msg.player_name;
        p.player_data = msg.player_data;
        p.enqueue(
            Ack {
                ack_id: msg.ack_id,
                result: RESULT_OK,
                response: None,
            }
            .encode(),
            0,
            None,
        );
        (p.player_id, p.player_ctx)
    };
    shared.handler.peer_info(announce.0, announce.1);
    Ok(())
}

fn handle_ack(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = Ack::decode(r)?;
    let callback = {
        let mut st = shared.lock();
        let Some(p) = st.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        p.take_ack(msg.ack_id)
    };
    match callback {
        Some(cb) => cb(msg.result, msg.response),
        None => debug!(peer_id, ack_id = msg.ack_id, "stray ack"),
    }
    Ok(())
}

fn handle_appdesc(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = AppDescUpdate::decode(r)?;
    {
        let mut st = shared.lock();
        let host_player = st.host_player_id;
        let Some(p) = st.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        match p.state {
            PeerState::Connected => {}
            PeerState::Closing => return Ok(()),
            _ => return Err(PacketError::Malformed),
        }
        // Only the host may rewrite the session description.
        if p.player_id != host_player {
            return Err(PacketError::Malformed);
        }
        p.enqueue(
            Ack {
                ack_id: msg.ack_id,
                result: RESULT_OK,
                response: None,
            }
            .encode(),
            0,
            None,
        );
        st.desc.max_players = msg.max_players;
        st.desc.session_name = msg.session_name;
        st.desc.password = if msg.password.is_empty() {
            None
        } else {
            Some(msg.password)
        };
        st.desc.application_data = msg.application_data;
    }
    // The updated description is already visible to
    // `get_application_desc` from inside the event.
    shared.handler.app_desc_changed();
    Ok(())
}

// =============================================================================
// TEARDOWN MESSAGES
// =============================================================================

fn handle_destroy_peer(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = DestroyPeerMsg::decode(r)?;
    enum Act {
        Victim(Vec<u8>),
        Eject(u64),
        Ignore,
    }
    let act = {
        let st = shared.lock();
        let Some(p) = st.peers.get(&peer_id) else {
            return Ok(());
        };
        // Ejections only ever come from the host.
        if p.player_id == 0 || p.player_id != st.host_player_id {
            return Err(PacketError::Malformed);
        }
        if msg.player_id == st.local_player_id {
            Act::Victim(msg.data)
        } else {
            match st.peer_by_player(msg.player_id) {
                Some(target) => Act::Eject(target),
                None => Act::Ignore,
            }
        }
    };
    match act {
        Act::Victim(data) => {
            debug!("ejected from session by host");
            remote_teardown(
                shared,
                Ok(()),
                Some(data),
                DestroyReason::HostDestroyedPlayer,
            );
        }
        Act::Eject(target) => {
            shared.destroy_peer_record(
                target,
                Some(DestroyReason::HostDestroyedPlayer),
                SessionError::ConnectionLost,
            );
        }
        Act::Ignore => {}
    }
    Ok(())
}

fn handle_terminate_session(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = TerminateSessionMsg::decode(r)?;
    {
        let st = shared.lock();
        let Some(p) = st.peers.get(&peer_id) else {
            return Ok(());
        };
        if p.player_id == 0 || p.player_id != st.host_player_id {
            return Err(PacketError::Malformed);
        }
    }
    remote_teardown(shared, Ok(()), Some(msg.data), DestroyReason::SessionTerminated);
    Ok(())
}

// =============================================================================
// GROUPS
// =============================================================================

fn handle_group_create(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = GroupCreateMsg::decode(r)?;
    let announce = {
        let mut st = shared.lock();
        {
            let Some(p) = st.peers.get_mut(&peer_id) else {
                return Ok(());
            };
            if !matches!(p.state, PeerState::Connected | PeerState::Closing) {
                return Err(PacketError::Malformed);
            }
            p.enqueue(
                Ack {
                    ack_id: msg.ack_id,
                    result: RESULT_OK,
                    response: None,
                }
                .encode(),
                0,
                None,
            );
        }
        // A retired id stays retired, even if a slow peer re-announces
        // the group after its destruction.
        if st.destroyed_groups.contains(&msg.group_id) || st.groups.contains_key(&msg.group_id) {
            None
        } else {
            st.groups.insert(
                msg.group_id,
                GroupRecord::new(msg.name.clone(), msg.data.clone(), 0),
            );
            Some(msg.group_id)
        }
    };
    if let Some(group_id) = announce {
        let ctx = shared.handler.group_create(group_id, 0);
        if let Some(g) = shared.lock().groups.get_mut(&group_id) {
            g.ctx = ctx;
        }
    }
    Ok(())
}

fn handle_group_destroy(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    r: &PacketReader<'_>,
) -> Result<(), PacketError> {
    let msg = GroupDestroyMsg::decode(r)?;
    let announce = {
        let mut st = shared.lock();
        {
            let Some(p) = st.peers.get_mut(&peer_id) else {
                return Ok(());
            };
            if !matches!(p.state, PeerState::Connected | PeerState::Closing) {
                return Err(PacketError::Malformed);
            }
            p.enqueue(
                Ack {
                    ack_id: msg.ack_id,
                    result: RESULT_OK,
                    response: None,
                }
                .encode(),
                0,
                None,
            );
        }
        st.destroyed_groups.insert(msg.group_id);
        st.groups.remove(&msg.group_id).map(|g| (msg.group_id, g.ctx))
    };
    if let Some((group_id, ctx)) = announce {
        shared
            .handler
            .group_destroy(group_id, ctx, DestroyReason::Normal);
    }
    Ok(())
}

// =============================================================================
// CONNECTION LOSS AND REMOTE TEARDOWN
// =============================================================================

/// The reader or writer task for `peer_id` hit EOF or an error.
/// `clean` marks an orderly remote shutdown (affects the destroy
/// reason the application sees).
pub(crate) fn peer_connection_lost(shared: &Arc<SessionShared>, peer_id: u64, clean: bool) {
    enum Act {
        ConnectFail,
        SessionLost,
        Destroy,
    }
    let act = {
        let mut st = shared.lock();
        let Some(p) = st.peers.get_mut(&peer_id) else {
            return;
        };
        if clean {
            p.remote_closed = true;
        }
        let state = p.state;
        let player_id = p.player_id;
        match st.phase {
            SessionPhase::ConnectingToHost | SessionPhase::ConnectingToPeers => {
                // Losing the host or any mesh edge sinks the join;
                // losing an unrelated inbound connection does not.
                if state == PeerState::Accepted {
                    Act::Destroy
                } else {
                    Act::ConnectFail
                }
            }
            SessionPhase::Connected => {
                if player_id != 0 && player_id == st.host_player_id {
                    Act::SessionLost
                } else {
                    Act::Destroy
                }
            }
            _ => Act::Destroy,
        }
    };
    match act {
        Act::ConnectFail => connect_fail(shared, SessionError::ConnectionLost, None),
        Act::SessionLost => {
            debug!("host connection lost; session over");
            remote_teardown(
                shared,
                Err(SessionError::ConnectionLost),
                None,
                DestroyReason::ConnectionLost,
            );
        }
        Act::Destroy => shared.destroy_peer_record(peer_id, None, SessionError::ConnectionLost),
    }
}

/// Remotely-triggered end of session: host termination, host loss, or
/// local ejection. Tears everything down synchronously; the local
/// player's destroy event goes last.
pub(crate) fn remote_teardown(
    shared: &Arc<SessionShared>,
    result: Result<(), SessionError>,
    data: Option<Vec<u8>>,
    reason: DestroyReason,
) {
    let Some((ops, io_tasks, peer_ids, local)) = ({
        let mut st = shared.lock();
        if matches!(st.phase, SessionPhase::Closing | SessionPhase::Terminated) {
            None
        } else {
            st.phase = SessionPhase::Closing;
            let ops = st.ops.drain();
            for (_, op) in &ops {
                if let PendingOp::Enum { cancel, .. } = op {
                    let _ = cancel.send(true);
                }
            }
            let io_tasks = std::mem::take(&mut st.io_tasks);
            let peer_ids: Vec<u64> = st.peers.keys().copied().collect();
            let local =
                (st.local_player_id != 0).then_some((st.local_player_id, st.local_player_ctx));
            Some((ops, io_tasks, peer_ids, local))
        }
    }) else {
        return;
    };

    for t in io_tasks {
        t.abort();
    }
    for (handle, op) in ops {
        match op {
            PendingOp::Enum { ctx, sync, .. } => {
                if !sync {
                    shared
                        .handler
                        .async_op_complete(handle, ctx, Err(SessionError::UserCancel));
                }
            }
            PendingOp::Connect { .. } => {}
            PendingOp::Send { ctx, waiter, .. } => match waiter {
                Some(w) => {
                    let _ = w.send(Err(SessionError::ConnectionLost));
                }
                None => shared.handler.send_complete(
                    handle,
                    ctx,
                    Err(SessionError::ConnectionLost),
                ),
            },
            PendingOp::PlayerInfo { ctx, waiter, .. } => match waiter {
                Some(w) => {
                    let _ = w.send(Err(SessionError::ConnectionLost));
                }
                None => shared.handler.async_op_complete(
                    handle,
                    ctx,
                    Err(SessionError::ConnectionLost),
                ),
            },
        }
    }

    shared.handler.terminate_session(result, data.as_deref());

    for id in peer_ids {
        shared.destroy_peer_record(id, None, SessionError::ConnectionLost);
    }

    let groups: Vec<(GroupId, UserContext)> = {
        let mut st = shared.lock();
        let groups: Vec<(GroupId, UserContext)> =
            st.groups.drain().map(|(id, g)| (id, g.ctx)).collect();
        for (id, _) in &groups {
            st.destroyed_groups.insert(*id);
        }
        groups
    };
    for (id, ctx) in groups {
        shared.handler.group_destroy(id, ctx, reason);
    }

    if let Some((player, ctx)) = local {
        shared.handler.destroy_player(player, ctx, reason);
    }

    let mut st = shared.lock();
    st.phase = SessionPhase::Terminated;
    st.held_buffers.clear();
}
