//! Session core: state, public API, and event dispatch.
//!
//! All session, peer, and group state lives behind one mutex inside
//! [`SessionShared`]. Every externally-invoked operation, every socket
//! task, and every protocol handler locks it before touching state,
//! with one exception: the lock is always released around calls into
//! the application handler, and the caller re-verifies whatever it
//! relied on after reacquiring (peers may have vanished, the phase may
//! have moved on).

use crate::enumerator::{self, EnumHostsParams};
use crate::error::SessionError;
use crate::event::{DestroyReason, ReceiveAction, SessionHandler};
use crate::group::GroupRecord;
use crate::handle::HandleAllocator;
use crate::io;
use crate::message::*;
use crate::ops::{OpRegistry, PendingOp};
use crate::peer::{PeerRecord, PeerState};
use crate::proto;
use crate::sendqueue::SendCompletion;
use crate::types::*;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `close` waits for peers to drain before forcing them down.
const CLOSE_DEADLINE: Duration = Duration::from_secs(5);

/// How long `close` waits for in-flight enumerations to observe their
/// cancellation.
const OPS_DEADLINE: Duration = Duration::from_secs(2);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Local binding configuration, fixed for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bind_ip: Ipv4Addr,
    /// TCP listener and UDP port. 0 picks an ephemeral pair.
    pub port: u16,
    /// Broadcast-receive port for host discovery.
    pub discovery_port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port: 0,
            discovery_port: DEFAULT_DISCOVERY_PORT,
        }
    }
}

/// Parameters for hosting a new session.
#[derive(Debug, Clone)]
pub struct HostParams {
    pub application: Guid,
    /// Instance GUID; a random one is minted when absent.
    pub instance: Option<Guid>,
    pub session_name: String,
    pub password: Option<String>,
    pub application_data: Vec<u8>,
    /// 0 = unlimited.
    pub max_players: u32,
}

/// Parameters for joining an existing session.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host_addr: SocketAddrV4,
    pub application: Guid,
    /// Optional instance filter; the host rejects a mismatch.
    pub instance: Option<Guid>,
    pub password: Option<String>,
    /// Opaque request blob surfaced to the host's `indicate_connect`.
    pub connect_data: Option<Vec<u8>>,
    pub player_ctx: UserContext,
    pub async_ctx: UserContext,
    pub flags: u32,
}

// =============================================================================
// INTERNAL STATE
// =============================================================================

/// One-way lifecycle of the session instance. Reaching `Terminated` is
/// final; a fresh instance is needed to go again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionPhase {
    Initialised,
    Hosting,
    ConnectingToHost,
    ConnectingToPeers,
    ConnectFailed,
    Connected,
    Closing,
    Terminated,
}

/// Bookkeeping for the (single) outstanding connect.
pub(crate) struct ConnectState {
    /// Handle exposed to the caller; 0 in sync mode.
    pub handle: AsyncHandle,
    pub async_ctx: UserContext,
    pub player_ctx: UserContext,
    pub instance_filter: Option<Guid>,
    pub password: Option<String>,
    pub connect_data: Option<Vec<u8>>,
    pub host_peer_id: u64,
    /// Mesh edges not yet confirmed.
    pub pending_edges: HashSet<u64>,
    pub reply_data: Option<Vec<u8>>,
    pub waiter: Option<oneshot::Sender<Result<(), SessionError>>>,
}

pub(crate) struct SessionState {
    pub phase: SessionPhase,
    pub desc: ApplicationDesc,

    pub local_name: String,
    pub local_data: Vec<u8>,
    pub local_player_id: PlayerId,
    pub local_player_ctx: UserContext,
    pub host_player_id: PlayerId,

    pub next_player_id: PlayerId,
    pub next_peer_id: u64,
    pub peers: HashMap<u64, PeerRecord>,
    pub player_to_peer: HashMap<PlayerId, u64>,

    pub groups: HashMap<GroupId, GroupRecord>,
    pub destroyed_groups: HashSet<GroupId>,
    pub next_group_seq: u16,

    pub handles: HandleAllocator,
    pub ops: OpRegistry,

    pub bind_ip: Ipv4Addr,
    pub discovery_port: u16,
    pub local_addr: Option<SocketAddrV4>,
    pub udp: Option<Arc<UdpSocket>>,
    pub io_tasks: Vec<JoinHandle<()>>,

    pub connect: Option<ConnectState>,

    pub held_buffers: HashMap<BufferHandle, Vec<u8>>,
    pub next_buffer: BufferHandle,
}

impl SessionState {
    /// Allocate a session-wide player id; wraps and skips 0.
    pub fn alloc_player_id(&mut self) -> PlayerId {
        let id = self.next_player_id;
        self.next_player_id = self.next_player_id.wrapping_add(1);
        if self.next_player_id == 0 {
            self.next_player_id = 1;
        }
        id
    }

    /// Internal peer ids are never reused within the instance.
    pub fn alloc_peer_id(&mut self) -> u64 {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        id
    }

    pub fn in_session(&self) -> bool {
        matches!(self.phase, SessionPhase::Hosting | SessionPhase::Connected)
    }

    /// Local player plus every fully-joined peer.
    pub fn current_players(&self) -> u32 {
        1 + self
            .peers
            .values()
            .filter(|p| matches!(p.state, PeerState::Connected))
            .count() as u32
    }

    pub fn peer_by_player(&self, player: PlayerId) -> Option<u64> {
        self.player_to_peer.get(&player).copied()
    }
}

pub(crate) struct SessionShared {
    pub handler: Arc<dyn SessionHandler>,
    pub state: Mutex<SessionState>,
    /// Millisecond tick origin for enumeration latency stamps.
    pub epoch: Instant,
    /// Signalled whenever a peer record is removed; close parks here.
    pub peers_changed: Notify,
}

impl SessionShared {
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    pub fn tick_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    // -------------------------------------------------------------------
    // Event dispatch. Callers must NOT hold the state lock.
    // -------------------------------------------------------------------

    /// Dispatch `create_player` for a remote and store the context the
    /// application returns. If the peer vanished while the handler ran,
    /// the matching `destroy_player` is delivered here so the pair
    /// stays balanced.
    pub fn dispatch_create_player_peer(&self, peer_id: u64, player: PlayerId, seed: UserContext) {
        let ctx = self.handler.create_player(player, seed);
        let vanished = {
            let mut st = self.lock();
            match st.peers.get_mut(&peer_id) {
                Some(p) => {
                    p.player_ctx = ctx;
                    p.reached_connected = true;
                    false
                }
                None => true,
            }
        };
        if vanished {
            self.handler
                .destroy_player(player, ctx, DestroyReason::ConnectionLost);
        }
    }

    pub fn dispatch_create_player_local(&self, player: PlayerId, seed: UserContext) {
        let ctx = self.handler.create_player(player, seed);
        self.lock().local_player_ctx = ctx;
    }

    /// Remove a peer record and deliver everything it owes: pending
    /// acks fire with connection-lost, queued send completions fire
    /// with `op_result`, and `destroy_player` is announced when the
    /// peer ever reached `Connected`. `reason` None derives the reason
    /// from how the connection ended.
    pub fn destroy_peer_record(
        &self,
        peer_id: u64,
        reason: Option<DestroyReason>,
        op_result: SessionError,
    ) {
        let (acks, sends, announce) = {
            let mut st = self.lock();
            let Some(mut p) = st.peers.remove(&peer_id) else {
                return;
            };
            if p.player_id != 0 {
                st.player_to_peer.remove(&p.player_id);
            }
            p.abort_tasks();
            let acks = p.drain_acks();
            let sends = p.send_queue.cancel_all();
            let reason = reason.or(p.reason_hint).unwrap_or(if p.remote_closed {
                DestroyReason::Normal
            } else {
                DestroyReason::ConnectionLost
            });
            let announce = p
                .reached_connected
                .then_some((p.player_id, p.player_ctx, reason));
            debug!(peer_id, player = p.player_id, ?reason, "peer destroyed");
            (acks, sends, announce)
        };

        for ack in acks {
            ack(ERR_CONNECTION_LOST, None);
        }
        for send in sends {
            send(Err(op_result.clone()));
        }
        if let Some((player, ctx, reason)) = announce {
            self.handler.destroy_player(player, ctx, reason);
        }
        self.peers_changed.notify_waiters();
    }

    // -------------------------------------------------------------------
    // Operation completion plumbing.
    // -------------------------------------------------------------------

    /// Resolve a registered send operation exactly once.
    pub fn finish_send_op(&self, handle: AsyncHandle, result: Result<(), SessionError>) {
        let op = self.lock().ops.remove(handle);
        let Some(PendingOp::Send { ctx, waiter, .. }) = op else {
            return;
        };
        match waiter {
            Some(w) => {
                let _ = w.send(result);
            }
            None => self.handler.send_complete(handle, ctx, result),
        }
    }

    /// One ack of a peer-info update arrived (or failed). The operation
    /// completes on its first failure or once every ack is in.
    pub fn playerinfo_ack(&self, handle: AsyncHandle, peer_id: u64, ack_id: u32, code: u32) {
        let finished = {
            let mut st = self.lock();
            let Some(PendingOp::PlayerInfo { acks, .. }) = st.ops.get_mut(handle) else {
                return;
            };
            acks.retain(|e| *e != (peer_id, ack_id));
            let failed = code != RESULT_OK;
            if failed || acks.is_empty() {
                let result = SessionError::from_wire_code(code);
                match st.ops.remove(handle) {
                    Some(PendingOp::PlayerInfo { ctx, waiter, .. }) => {
                        Some((ctx, waiter, result))
                    }
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some((ctx, waiter, result)) = finished {
            match waiter {
                Some(w) => {
                    let _ = w.send(result);
                }
                None => self.handler.async_op_complete(handle, ctx, result),
            }
        }
    }

    /// Deliver an application payload (network or loopback) and manage
    /// buffer retention.
    pub fn deliver_payload(&self, from: PlayerId, payload: Vec<u8>) {
        let buffer = {
            let mut st = self.lock();
            if !st.in_session() {
                return;
            }
            let id = st.next_buffer;
            st.next_buffer += 1;
            id
        };
        if self.handler.receive(from, &payload, buffer) == ReceiveAction::Retain {
            self.lock().held_buffers.insert(buffer, payload);
        }
    }
}

/// Completion closure for a registered send; safe to drop unused.
pub(crate) fn send_completion(shared: &Arc<SessionShared>, handle: AsyncHandle) -> SendCompletion {
    let weak = Arc::downgrade(shared);
    Box::new(move |result| {
        if let Some(shared) = weak.upgrade() {
            shared.finish_send_op(handle, result);
        }
    })
}

// =============================================================================
// PUBLIC HANDLE
// =============================================================================

/// A peer-to-peer session instance.
///
/// `Session` is a cheap cloneable handle. The instance stays alive
/// until [`Session::close`] runs; dropping the last handle without
/// closing leaks the I/O tasks, exactly like abandoning any other
/// owning handle with an explicit close contract.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Create an initialised instance bound to nothing yet.
    pub fn new(handler: Arc<dyn SessionHandler>, config: SessionConfig) -> Session {
        crate::logging::init();
        let state = SessionState {
            phase: SessionPhase::Initialised,
            desc: ApplicationDesc::default(),
            local_name: String::new(),
            local_data: Vec::new(),
            local_player_id: 0,
            local_player_ctx: 0,
            host_player_id: 0,
            next_player_id: 1,
            next_peer_id: 1,
            peers: HashMap::new(),
            player_to_peer: HashMap::new(),
            groups: HashMap::new(),
            destroyed_groups: HashSet::new(),
            next_group_seq: 1,
            handles: HandleAllocator::new(),
            ops: OpRegistry::new(),
            bind_ip: config.bind_ip,
            discovery_port: config.discovery_port,
            local_addr: if config.port != 0 {
                // Recorded now so outgoing binds use it; sockets are
                // created on host/connect.
                Some(SocketAddrV4::new(config.bind_ip, config.port))
            } else {
                None
            },
            udp: None,
            io_tasks: Vec::new(),
            connect: None,
            held_buffers: HashMap::new(),
            next_buffer: 1,
        };
        Session {
            shared: Arc::new(SessionShared {
                handler,
                state: Mutex::new(state),
                epoch: Instant::now(),
                peers_changed: Notify::new(),
            }),
        }
    }

    // -------------------------------------------------------------------
    // Hosting and joining
    // -------------------------------------------------------------------

    /// Become the host of a new session. Dispatches `create_player` for
    /// the local player before returning.
    pub async fn host(&self, params: HostParams, player_ctx: UserContext) -> Result<(), SessionError> {
        if params.application.is_nil() {
            return Err(SessionError::InvalidArg("application GUID required"));
        }
        let (bind_ip, port, discovery_port) = {
            let st = self.shared.lock();
            if st.phase != SessionPhase::Initialised {
                return Err(SessionError::InvalidState);
            }
            (
                st.bind_ip,
                st.local_addr.map(|a| a.port()).unwrap_or(0),
                st.discovery_port,
            )
        };

        let (listener, udp, local_addr) = io::bind_session_sockets(bind_ip, port).await?;
        let discovery = io::bind_discovery(discovery_port).await?;

        let local_player_id = {
            let mut st = self.shared.lock();
            if st.phase != SessionPhase::Initialised {
                return Err(SessionError::InvalidState);
            }
            st.phase = SessionPhase::Hosting;
            st.desc.application = params.application;
            st.desc.instance = params.instance.unwrap_or_else(Guid::random);
            st.desc.session_name = params.session_name;
            st.desc.password = params.password;
            st.desc.application_data = params.application_data;
            st.desc.max_players = params.max_players;
            let id = st.alloc_player_id();
            st.local_player_id = id;
            st.host_player_id = id;
            st.local_addr = Some(local_addr);
            st.udp = Some(udp.clone());
            let tasks = vec![
                tokio::spawn(io::run_listener(self.shared.clone(), listener)),
                tokio::spawn(io::run_udp(self.shared.clone(), udp)),
                tokio::spawn(io::run_discovery(self.shared.clone(), discovery)),
            ];
            st.io_tasks = tasks;
            info!(
                instance = %st.desc.instance,
                addr = %local_addr,
                "hosting session \"{}\"",
                st.desc.session_name
            );
            id
        };

        self.shared
            .dispatch_create_player_local(local_player_id, player_ctx);
        Ok(())
    }

    /// Join the session hosted at `params.host_addr`. Returns the
    /// async-operation handle, or 0 when `CONNECT_SYNC` is set (the
    /// call then resolves with the join result; the `connect_complete`
    /// event is dispatched in both modes).
    pub async fn connect(&self, params: ConnectParams) -> Result<AsyncHandle, SessionError> {
        if params.application.is_nil() {
            return Err(SessionError::InvalidArg("application GUID required"));
        }
        let sync = params.flags & CONNECT_SYNC != 0;

        let (bind_ip, port) = {
            let st = self.shared.lock();
            if st.phase != SessionPhase::Initialised {
                return Err(SessionError::InvalidState);
            }
            (st.bind_ip, st.local_addr.map(|a| a.port()).unwrap_or(0))
        };
        let (listener, udp, local_addr) = io::bind_session_sockets(bind_ip, port).await?;

        let (handle, waiter_rx) = {
            let mut st = self.shared.lock();
            if st.phase != SessionPhase::Initialised {
                return Err(SessionError::InvalidState);
            }
            st.phase = SessionPhase::ConnectingToHost;
            st.desc.application = params.application;
            st.local_addr = Some(local_addr);
            st.udp = Some(udp.clone());
            st.io_tasks = vec![
                tokio::spawn(io::run_listener(self.shared.clone(), listener)),
                tokio::spawn(io::run_udp(self.shared.clone(), udp)),
            ];

            let handle = if sync { 0 } else { st.handles.new_connect() };
            let (waiter_tx, waiter_rx) = if sync {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            let peer_id = st.alloc_peer_id();
            let record = PeerRecord::new(PeerState::ConnectingHost, params.host_addr);
            st.peers.insert(peer_id, record);

            st.connect = Some(ConnectState {
                handle,
                async_ctx: params.async_ctx,
                player_ctx: params.player_ctx,
                instance_filter: params.instance,
                password: params.password,
                connect_data: params.connect_data,
                host_peer_id: peer_id,
                pending_edges: HashSet::new(),
                reply_data: None,
                waiter: waiter_tx,
            });
            if !sync {
                st.ops.insert(
                    handle,
                    PendingOp::Connect {
                        ctx: params.async_ctx,
                    },
                );
            }

            let task =
                io::spawn_connect_attempt(&self.shared, peer_id, params.host_addr, local_addr);
            if let Some(p) = st.peers.get_mut(&peer_id) {
                p.tasks.push(task);
            }
            info!(host = %params.host_addr, sync, "connecting to host");
            (handle, waiter_rx)
        };

        match waiter_rx {
            Some(rx) => {
                rx.await
                    .unwrap_or(Err(SessionError::UserCancel))
                    .map(|_| 0)
            }
            None => Ok(handle),
        }
    }

    /// Discover hosts over UDP broadcast (or unicast to a known
    /// address). Returns the operation handle, or 0 with
    /// `ENUM_HOSTS_SYNC` (which blocks until the schedule ends and
    /// dispatches no completion event).
    pub async fn enum_hosts(
        &self,
        params: EnumHostsParams,
        ctx: UserContext,
        flags: u32,
    ) -> Result<AsyncHandle, SessionError> {
        let sync = flags & ENUM_HOSTS_SYNC != 0;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (waiter_tx, waiter_rx) = if sync {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let (reg_handle, exposed) = {
            let mut st = self.shared.lock();
            if matches!(st.phase, SessionPhase::Closing | SessionPhase::Terminated) {
                return Err(SessionError::InvalidState);
            }
            let reg_handle = st.handles.new_enum();
            st.ops.insert(
                reg_handle,
                PendingOp::Enum {
                    ctx,
                    cancel: cancel_tx,
                    sync,
                },
            );
            let exposed = if sync { 0 } else { reg_handle };
            let discovery_port = st.discovery_port;
            tokio::spawn(enumerator::run(
                self.shared.clone(),
                reg_handle,
                exposed,
                ctx,
                params,
                discovery_port,
                cancel_rx,
                waiter_tx,
            ));
            (reg_handle, exposed)
        };
        debug!(handle = reg_handle, sync, "host enumeration started");

        match waiter_rx {
            Some(rx) => rx.await.unwrap_or(Err(SessionError::UserCancel)).map(|_| 0),
            None => Ok(exposed),
        }
    }

    // -------------------------------------------------------------------
    // Application traffic
    // -------------------------------------------------------------------

    /// Send `data` to a player, to the local player, or to everyone
    /// (`ALL_PLAYERS`). Exactly one completion is produced per call:
    /// the `send_complete` event for async sends, the return value when
    /// `SEND_SYNC` is set.
    pub async fn send_to(
        &self,
        target: PlayerId,
        data: &[u8],
        flags: u32,
        ctx: UserContext,
    ) -> Result<AsyncHandle, SessionError> {
        if data.is_empty() {
            return Err(SessionError::InvalidArg("empty payload"));
        }
        let sync = flags & SEND_SYNC != 0;
        let guaranteed = flags & SEND_GUARANTEED != 0;

        enum Mode {
            /// Single guaranteed target: completes on transmission.
            Tracked(oneshot::Receiver<Result<(), SessionError>>),
            TrackedAsync,
            /// Everything else completes as soon as it is handed off.
            Immediate,
        }

        let (exposed, mode, udp_targets, loopback, udp, frame) = {
            let mut st = self.shared.lock();
            if !st.in_session() {
                return Err(SessionError::InvalidState);
            }
            let local = st.local_player_id;
            let frame = AppMessage::encode(local, data, flags & SEND_WIRE_MASK);

            // Resolve targets.
            let mut remote: Vec<u64> = Vec::new();
            let mut loopback = false;
            if target == ALL_PLAYERS {
                remote.extend(
                    st.peers
                        .iter()
                        .filter(|(_, p)| p.state == PeerState::Connected)
                        .map(|(id, _)| *id),
                );
                loopback = flags & SEND_NOLOOPBACK == 0;
            } else if target == local {
                loopback = true;
            } else {
                let peer_id = st
                    .peer_by_player(target)
                    .ok_or(SessionError::PlayerNotFound)?;
                let p = st.peers.get(&peer_id).ok_or(SessionError::PlayerNotFound)?;
                if p.state != PeerState::Connected {
                    return Err(SessionError::ConnectionLost);
                }
                remote.push(peer_id);
            }

            let single_tracked = guaranteed && remote.len() == 1 && target != ALL_PLAYERS;
            let handle = st.handles.new_send();
            let exposed = if sync { 0 } else { handle };

            let mut udp_targets = Vec::new();
            if guaranteed {
                for peer_id in &remote {
                    let completion = single_tracked.then(|| send_completion(&self.shared, handle));
                    let queue_handle = if single_tracked { handle } else { 0 };
                    if let Some(p) = st.peers.get_mut(peer_id) {
                        p.enqueue(frame.clone(), queue_handle, completion);
                    }
                }
            } else {
                for peer_id in &remote {
                    if let Some(p) = st.peers.get(peer_id) {
                        udp_targets.push(p.addr);
                    }
                }
            }

            let mode = if single_tracked {
                let waiter = if sync {
                    let (tx, rx) = oneshot::channel();
                    st.ops.insert(
                        handle,
                        PendingOp::Send {
                            ctx,
                            peer_ids: remote.clone(),
                            waiter: Some(tx),
                        },
                    );
                    Some(rx)
                } else {
                    st.ops.insert(
                        handle,
                        PendingOp::Send {
                            ctx,
                            peer_ids: remote.clone(),
                            waiter: None,
                        },
                    );
                    None
                };
                match waiter {
                    Some(rx) => Mode::Tracked(rx),
                    None => Mode::TrackedAsync,
                }
            } else {
                Mode::Immediate
            };

            let udp = st.udp.clone();
            (
                exposed,
                mode,
                udp_targets,
                loopback.then(|| (local, data.to_vec())),
                udp,
                frame,
            )
        };

        // Best-effort datagrams; a full socket buffer just drops them.
        if let Some(udp) = udp {
            if frame.len() <= MAX_DATAGRAM_SIZE {
                for addr in &udp_targets {
                    let _ = udp.try_send_to(&frame, std::net::SocketAddr::V4(*addr));
                }
            } else if !udp_targets.is_empty() {
                return Err(SessionError::InvalidArg("payload exceeds datagram limit"));
            }
        }

        if let Some((local, payload)) = loopback {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.deliver_payload(local, payload);
            });
        }

        match mode {
            Mode::Tracked(rx) => {
                rx.await.unwrap_or(Err(SessionError::UserCancel)).map(|_| 0)
            }
            Mode::TrackedAsync => Ok(exposed),
            Mode::Immediate => {
                if sync {
                    Ok(0)
                } else {
                    // Fan-out and best-effort sends complete once every
                    // target has been handed off.
                    let handler = self.shared.handler.clone();
                    tokio::spawn(async move {
                        handler.send_complete(exposed, ctx, Ok(()));
                    });
                    Ok(exposed)
                }
            }
        }
    }

    /// Message and byte counts still queued toward `player`.
    pub fn get_send_queue_info(&self, player: PlayerId) -> Result<(usize, usize), SessionError> {
        let st = self.shared.lock();
        let peer_id = st.peer_by_player(player).ok_or(SessionError::PlayerNotFound)?;
        let p = st.peers.get(&peer_id).ok_or(SessionError::PlayerNotFound)?;
        Ok(p.send_queue.info())
    }

    /// Release a payload buffer retained from a `receive` event.
    pub fn return_buffer(&self, buffer: BufferHandle) -> Result<(), SessionError> {
        let found = self.shared.lock().held_buffers.remove(&buffer).is_some();
        if !found {
            return Err(SessionError::BufferNotFound);
        }
        self.shared.handler.return_buffer(buffer, Ok(()));
        Ok(())
    }

    // -------------------------------------------------------------------
    // Identity and description
    // -------------------------------------------------------------------

    /// Update the local player's name and data. Before joining this is
    /// purely local; inside a session it replicates to every peer and
    /// completes when all of them have acknowledged.
    pub async fn set_peer_info(
        &self,
        name: &str,
        data: &[u8],
        flags: u32,
        ctx: UserContext,
    ) -> Result<AsyncHandle, SessionError> {
        let sync = flags & SET_INFO_SYNC != 0;

        let (exposed, waiter_rx) = {
            let mut st = self.shared.lock();
            if matches!(st.phase, SessionPhase::Closing | SessionPhase::Terminated) {
                return Err(SessionError::InvalidState);
            }
            st.local_name = name.to_string();
            st.local_data = data.to_vec();

            let connected: Vec<u64> = st
                .peers
                .iter()
                .filter(|(_, p)| p.state == PeerState::Connected)
                .map(|(id, _)| *id)
                .collect();

            if !st.in_session() || connected.is_empty() {
                // Strictly local; the async form still owes exactly one
                // completion event.
                if sync {
                    return Ok(0);
                }
                let handle = st.handles.new_send();
                let handler = self.shared.handler.clone();
                tokio::spawn(async move {
                    handler.async_op_complete(handle, ctx, Ok(()));
                });
                return Ok(handle);
            }

            let handle = st.handles.new_send();
            let exposed = if sync { 0 } else { handle };
            let local_player = st.local_player_id;
            let (name_owned, data_owned) = (st.local_name.clone(), st.local_data.clone());

            let mut acks = Vec::with_capacity(connected.len());
            for peer_id in connected {
                let Some(p) = st.peers.get_mut(&peer_id) else {
                    continue;
                };
                let ack_id = p.alloc_ack_id();
                let weak = Arc::downgrade(&self.shared);
                p.register_ack(
                    ack_id,
                    Box::new(move |code, _response| {
                        if let Some(shared) = weak.upgrade() {
                            shared.playerinfo_ack(handle, peer_id, ack_id, code);
                        }
                    }),
                );
                let frame = PlayerInfo {
                    player_id: local_player,
                    player_name: name_owned.clone(),
                    player_data: data_owned.clone(),
                    ack_id,
                }
                .encode();
                p.enqueue(frame, 0, None);
                acks.push((peer_id, ack_id));
            }

            let (waiter_tx, waiter_rx) = if sync {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            st.ops.insert(
                handle,
                PendingOp::PlayerInfo {
                    ctx,
                    acks,
                    waiter: waiter_tx,
                },
            );
            (exposed, waiter_rx)
        };

        match waiter_rx {
            Some(rx) => rx.await.unwrap_or(Err(SessionError::UserCancel)).map(|_| 0),
            None => Ok(exposed),
        }
    }

    /// Name and data of any player in the session (or the local one).
    pub fn get_peer_info(&self, player: PlayerId) -> Result<(String, Vec<u8>), SessionError> {
        let st = self.shared.lock();
        if player == st.local_player_id && player != 0 {
            return Ok((st.local_name.clone(), st.local_data.clone()));
        }
        let peer_id = st.peer_by_player(player).ok_or(SessionError::PlayerNotFound)?;
        let p = st.peers.get(&peer_id).ok_or(SessionError::PlayerNotFound)?;
        Ok((p.player_name.clone(), p.player_data.clone()))
    }

    pub fn get_peer_address(&self, player: PlayerId) -> Result<SocketAddrV4, SessionError> {
        let st = self.shared.lock();
        let peer_id = st.peer_by_player(player).ok_or(SessionError::PlayerNotFound)?;
        let p = st.peers.get(&peer_id).ok_or(SessionError::PlayerNotFound)?;
        Ok(p.addr)
    }

    pub fn get_player_context(&self, player: PlayerId) -> Result<UserContext, SessionError> {
        let st = self.shared.lock();
        if player == st.local_player_id && player != 0 {
            return Ok(st.local_player_ctx);
        }
        let peer_id = st.peer_by_player(player).ok_or(SessionError::PlayerNotFound)?;
        let p = st.peers.get(&peer_id).ok_or(SessionError::PlayerNotFound)?;
        Ok(p.player_ctx)
    }

    /// Player ids of everyone currently in the session, local first.
    pub fn enum_players(&self) -> Result<Vec<PlayerId>, SessionError> {
        let st = self.shared.lock();
        if !st.in_session() {
            return Err(SessionError::InvalidState);
        }
        let mut ids = vec![st.local_player_id];
        ids.extend(
            st.peers
                .values()
                .filter(|p| p.state == PeerState::Connected)
                .map(|p| p.player_id),
        );
        Ok(ids)
    }

    /// The current shared application description. Inside an
    /// `app_desc_changed` event this already reflects the new values.
    pub fn get_application_desc(&self) -> Result<ApplicationDesc, SessionError> {
        let st = self.shared.lock();
        if !st.in_session() {
            return Err(SessionError::InvalidState);
        }
        let mut desc = st.desc.clone();
        desc.current_players = st.current_players();
        Ok(desc)
    }

    /// Host only: replace the mutable parts of the application
    /// description and replicate them to every peer.
    pub async fn set_application_desc(
        &self,
        max_players: u32,
        session_name: &str,
        password: Option<&str>,
        application_data: &[u8],
    ) -> Result<(), SessionError> {
        {
            let mut st = self.shared.lock();
            match st.phase {
                SessionPhase::Hosting => {}
                SessionPhase::Connected => return Err(SessionError::NotHost),
                _ => return Err(SessionError::InvalidState),
            }
            st.desc.max_players = max_players;
            st.desc.session_name = session_name.to_string();
            st.desc.password = password.map(str::to_string);
            st.desc.application_data = application_data.to_vec();

            let update = |ack_id| AppDescUpdate {
                max_players,
                session_name: session_name.to_string(),
                password: password.unwrap_or("").to_string(),
                application_data: application_data.to_vec(),
                ack_id,
            };
            let peer_ids: Vec<u64> = st
                .peers
                .iter()
                .filter(|(_, p)| p.state == PeerState::Connected)
                .map(|(id, _)| *id)
                .collect();
            for peer_id in peer_ids {
                if let Some(p) = st.peers.get_mut(&peer_id) {
                    let ack_id = p.alloc_ack_id();
                    // Propagation is acked on the wire but carries no
                    // caller-visible completion.
                    p.register_ack(ack_id, Box::new(|_, _| {}));
                    p.enqueue(update(ack_id).encode(), 0, None);
                }
            }
        }
        self.shared.handler.app_desc_changed();
        Ok(())
    }

    // -------------------------------------------------------------------
    // Groups
    // -------------------------------------------------------------------

    /// Create a group visible to the whole session. The group id is
    /// minted locally: the local player id in the high bits plus a
    /// per-instance counter, so originators can never collide.
    pub fn create_group(
        &self,
        name: &str,
        data: &[u8],
        ctx: UserContext,
    ) -> Result<GroupId, SessionError> {
        let group_id = {
            let mut st = self.shared.lock();
            if !st.in_session() {
                return Err(SessionError::InvalidState);
            }
            let seq = st.next_group_seq;
            st.next_group_seq = st.next_group_seq.wrapping_add(1).max(1);
            let group_id: GroupId = (st.local_player_id & 0xFFFF) << 16 | seq as u32;
            st.groups
                .insert(group_id, GroupRecord::new(name.to_string(), data.to_vec(), ctx));

            let msg = |ack_id| GroupCreateMsg {
                group_id,
                name: name.to_string(),
                data: data.to_vec(),
                ack_id,
            };
            let peer_ids: Vec<u64> = st
                .peers
                .iter()
                .filter(|(_, p)| p.state == PeerState::Connected)
                .map(|(id, _)| *id)
                .collect();
            for peer_id in peer_ids {
                if let Some(p) = st.peers.get_mut(&peer_id) {
                    let ack_id = p.alloc_ack_id();
                    p.register_ack(ack_id, Box::new(|_, _| {}));
                    p.enqueue(msg(ack_id).encode(), 0, None);
                }
            }
            group_id
        };

        let ctx_out = self.shared.handler.group_create(group_id, ctx);
        if let Some(g) = self.shared.lock().groups.get_mut(&group_id) {
            g.ctx = ctx_out;
        }
        Ok(group_id)
    }

    /// Destroy a group everywhere and retire its id for the session.
    pub fn destroy_group(&self, group_id: GroupId) -> Result<(), SessionError> {
        let ctx = {
            let mut st = self.shared.lock();
            if !st.in_session() {
                return Err(SessionError::InvalidState);
            }
            let record = st.groups.remove(&group_id).ok_or(SessionError::GroupNotFound)?;
            st.destroyed_groups.insert(group_id);

            let peer_ids: Vec<u64> = st
                .peers
                .iter()
                .filter(|(_, p)| p.state == PeerState::Connected)
                .map(|(id, _)| *id)
                .collect();
            for peer_id in peer_ids {
                if let Some(p) = st.peers.get_mut(&peer_id) {
                    let ack_id = p.alloc_ack_id();
                    p.register_ack(ack_id, Box::new(|_, _| {}));
                    p.enqueue(
                        GroupDestroyMsg { group_id, ack_id }.encode(),
                        0,
                        None,
                    );
                }
            }
            record.ctx
        };
        self.shared
            .handler
            .group_destroy(group_id, ctx, DestroyReason::Normal);
        Ok(())
    }

    // -------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------

    /// Cancel one asynchronous operation by handle.
    pub fn cancel(&self, handle: AsyncHandle) -> Result<(), SessionError> {
        if handle == 0 {
            return Err(SessionError::InvalidArg("null handle"));
        }
        self.cancel_one(handle)
    }

    /// Cancel every pending operation matching the scope mask
    /// (`CANCEL_ENUMS` | `CANCEL_CONNECTS` | `CANCEL_SENDS` |
    /// `CANCEL_PLAYER_INFOS`).
    pub fn cancel_scope(&self, scope: u32) -> Result<(), SessionError> {
        if scope & CANCEL_ALL_OPERATIONS == 0 {
            return Err(SessionError::InvalidArg("empty cancel scope"));
        }
        let handles = self.shared.lock().ops.handles_in_scope(scope);
        for handle in handles {
            let _ = self.cancel_one(handle);
        }
        Ok(())
    }

    fn cancel_one(&self, handle: AsyncHandle) -> Result<(), SessionError> {
        enum Action {
            EnumSignalled,
            Connect,
            Sends(Vec<SendCompletion>),
            PlayerInfo {
                ctx: UserContext,
                waiter: Option<crate::ops::SyncWaiter>,
            },
        }

        let action = {
            let mut st = self.shared.lock();
            let Some(op) = st.ops.remove(handle) else {
                return Err(SessionError::HandleNotFound);
            };
            match op {
                PendingOp::Enum { ctx, cancel, sync } => {
                    // The enumerator observes the flag, stops retrying
                    // and delivers the user-cancel completion itself
                    // when it takes the entry back out.
                    let _ = cancel.send(true);
                    st.ops.insert(handle, PendingOp::Enum { ctx, cancel, sync });
                    Action::EnumSignalled
                }
                PendingOp::Connect { ctx } => {
                    st.ops.insert(handle, PendingOp::Connect { ctx });
                    Action::Connect
                }
                PendingOp::Send { ctx, peer_ids, waiter } => {
                    let mut removed = Vec::new();
                    for peer_id in &peer_ids {
                        if let Some(p) = st.peers.get_mut(peer_id) {
                            if let Some(c) = p.send_queue.cancel(handle) {
                                removed.push(c);
                            }
                        }
                    }
                    // The entry stays registered either way: the
                    // removed completions resolve the operation through
                    // finish_send_op, and an un-removable head is
                    // already on the wire and completes normally.
                    let uncancellable = removed.is_empty();
                    st.ops.insert(handle, PendingOp::Send { ctx, peer_ids, waiter });
                    if uncancellable {
                        return Err(SessionError::InvalidState);
                    }
                    Action::Sends(removed)
                }
                PendingOp::PlayerInfo { ctx, acks, waiter } => {
                    for (peer_id, ack_id) in acks {
                        if let Some(p) = st.peers.get_mut(&peer_id) {
                            let _ = p.take_ack(ack_id);
                        }
                    }
                    Action::PlayerInfo { ctx, waiter }
                }
            }
        };

        match action {
            Action::EnumSignalled => {}
            Action::Connect => {
                proto::connect_fail(&self.shared, SessionError::UserCancel, None);
            }
            Action::Sends(completions) => {
                for c in completions {
                    c(Err(SessionError::UserCancel));
                }
            }
            Action::PlayerInfo { ctx, waiter } => match waiter {
                Some(w) => {
                    let _ = w.send(Err(SessionError::UserCancel));
                }
                None => {
                    self.shared
                        .handler
                        .async_op_complete(handle, ctx, Err(SessionError::UserCancel));
                }
            },
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------

    /// Host only: end the session for everyone, delivering `data` in
    /// every peer's `terminate_session` event.
    pub async fn terminate_session(&self, data: &[u8]) -> Result<(), SessionError> {
        {
            let mut st = self.shared.lock();
            match st.phase {
                SessionPhase::Hosting => {}
                SessionPhase::Connected => return Err(SessionError::NotHost),
                _ => return Err(SessionError::InvalidState),
            }
            let frame = TerminateSessionMsg { data: data.to_vec() }.encode();
            let peer_ids: Vec<u64> = st.peers.keys().copied().collect();
            for peer_id in peer_ids {
                if let Some(p) = st.peers.get_mut(&peer_id) {
                    p.reason_hint = Some(DestroyReason::SessionTerminated);
                    p.enqueue_final(frame.clone());
                    p.state = PeerState::Closing;
                }
            }
            info!("terminating session");
        }
        self.finish_close(true, DestroyReason::SessionTerminated, false)
            .await;
        Ok(())
    }

    /// Host only: eject `player` from the session. The victim receives
    /// a `terminate_session` event carrying `data` and leaves; everyone
    /// else sees the player destroyed.
    pub fn destroy_peer(&self, player: PlayerId, data: &[u8]) -> Result<(), SessionError> {
        let mut st = self.shared.lock();
        match st.phase {
            SessionPhase::Hosting => {}
            SessionPhase::Connected => return Err(SessionError::NotHost),
            _ => return Err(SessionError::InvalidState),
        }
        if player == st.local_player_id {
            return Err(SessionError::InvalidArg("cannot destroy the local player"));
        }
        let victim = st.peer_by_player(player).ok_or(SessionError::PlayerNotFound)?;

        let peer_ids: Vec<u64> = st
            .peers
            .iter()
            .filter(|(_, p)| p.state == PeerState::Connected)
            .map(|(id, _)| *id)
            .collect();
        for peer_id in peer_ids {
            let msg = DestroyPeerMsg {
                player_id: player,
                data: if peer_id == victim {
                    data.to_vec()
                } else {
                    Vec::new()
                },
            };
            if let Some(p) = st.peers.get_mut(&peer_id) {
                if peer_id == victim {
                    p.reason_hint = Some(DestroyReason::HostDestroyedPlayer);
                    p.enqueue_final(msg.encode());
                    p.state = PeerState::Closing;
                } else {
                    p.enqueue(msg.encode(), 0, None);
                }
            }
        }
        Ok(())
    }

    /// Leave (and, for the host, implicitly end) the session. Default
    /// is a graceful drain; `CLOSE_IMMEDIATE` drops every connection on
    /// the floor. The local player's `destroy_player` is dispatched
    /// before the remote players' events, mirroring the legacy close
    /// ordering.
    pub async fn close(&self, flags: u32) -> Result<(), SessionError> {
        let immediate = flags & CLOSE_IMMEDIATE != 0;
        {
            let st = self.shared.lock();
            if matches!(st.phase, SessionPhase::Closing | SessionPhase::Terminated) {
                return Err(SessionError::InvalidState);
            }
        }
        // An outstanding join is cancelled first so its completion
        // lands before any teardown events.
        proto::connect_fail(&self.shared, SessionError::UserCancel, None);
        self.finish_close(!immediate, DestroyReason::Normal, true)
            .await;
        Ok(())
    }

    /// Common tail of close / terminate: stop I/O intake, resolve every
    /// pending operation, announce the local player, drain or drop
    /// peers, retire groups, and land in `Terminated`.
    async fn finish_close(&self, graceful: bool, self_reason: DestroyReason, self_first: bool) {
        let (io_tasks, enum_handles, local) = {
            let mut st = self.shared.lock();
            st.phase = SessionPhase::Closing;
            let io_tasks = std::mem::take(&mut st.io_tasks);
            let enum_handles = st.ops.handles_in_scope(CANCEL_ENUMS);
            for handle in &enum_handles {
                if let Some(PendingOp::Enum { cancel, .. }) = st.ops.get_mut(*handle) {
                    let _ = cancel.send(true);
                }
            }
            let local = (st.local_player_id != 0)
                .then_some((st.local_player_id, st.local_player_ctx));
            (io_tasks, enum_handles, local)
        };
        for t in io_tasks {
            t.abort();
        }

        // Enumerations deliver their own user-cancel completions; give
        // them a bounded window to do so.
        let ops_deadline = Instant::now() + OPS_DEADLINE;
        while !enum_handles.is_empty() {
            let pending = {
                let st = self.shared.lock();
                enum_handles.iter().any(|h| st.ops.contains(*h))
            };
            if !pending || Instant::now() >= ops_deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if self_first {
            if let Some((player, ctx)) = local {
                self.shared.handler.destroy_player(player, ctx, self_reason);
            }
        }

        let peer_ids: Vec<u64> = {
            let mut st = self.shared.lock();
            let ids: Vec<u64> = st.peers.keys().copied().collect();
            if graceful {
                for id in &ids {
                    if let Some(p) = st.peers.get_mut(id) {
                        if p.is_joining() {
                            continue;
                        }
                        p.state = PeerState::Closing;
                        p.close_after_drain();
                    }
                }
            }
            ids
        };

        if graceful {
            // Joining-state stubs cannot drain; drop them immediately.
            let stubs: Vec<u64> = {
                let st = self.shared.lock();
                st.peers
                    .iter()
                    .filter(|(_, p)| p.is_joining())
                    .map(|(id, _)| *id)
                    .collect()
            };
            for id in stubs {
                self.shared
                    .destroy_peer_record(id, None, SessionError::UserCancel);
            }
            let deadline = Instant::now() + CLOSE_DEADLINE;
            loop {
                if self.shared.lock().peers.is_empty() {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("close deadline hit; forcing remaining peers down");
                    let leftover: Vec<u64> =
                        self.shared.lock().peers.keys().copied().collect();
                    for id in leftover {
                        self.shared
                            .destroy_peer_record(id, None, SessionError::UserCancel);
                    }
                    break;
                }
                let _ = tokio::time::timeout(
                    Duration::from_millis(25),
                    self.shared.peers_changed.notified(),
                )
                .await;
            }
        } else {
            for id in peer_ids {
                self.shared
                    .destroy_peer_record(id, None, SessionError::UserCancel);
            }
        }

        // Whatever operations survived peer teardown complete now.
        let leftovers = {
            let mut st = self.shared.lock();
            st.ops.drain()
        };
        for (handle, op) in leftovers {
            match op {
                PendingOp::Enum { ctx, sync, .. } => {
                    if !sync {
                        self.shared
                            .handler
                            .async_op_complete(handle, ctx, Err(SessionError::UserCancel));
                    }
                }
                PendingOp::Connect { .. } => {}
                PendingOp::Send { ctx, waiter, .. } => match waiter {
                    Some(w) => {
                        let _ = w.send(Err(SessionError::UserCancel));
                    }
                    None => self.shared.handler.send_complete(
                        handle,
                        ctx,
                        Err(SessionError::UserCancel),
                    ),
                },
                PendingOp::PlayerInfo { ctx, waiter, .. } => match waiter {
                    Some(w) => {
                        let _ = w.send(Err(SessionError::UserCancel));
                    }
                    None => self.shared.handler.async_op_complete(
                        handle,
                        ctx,
                        Err(SessionError::UserCancel),
                    ),
                },
            }
        }

        let groups: Vec<(GroupId, UserContext)> = {
            let mut st = self.shared.lock();
            let groups = st
                .groups
                .drain()
                .map(|(id, g)| (id, g.ctx))
                .collect::<Vec<_>>();
            for (id, _) in &groups {
                st.destroyed_groups.insert(*id);
            }
            groups
        };
        for (id, ctx) in groups {
            self.shared.handler.group_destroy(id, ctx, self_reason);
        }

        if !self_first {
            if let Some((player, ctx)) = local {
                self.shared.handler.destroy_player(player, ctx, self_reason);
            }
        }

        let mut st = self.shared.lock();
        st.phase = SessionPhase::Terminated;
        st.held_buffers.clear();
        info!("session terminated");
    }

    // -------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------

    /// The local player id; 0 before the session is joined or hosted.
    pub fn local_player_id(&self) -> PlayerId {
        self.shared.lock().local_player_id
    }

    /// The bound session address (useful with ephemeral ports).
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.shared.lock().local_addr
    }

    pub fn is_host(&self) -> bool {
        self.shared.lock().phase == SessionPhase::Hosting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullHandler;

    fn session() -> Session {
        Session::new(Arc::new(NullHandler), SessionConfig::default())
    }

    #[tokio::test]
    async fn operations_gated_on_phase() {
        let s = session();
        assert_eq!(
            s.send_to(1, b"x", SEND_GUARANTEED, 0).await.unwrap_err(),
            SessionError::InvalidState
        );
        assert_eq!(s.get_application_desc().unwrap_err(), SessionError::InvalidState);
        assert_eq!(s.enum_players().unwrap_err(), SessionError::InvalidState);
        assert_eq!(
            s.terminate_session(b"").await.unwrap_err(),
            SessionError::InvalidState
        );
    }

    #[tokio::test]
    async fn close_is_one_way() {
        let s = session();
        s.close(0).await.unwrap();
        assert_eq!(s.close(0).await.unwrap_err(), SessionError::InvalidState);
        let err = s
            .host(
                HostParams {
                    application: Guid::random(),
                    instance: None,
                    session_name: "x".into(),
                    password: None,
                    application_data: vec![],
                    max_players: 0,
                },
                0,
            )
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::InvalidState);
    }

    #[tokio::test]
    async fn set_peer_info_local_before_join() {
        let s = session();
        let handle = s.set_peer_info("alice", b"d", SET_INFO_SYNC, 0).await.unwrap();
        assert_eq!(handle, 0);
        // Not yet joined: names are held locally until a session exists.
        let st = s.shared.lock();
        assert_eq!(st.local_name, "alice");
        assert_eq!(st.local_data, b"d");
    }

    #[tokio::test]
    async fn cancel_unknown_handle() {
        let s = session();
        assert_eq!(s.cancel(0x4000_0001).unwrap_err(), SessionError::HandleNotFound);
        assert_eq!(s.cancel(0).unwrap_err(), SessionError::InvalidArg("null handle"));
    }
}
