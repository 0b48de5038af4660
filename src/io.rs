//! Socket tasks: listener, UDP, discovery, and per-peer reader/writer.
//!
//! Every task locks the session state to inspect or mutate it but
//! performs the actual socket syscalls on buffers it owns, outside the
//! lock. Outgoing connections bind their source to the local session
//! port (with address reuse) so the accepting side sees the
//! connector's canonical session address.

use crate::error::SessionError;
use crate::packet::frame_size;
use crate::proto;
use crate::session::{SessionPhase, SessionShared};
use crate::types::*;
use crate::message::{ConnectHost, ConnectPeer};
use crate::peer::{PeerRecord, PeerState};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

fn new_tcp_socket() -> io::Result<TcpSocket> {
    let sock = TcpSocket::new_v4()?;
    sock.set_reuseaddr(true)?;
    #[cfg(unix)]
    sock.set_reuseport(true)?;
    Ok(sock)
}

/// Bind the TCP listener and the UDP socket on the same port. With an
/// ephemeral request the pair is retried until a port accepts both.
pub(crate) async fn bind_session_sockets(
    ip: Ipv4Addr,
    port: u16,
) -> io::Result<(TcpListener, Arc<UdpSocket>, SocketAddrV4)> {
    let mut attempt = 0;
    loop {
        let sock = new_tcp_socket()?;
        sock.bind(SocketAddr::V4(SocketAddrV4::new(ip, port)))?;
        let listener = sock.listen(64)?;
        let actual = match listener.local_addr()? {
            SocketAddr::V4(a) => a,
            a => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("unexpected local address {a}"),
                ))
            }
        };
        match UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(ip, actual.port()))).await {
            Ok(udp) => return Ok((listener, Arc::new(udp), actual)),
            Err(_) if port == 0 && attempt < 10 => {
                attempt += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bind the broadcast-receive discovery socket. Address and port reuse
/// let several instances on one machine share the discovery port;
/// broadcasts are delivered to all of them.
pub(crate) async fn bind_discovery(port: u16) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(SocketAddrV4::new(
        Ipv4Addr::UNSPECIFIED,
        port,
    )))?;
    UdpSocket::from_std(socket.into())
}

// =============================================================================
// SESSION-WIDE TASKS
// =============================================================================

pub(crate) async fn run_listener(shared: Arc<SessionShared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, SocketAddr::V4(addr))) => {
                accept_peer(&shared, stream, addr);
            }
            Ok((_, addr)) => {
                debug!(%addr, "dropping non-IPv4 connection");
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn accept_peer(shared: &Arc<SessionShared>, stream: TcpStream, addr: SocketAddrV4) {
    let peer_id = {
        let mut st = shared.lock();
        if !matches!(
            st.phase,
            SessionPhase::Hosting | SessionPhase::Connected | SessionPhase::ConnectingToPeers
        ) {
            return;
        }
        let id = st.alloc_peer_id();
        st.peers.insert(id, PeerRecord::new(PeerState::Accepted, addr));
        id
    };
    debug!(peer_id, %addr, "connection accepted");
    spawn_peer_io(shared, peer_id, stream);
}

pub(crate) async fn run_udp(shared: Arc<SessionShared>, udp: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match udp.recv_from(&mut buf).await {
            Ok((n, SocketAddr::V4(from))) => {
                proto::handle_udp_frame(&shared, &buf[..n], from);
            }
            Ok(_) => {}
            Err(e) => {
                trace!(error = %e, "udp recv error");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// The discovery socket only ever carries enumeration queries.
pub(crate) async fn run_discovery(shared: Arc<SessionShared>, sock: UdpSocket) {
    use crate::message::{HostEnumRequest, MSG_HOST_ENUM_REQUEST};
    use crate::packet::PacketReader;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match sock.recv_from(&mut buf).await {
            Ok((n, SocketAddr::V4(from))) => {
                let Ok(r) = PacketReader::parse(&buf[..n]) else {
                    continue;
                };
                if r.msg_id() != MSG_HOST_ENUM_REQUEST {
                    continue;
                }
                if let Ok(req) = HostEnumRequest::decode(&r) {
                    proto::handle_enum_request(&shared, req, from);
                }
            }
            Ok(_) => {}
            Err(e) => {
                trace!(error = %e, "discovery recv error");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

// =============================================================================
// PER-PEER TASKS
// =============================================================================

/// Attach reader and writer tasks to an established stream.
pub(crate) fn spawn_peer_io(shared: &Arc<SessionShared>, peer_id: u64, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();
    let reader = tokio::spawn(run_reader(shared.clone(), peer_id, rd));
    let writer = tokio::spawn(run_writer(shared.clone(), peer_id, wr));

    let mut st = shared.lock();
    match st.peers.get_mut(&peer_id) {
        Some(p) => {
            p.tasks.push(reader);
            p.tasks.push(writer);
        }
        None => {
            // Record vanished between accept and here.
            reader.abort();
            writer.abort();
        }
    }
}

/// Start an outgoing connection attempt; the record transitions to the
/// matching `Requesting*` state once the stream opens.
pub(crate) fn spawn_connect_attempt(
    shared: &Arc<SessionShared>,
    peer_id: u64,
    remote: SocketAddrV4,
    local: SocketAddrV4,
) -> JoinHandle<()> {
    let shared = shared.clone();
    tokio::spawn(async move {
        let connect = async {
            let sock = new_tcp_socket()?;
            sock.bind(SocketAddr::V4(local))?;
            sock.connect(SocketAddr::V4(remote)).await
        };
        match tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connect).await {
            Ok(Ok(stream)) => peer_socket_opened(&shared, peer_id, stream),
            Ok(Err(e)) => {
                debug!(peer_id, %remote, error = %e, "connect failed");
                proto::peer_connection_lost(&shared, peer_id, false);
            }
            Err(_) => {
                debug!(peer_id, %remote, "connect timed out");
                proto::peer_connection_lost(&shared, peer_id, false);
            }
        }
    })
}

fn peer_socket_opened(shared: &Arc<SessionShared>, peer_id: u64, stream: TcpStream) {
    let attached = {
        let mut st = shared.lock();
        let state = match st.peers.get(&peer_id) {
            Some(p) => p.state,
            None => return, // cancelled underneath the connect
        };
        let frame = match state {
            PeerState::ConnectingHost => {
                let Some(cs) = st.connect.as_ref() else {
                    return;
                };
                ConnectHost {
                    instance: cs.instance_filter,
                    application: st.desc.application,
                    password: cs.password.clone(),
                    connect_data: cs.connect_data.clone(),
                    player_name: st.local_name.clone(),
                    player_data: st.local_data.clone(),
                }
                .encode()
            }
            PeerState::ConnectingPeer => ConnectPeer {
                instance: st.desc.instance,
                application: st.desc.application,
                password: st.desc.password.clone().unwrap_or_default(),
                player_id: st.local_player_id,
                player_name: st.local_name.clone(),
                player_data: st.local_data.clone(),
            }
            .encode(),
            _ => return,
        };
        let p = st.peers.get_mut(&peer_id).expect("looked up above");
        p.state = if state == PeerState::ConnectingHost {
            PeerState::RequestingHost
        } else {
            PeerState::RequestingPeer
        };
        p.enqueue(frame, 0, None);
        true
    };
    if attached {
        spawn_peer_io(shared, peer_id, stream);
    }
}

/// Read side: accumulate bytes, peel off complete frames, hand each to
/// the protocol layer. Exactly one frame is in flight per socket.
async fn run_reader(shared: Arc<SessionShared>, peer_id: u64, mut rd: OwnedReadHalf) {
    let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut chunk = [0u8; 16 * 1024];
    loop {
        match rd.read(&mut chunk).await {
            Ok(0) => {
                trace!(peer_id, "remote closed");
                proto::peer_connection_lost(&shared, peer_id, true);
                return;
            }
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                loop {
                    let Some(size) = frame_size(&buf) else {
                        break;
                    };
                    if size > MAX_PACKET_SIZE {
                        warn!(peer_id, size, "oversized frame; dropping connection");
                        proto::peer_connection_lost(&shared, peer_id, false);
                        return;
                    }
                    if buf.len() < size {
                        break;
                    }
                    let frame: Vec<u8> = buf.drain(..size).collect();
                    if let Err(e) = proto::handle_frame(&shared, peer_id, &frame) {
                        warn!(peer_id, error = %e, "protocol error; dropping connection");
                        proto::peer_connection_lost(&shared, peer_id, false);
                        return;
                    }
                }
            }
            Err(e) => {
                trace!(peer_id, error = %e, "read error");
                proto::peer_connection_lost(&shared, peer_id, false);
                return;
            }
        }
    }
}

/// Write side: drain the send queue, then (after a graceful close has
/// been queued) shut the stream down and linger briefly for the remote
/// to follow suit.
async fn run_writer(shared: Arc<SessionShared>, peer_id: u64, mut wr: OwnedWriteHalf) {
    enum Step {
        Write(Vec<u8>),
        Wait(Arc<Notify>),
        Shutdown,
        Exit,
    }

    loop {
        let step = {
            let mut st = shared.lock();
            match st.peers.get_mut(&peer_id) {
                None => Step::Exit,
                Some(p) => {
                    if let Some(chunk) = p.send_queue.peek_front() {
                        let bytes = chunk.to_vec();
                        // Claimed for the wire: from here the head is
                        // no longer cancellable.
                        p.send_queue.advance(bytes.len());
                        Step::Write(bytes)
                    } else if !p.send_open {
                        Step::Shutdown
                    } else {
                        Step::Wait(p.writer_wake.clone())
                    }
                }
            }
        };

        match step {
            Step::Write(bytes) => {
                if wr.write_all(&bytes).await.is_err() {
                    proto::peer_connection_lost(&shared, peer_id, false);
                    return;
                }
                let completion = {
                    let mut st = shared.lock();
                    match st.peers.get_mut(&peer_id) {
                        None => return,
                        Some(p) => p.send_queue.pop_front().and_then(|(_, c)| c),
                    }
                };
                if let Some(c) = completion {
                    c(Ok(()));
                }
            }
            Step::Wait(wake) => wake.notified().await,
            Step::Shutdown => {
                let _ = wr.shutdown().await;
                tokio::time::sleep(Duration::from_millis(CLOSE_LINGER_MS)).await;
                shared.destroy_peer_record(peer_id, None, SessionError::ConnectionLost);
                return;
            }
            Step::Exit => return,
        }
    }
}
