//! Multi-instance session tests.
//!
//! Every test runs several real session instances against each other on
//! 127.0.0.1 with ephemeral session ports. Discovery ports are fixed
//! per test so concurrent tests never cross-talk; enumeration tests
//! broadcast to the loopback broadcast address so that several hosts
//! sharing a discovery port all hear the query.

use lanmesh::session::{ConnectParams, HostParams, Session, SessionConfig};
use lanmesh::{
    ApplicationDesc, AsyncHandle, BufferHandle, DestroyReason, EnumHostsParams, Guid, IndicateReply,
    PlayerId, ReceiveAction, SessionError, SessionHandler, UserContext, ALL_PLAYERS,
    CANCEL_ENUMS, CLOSE_IMMEDIATE, CONNECT_SYNC, ENUM_HOSTS_SYNC, ERR_INVALID_APPLICATION,
    SEND_GUARANTEED, SEND_NOLOOPBACK, SEND_SYNC, SET_INFO_SYNC,
};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

const LOOPBACK_BROADCAST: Ipv4Addr = Ipv4Addr::new(127, 255, 255, 255);

#[derive(Debug, Clone, PartialEq)]
enum Ev {
    CreatePlayer(PlayerId),
    DestroyPlayer(PlayerId, DestroyReason),
    IndicateConnect,
    ConnectComplete(Result<(), SessionError>),
    Receive(PlayerId, Vec<u8>),
    ReturnBuffer(BufferHandle),
    EnumQuery(Option<Vec<u8>>),
    EnumResponse(String, Option<Vec<u8>>),
    AsyncOpComplete(AsyncHandle, Result<(), SessionError>),
    SendComplete(Result<(), SessionError>),
    PeerInfo(PlayerId),
    AppDesc,
    GroupCreate(u32),
    GroupDestroy(u32),
    TerminateSession(Result<(), SessionError>),
}

/// Records every event and exposes a few behaviour knobs.
struct Recorder {
    events: Mutex<Vec<Ev>>,
    session: OnceLock<Session>,
    reject_connects: AtomicBool,
    retain_receives: AtomicBool,
    enum_reply: Mutex<Option<Vec<u8>>>,
    /// Description observed from inside the app_desc_changed callback.
    desc_inside_event: Mutex<Option<ApplicationDesc>>,
    retained_buffer: Mutex<Option<BufferHandle>>,
}

impl Recorder {
    fn new() -> Arc<Recorder> {
        Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
            session: OnceLock::new(),
            reject_connects: AtomicBool::new(false),
            retain_receives: AtomicBool::new(false),
            enum_reply: Mutex::new(None),
            desc_inside_event: Mutex::new(None),
            retained_buffer: Mutex::new(None),
        })
    }

    fn push(&self, ev: Ev) {
        self.events.lock().unwrap().push(ev);
    }

    fn events(&self) -> Vec<Ev> {
        self.events.lock().unwrap().clone()
    }

    fn count<F: Fn(&Ev) -> bool>(&self, f: F) -> usize {
        self.events().iter().filter(|e| f(e)).count()
    }
}

impl SessionHandler for Recorder {
    fn create_player(&self, player: PlayerId, ctx: UserContext) -> UserContext {
        self.push(Ev::CreatePlayer(player));
        ctx
    }

    fn destroy_player(&self, player: PlayerId, _ctx: UserContext, reason: DestroyReason) {
        self.push(Ev::DestroyPlayer(player, reason));
    }

    fn indicate_connect(&self, _data: Option<&[u8]>, _addr: SocketAddrV4) -> IndicateReply {
        self.push(Ev::IndicateConnect);
        if self.reject_connects.load(Ordering::SeqCst) {
            IndicateReply::reject_with(Some(b"denied".to_vec()))
        } else {
            IndicateReply::accept()
        }
    }

    fn connect_complete(
        &self,
        _handle: AsyncHandle,
        _ctx: UserContext,
        result: Result<(), SessionError>,
        _reply: Option<&[u8]>,
        _local: PlayerId,
    ) {
        self.push(Ev::ConnectComplete(result));
    }

    fn receive(&self, from: PlayerId, payload: &[u8], buffer: BufferHandle) -> ReceiveAction {
        self.push(Ev::Receive(from, payload.to_vec()));
        if self.retain_receives.load(Ordering::SeqCst) {
            *self.retained_buffer.lock().unwrap() = Some(buffer);
            ReceiveAction::Retain
        } else {
            ReceiveAction::Release
        }
    }

    fn return_buffer(&self, buffer: BufferHandle, _result: Result<(), SessionError>) {
        self.push(Ev::ReturnBuffer(buffer));
    }

    fn enum_hosts_query(&self, data: Option<&[u8]>, _from: SocketAddrV4) -> Option<Vec<u8>> {
        self.push(Ev::EnumQuery(data.map(<[u8]>::to_vec)));
        self.enum_reply.lock().unwrap().clone()
    }

    fn enum_hosts_response(
        &self,
        _handle: AsyncHandle,
        _ctx: UserContext,
        info: &lanmesh::EnumHostInfo,
    ) {
        self.push(Ev::EnumResponse(
            info.desc.session_name.clone(),
            info.response_data.clone(),
        ));
    }

    fn async_op_complete(
        &self,
        handle: AsyncHandle,
        _ctx: UserContext,
        result: Result<(), SessionError>,
    ) {
        self.push(Ev::AsyncOpComplete(handle, result));
    }

    fn send_complete(
        &self,
        _handle: AsyncHandle,
        _ctx: UserContext,
        result: Result<(), SessionError>,
    ) {
        self.push(Ev::SendComplete(result));
    }

    fn peer_info(&self, player: PlayerId, _ctx: UserContext) {
        self.push(Ev::PeerInfo(player));
    }

    fn app_desc_changed(&self) {
        if let Some(session) = self.session.get() {
            if let Ok(desc) = session.get_application_desc() {
                *self.desc_inside_event.lock().unwrap() = Some(desc);
            }
        }
        self.push(Ev::AppDesc);
    }

    fn group_create(&self, group: u32, ctx: UserContext) -> UserContext {
        self.push(Ev::GroupCreate(group));
        ctx
    }

    fn group_destroy(&self, group: u32, _ctx: UserContext, _reason: DestroyReason) {
        self.push(Ev::GroupDestroy(group));
    }

    fn terminate_session(&self, result: Result<(), SessionError>, _data: Option<&[u8]>) {
        self.push(Ev::TerminateSession(result));
    }
}

fn config(discovery_port: u16) -> SessionConfig {
    SessionConfig {
        bind_ip: Ipv4Addr::LOCALHOST,
        port: 0,
        discovery_port,
    }
}

async fn start_host(
    app: Guid,
    session_name: &str,
    discovery_port: u16,
) -> (Session, Arc<Recorder>) {
    let rec = Recorder::new();
    let session = Session::new(rec.clone(), config(discovery_port));
    let _ = rec.session.set(session.clone());
    session
        .host(
            HostParams {
                application: app,
                instance: None,
                session_name: session_name.into(),
                password: None,
                application_data: Vec::new(),
                max_players: 0,
            },
            0,
        )
        .await
        .unwrap();
    (session, rec)
}

async fn join(
    host: &Session,
    app: Guid,
    discovery_port: u16,
) -> (Session, Arc<Recorder>) {
    let rec = Recorder::new();
    let session = Session::new(rec.clone(), config(discovery_port));
    let _ = rec.session.set(session.clone());
    session
        .connect(ConnectParams {
            host_addr: host.local_addr().unwrap(),
            application: app,
            instance: None,
            password: None,
            connect_data: None,
            player_ctx: 0,
            async_ctx: 0,
            flags: CONNECT_SYNC,
        })
        .await
        .unwrap();
    (session, rec)
}

async fn wait_until<F: Fn() -> bool>(what: &str, f: F, ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(ms);
    loop {
        if f() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// DISCOVERY
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enum_hosts_sync_three_sessions() {
    const DPORT: u16 = 42510;
    let app_a = Guid::random();
    let app_b = Guid::random();
    let (_h1, _r1) = start_host(app_a, "A1", DPORT).await;
    let (_h2, _r2) = start_host(app_a, "A2", DPORT).await;
    let (_h3, _r3) = start_host(app_b, "B1", DPORT).await;

    let rec = Recorder::new();
    let client = Session::new(rec.clone(), config(DPORT));

    let start = Instant::now();
    let handle = client
        .enum_hosts(
            EnumHostsParams {
                application: None,
                target: Some(SocketAddrV4::new(LOOPBACK_BROADCAST, DPORT)),
                user_data: None,
                enum_count: 3,
                retry_interval_ms: 500,
                timeout_ms: 500,
            },
            0xBEEF,
            ENUM_HOSTS_SYNC,
        )
        .await
        .unwrap();
    let elapsed = start.elapsed().as_millis();

    assert_eq!(handle, 0);
    assert!(
        (1250..=1750).contains(&elapsed),
        "enumeration took {elapsed} ms"
    );

    // Retries can produce duplicate responses per host; distinct
    // session names are what matters.
    let names: HashSet<String> = rec
        .events()
        .iter()
        .filter_map(|e| match e {
            Ev::EnumResponse(name, _) => Some(name.clone()),
            _ => None,
        })
        .collect();
    let expect: HashSet<String> = ["A1", "A2", "B1"].iter().map(|s| s.to_string()).collect();
    assert_eq!(names, expect);

    // Sync mode never dispatches a completion event.
    assert_eq!(rec.count(|e| matches!(e, Ev::AsyncOpComplete(..))), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enum_hosts_filter_by_application_guid() {
    const DPORT: u16 = 42520;
    let app_a = Guid::random();
    let app_b = Guid::random();
    let (_h1, r1) = start_host(app_a, "A1", DPORT).await;
    let (_h2, r2) = start_host(app_a, "A2", DPORT).await;
    let (_h3, r3) = start_host(app_b, "B1", DPORT).await;
    *r3.enum_reply.lock().unwrap() = Some(b"come on in".to_vec());

    let rec = Recorder::new();
    let client = Session::new(rec.clone(), config(DPORT));
    client
        .enum_hosts(
            EnumHostsParams {
                application: Some(app_b),
                target: Some(SocketAddrV4::new(LOOPBACK_BROADCAST, DPORT)),
                user_data: Some(b"hello?".to_vec()),
                enum_count: 2,
                retry_interval_ms: 250,
                timeout_ms: 250,
            },
            0,
            ENUM_HOSTS_SYNC,
        )
        .await
        .unwrap();

    let names: HashSet<String> = rec
        .events()
        .iter()
        .filter_map(|e| match e {
            Ev::EnumResponse(name, data) => {
                assert_eq!(data.as_deref(), Some(&b"come on in"[..]));
                Some(name.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(names, ["B1".to_string()].into_iter().collect::<HashSet<_>>());

    // The filtered-out hosts never see a query event; the matching
    // host sees the user payload.
    assert_eq!(r1.count(|e| matches!(e, Ev::EnumQuery(_))), 0);
    assert_eq!(r2.count(|e| matches!(e, Ev::EnumQuery(_))), 0);
    assert!(r3
        .events()
        .iter()
        .any(|e| matches!(e, Ev::EnumQuery(Some(d)) if d == b"hello?")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enum_hosts_async_cancel_by_handle() {
    const DPORT: u16 = 42530;
    let rec = Recorder::new();
    let client = Session::new(rec.clone(), config(DPORT));

    let handle = client
        .enum_hosts(
            EnumHostsParams {
                application: None,
                target: Some(SocketAddrV4::new(LOOPBACK_BROADCAST, DPORT)),
                user_data: None,
                enum_count: 10,
                retry_interval_ms: 1000,
                timeout_ms: 1000,
            },
            0,
            0,
        )
        .await
        .unwrap();
    assert_ne!(handle, 0);
    client.cancel(handle).unwrap();

    let start = Instant::now();
    wait_until(
        "user-cancel completion",
        || {
            rec.events().iter().any(|e| {
                matches!(e, Ev::AsyncOpComplete(h, Err(SessionError::UserCancel)) if *h == handle)
            })
        },
        1000,
    )
    .await;
    assert!(start.elapsed() <= Duration::from_millis(250));
    assert_eq!(rec.count(|e| matches!(e, Ev::EnumResponse(..))), 0);
    assert_eq!(rec.count(|e| matches!(e, Ev::AsyncOpComplete(..))), 1);

    // Scope cancellation sweeps up a second enumeration the same way.
    let handle2 = client
        .enum_hosts(
            EnumHostsParams {
                application: None,
                target: Some(SocketAddrV4::new(LOOPBACK_BROADCAST, DPORT)),
                user_data: None,
                enum_count: 10,
                retry_interval_ms: 1000,
                timeout_ms: 1000,
            },
            0,
            0,
        )
        .await
        .unwrap();
    client.cancel_scope(CANCEL_ENUMS).unwrap();
    wait_until(
        "scope-cancel completion",
        || {
            rec.events().iter().any(|e| {
                matches!(e, Ev::AsyncOpComplete(h, Err(SessionError::UserCancel)) if *h == handle2)
            })
        },
        1000,
    )
    .await;
}

// =============================================================================
// JOINING
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_sync_success_event_order() {
    const DPORT: u16 = 42540;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let host_id = host.local_player_id();

    let (peer, peer_rec) = join(&host, app, DPORT).await;
    let peer_id = peer.local_player_id();
    assert_ne!(peer_id, 0);
    assert_ne!(peer_id, host_id);

    wait_until(
        "host sees new player",
        || host_rec.count(|e| matches!(e, Ev::CreatePlayer(_))) == 2,
        2000,
    )
    .await;

    assert_eq!(
        host_rec.events(),
        vec![
            Ev::CreatePlayer(host_id),
            Ev::IndicateConnect,
            Ev::CreatePlayer(peer_id),
        ]
    );
    assert_eq!(
        peer_rec.events(),
        vec![
            Ev::CreatePlayer(peer_id),
            Ev::CreatePlayer(host_id),
            Ev::ConnectComplete(Ok(())),
        ]
    );

    // Introspection over the established mesh.
    let addr = host.get_peer_address(peer_id).unwrap();
    assert_eq!(*addr.ip(), Ipv4Addr::LOCALHOST);
    assert_eq!(addr.port(), peer.local_addr().unwrap().port());
    assert_eq!(host.get_player_context(peer_id).unwrap(), 0);
    assert!(host.get_send_queue_info(peer_id).is_ok());
    assert!(host.is_host());
    assert!(!peer.is_host());

    peer.close(0).await.unwrap();
    host.close(0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_sync_wrong_application_guid() {
    const DPORT: u16 = 42550;
    let (host, host_rec) = start_host(Guid::random(), "Session 1", DPORT).await;

    let rec = Recorder::new();
    let session = Session::new(rec.clone(), config(DPORT));
    let err = session
        .connect(ConnectParams {
            host_addr: host.local_addr().unwrap(),
            application: Guid::random(),
            instance: None,
            password: None,
            connect_data: None,
            player_ctx: 0,
            async_ctx: 0,
            flags: CONNECT_SYNC,
        })
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::Rejected(ERR_INVALID_APPLICATION));

    // The connector sees exactly one event.
    assert_eq!(
        rec.events(),
        vec![Ev::ConnectComplete(Err(SessionError::Rejected(
            ERR_INVALID_APPLICATION
        )))]
    );
    // And the host's application is never consulted.
    assert_eq!(host_rec.count(|e| matches!(e, Ev::IndicateConnect)), 0);

    host.close(0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn indicate_connect_rejection() {
    const DPORT: u16 = 42555;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    host_rec.reject_connects.store(true, Ordering::SeqCst);

    let rec = Recorder::new();
    let session = Session::new(rec.clone(), config(DPORT));
    let err = session
        .connect(ConnectParams {
            host_addr: host.local_addr().unwrap(),
            application: app,
            instance: None,
            password: None,
            connect_data: Some(b"let me in".to_vec()),
            player_ctx: 0,
            async_ctx: 0,
            flags: CONNECT_SYNC,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Rejected(_)));
    assert_eq!(host_rec.count(|e| matches!(e, Ev::IndicateConnect)), 1);
    assert_eq!(host_rec.count(|e| matches!(e, Ev::CreatePlayer(_))), 1);

    host.close(0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_peers_build_full_mesh() {
    const DPORT: u16 = 42560;
    let app = Guid::random();
    let (host, _host_rec) = start_host(app, "Session 1", DPORT).await;
    let host_id = host.local_player_id();

    let (p1, p1_rec) = join(&host, app, DPORT).await;
    let p1_id = p1.local_player_id();
    let (p2, _p2_rec) = join(&host, app, DPORT).await;
    let p2_id = p2.local_player_id();

    wait_until(
        "p1 learns about p2",
        || p1_rec.events().contains(&Ev::CreatePlayer(p2_id)),
        2000,
    )
    .await;

    // Every instance knows all three players.
    for session in [&host, &p1, &p2] {
        let mut players = session.enum_players().unwrap();
        players.sort_unstable();
        let mut expect = vec![host_id, p1_id, p2_id];
        expect.sort_unstable();
        assert_eq!(players, expect);
    }

    // On p1 the new peer arrives only after p1's own join finished.
    let events = p1_rec.events();
    let connect_at = events
        .iter()
        .position(|e| matches!(e, Ev::ConnectComplete(Ok(()))))
        .unwrap();
    let p2_at = events
        .iter()
        .position(|e| *e == Ev::CreatePlayer(p2_id))
        .unwrap();
    assert!(p2_at > connect_at);

    p2.close(0).await.unwrap();
    p1.close(0).await.unwrap();
    host.close(0).await.unwrap();
}

// =============================================================================
// APPLICATION MESSAGES
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn guaranteed_send_peer_to_host() {
    const DPORT: u16 = 42570;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let host_id = host.local_player_id();
    let (p1, p1_rec) = join(&host, app, DPORT).await;
    let p1_id = p1.local_player_id();

    let handle = p1
        .send_to(host_id, b"hello host", SEND_GUARANTEED, 7)
        .await
        .unwrap();
    assert_ne!(handle, 0);

    wait_until(
        "host receives payload",
        || {
            host_rec
                .events()
                .contains(&Ev::Receive(p1_id, b"hello host".to_vec()))
        },
        2000,
    )
    .await;
    wait_until(
        "sender completion",
        || p1_rec.events().contains(&Ev::SendComplete(Ok(()))),
        2000,
    )
    .await;
    assert_eq!(p1_rec.count(|e| matches!(e, Ev::SendComplete(_))), 1);

    p1.close(0).await.unwrap();
    host.close(0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_send_to_self_loopback() {
    const DPORT: u16 = 42575;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let host_id = host.local_player_id();

    let handle = host
        .send_to(host_id, b"echo", SEND_SYNC | SEND_GUARANTEED, 0)
        .await
        .unwrap();
    assert_eq!(handle, 0);

    wait_until(
        "loopback delivery",
        || host_rec.events().contains(&Ev::Receive(host_id, b"echo".to_vec())),
        2000,
    )
    .await;

    host.close(0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fanout_with_noloopback() {
    const DPORT: u16 = 42580;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let (p1, p1_rec) = join(&host, app, DPORT).await;
    let (p2, p2_rec) = join(&host, app, DPORT).await;
    let host_id = host.local_player_id();

    let _ = host
        .send_to(
            ALL_PLAYERS,
            b"to everyone",
            SEND_GUARANTEED | SEND_NOLOOPBACK,
            0,
        )
        .await
        .unwrap();

    for rec in [&p1_rec, &p2_rec] {
        wait_until(
            "fan-out delivery",
            || {
                rec.events()
                    .contains(&Ev::Receive(host_id, b"to everyone".to_vec()))
            },
            2000,
        )
        .await;
    }
    wait_until(
        "one fan-out completion",
        || host_rec.count(|e| matches!(e, Ev::SendComplete(_))) == 1,
        2000,
    )
    .await;
    // NOLOOPBACK suppressed the local delivery but not the completion.
    assert_eq!(host_rec.count(|e| matches!(e, Ev::Receive(..))), 0);

    p2.close(0).await.unwrap();
    p1.close(0).await.unwrap();
    host.close(0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn best_effort_send_over_udp() {
    const DPORT: u16 = 42585;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let host_id = host.local_player_id();
    let (p1, _p1_rec) = join(&host, app, DPORT).await;
    let p1_id = p1.local_player_id();

    // No GUARANTEED flag: the payload rides a datagram.
    let _ = p1.send_to(host_id, b"udp ping", 0, 0).await.unwrap();

    wait_until(
        "datagram delivery",
        || {
            host_rec
                .events()
                .contains(&Ev::Receive(p1_id, b"udp ping".to_vec()))
        },
        2000,
    )
    .await;

    p1.close(0).await.unwrap();
    host.close(0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retained_receive_buffer_returned_later() {
    const DPORT: u16 = 42590;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let host_id = host.local_player_id();
    let (p1, _p1_rec) = join(&host, app, DPORT).await;
    host_rec.retain_receives.store(true, Ordering::SeqCst);

    let _ = p1
        .send_to(host_id, b"keep me", SEND_GUARANTEED, 0)
        .await
        .unwrap();
    wait_until(
        "payload retained",
        || host_rec.retained_buffer.lock().unwrap().is_some(),
        2000,
    )
    .await;

    let buffer = host_rec.retained_buffer.lock().unwrap().take().unwrap();
    host.return_buffer(buffer).unwrap();
    assert!(host_rec.events().contains(&Ev::ReturnBuffer(buffer)));
    assert_eq!(
        host.return_buffer(buffer).unwrap_err(),
        SessionError::BufferNotFound
    );

    p1.close(0).await.unwrap();
    host.close(0).await.unwrap();
}

// =============================================================================
// PEER INFO AND APPLICATION DESCRIPTION
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_peer_info_replicates_to_all() {
    const DPORT: u16 = 42600;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let (p1, _p1_rec) = join(&host, app, DPORT).await;
    let (p2, p2_rec) = join(&host, app, DPORT).await;
    let p1_id = p1.local_player_id();

    let handle = p1
        .set_peer_info("renamed", b"fresh data", SET_INFO_SYNC, 0)
        .await
        .unwrap();
    assert_eq!(handle, 0);

    for rec in [&host_rec, &p2_rec] {
        wait_until(
            "peer-info event",
            || rec.events().contains(&Ev::PeerInfo(p1_id)),
            2000,
        )
        .await;
    }
    let (name, data) = host.get_peer_info(p1_id).unwrap();
    assert_eq!(name, "renamed");
    assert_eq!(data, b"fresh data");
    let (name, _) = p2.get_peer_info(p1_id).unwrap();
    assert_eq!(name, "renamed");

    p2.close(0).await.unwrap();
    p1.close(0).await.unwrap();
    host.close(0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn application_desc_propagation() {
    const DPORT: u16 = 42610;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let (p1, p1_rec) = join(&host, app, DPORT).await;
    let (p2, p2_rec) = join(&host, app, DPORT).await;

    host.set_application_desc(20, "Best Session", Some("P4ssword"), b"blob")
        .await
        .unwrap();

    for rec in [&host_rec, &p1_rec, &p2_rec] {
        wait_until(
            "app-desc event",
            || rec.count(|e| matches!(e, Ev::AppDesc)) == 1,
            1000,
        )
        .await;
        let desc = rec.desc_inside_event.lock().unwrap().clone().unwrap();
        assert_eq!(desc.max_players, 20);
        assert_eq!(desc.session_name, "Best Session");
        assert_eq!(desc.password.as_deref(), Some("P4ssword"));
        assert_eq!(desc.application_data, b"blob");
    }

    // Non-hosts may not rewrite the description.
    assert_eq!(
        p1.set_application_desc(5, "x", None, b"").await.unwrap_err(),
        SessionError::NotHost
    );

    p2.close(0).await.unwrap();
    p1.close(0).await.unwrap();
    host.close(0).await.unwrap();
}

// =============================================================================
// GROUPS
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_create_and_destroy_replicate() {
    const DPORT: u16 = 42620;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let (p1, p1_rec) = join(&host, app, DPORT).await;

    let group = host.create_group("raiders", b"gdata", 0).unwrap();
    assert!(host_rec.events().contains(&Ev::GroupCreate(group)));
    wait_until(
        "group create replicated",
        || p1_rec.events().contains(&Ev::GroupCreate(group)),
        2000,
    )
    .await;

    host.destroy_group(group).unwrap();
    assert!(host_rec.events().contains(&Ev::GroupDestroy(group)));
    wait_until(
        "group destroy replicated",
        || p1_rec.events().contains(&Ev::GroupDestroy(group)),
        2000,
    )
    .await;

    // The id is retired for the rest of the session.
    assert_eq!(
        host.destroy_group(group).unwrap_err(),
        SessionError::GroupNotFound
    );

    p1.close(0).await.unwrap();
    host.close(0).await.unwrap();
}

// =============================================================================
// TEARDOWN
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn host_graceful_close_with_two_peers() {
    const DPORT: u16 = 42630;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let host_id = host.local_player_id();
    let (p1, p1_rec) = join(&host, app, DPORT).await;
    let p1_id = p1.local_player_id();
    let (p2, p2_rec) = join(&host, app, DPORT).await;
    let p2_id = p2.local_player_id();

    wait_until(
        "mesh complete",
        || p1_rec.events().contains(&Ev::CreatePlayer(p2_id)),
        2000,
    )
    .await;

    host.close(0).await.unwrap();

    // Host: the local player goes first, then both remotes, all normal.
    let host_destroys: Vec<(PlayerId, DestroyReason)> = host_rec
        .events()
        .iter()
        .filter_map(|e| match e {
            Ev::DestroyPlayer(id, reason) => Some((*id, *reason)),
            _ => None,
        })
        .collect();
    assert_eq!(host_destroys.len(), 3);
    assert_eq!(host_destroys[0], (host_id, DestroyReason::Normal));
    let remote: HashSet<PlayerId> = host_destroys[1..].iter().map(|(id, _)| *id).collect();
    assert_eq!(remote, [p1_id, p2_id].into_iter().collect::<HashSet<_>>());

    // Peers: a terminate event plus all three players destroyed, the
    // host with reason normal and the local player last.
    for (rec, own_id) in [(&p1_rec, p1_id), (&p2_rec, p2_id)] {
        wait_until(
            "peer teardown",
            || rec.count(|e| matches!(e, Ev::DestroyPlayer(..))) == 3,
            3000,
        )
        .await;
        let events = rec.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Ev::TerminateSession(Err(SessionError::ConnectionLost)))));
        let destroys: Vec<(PlayerId, DestroyReason)> = events
            .iter()
            .filter_map(|e| match e {
                Ev::DestroyPlayer(id, reason) => Some((*id, *reason)),
                _ => None,
            })
            .collect();
        let ids: HashSet<PlayerId> = destroys.iter().map(|(id, _)| *id).collect();
        assert_eq!(
            ids,
            [host_id, p1_id, p2_id].into_iter().collect::<HashSet<_>>()
        );
        for (id, reason) in &destroys {
            if *id == host_id {
                assert_eq!(*reason, DestroyReason::Normal);
            } else {
                assert!(matches!(
                    reason,
                    DestroyReason::Normal | DestroyReason::ConnectionLost
                ));
            }
        }
        assert_eq!(destroys.last().unwrap().0, own_id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_immediate_close() {
    const DPORT: u16 = 42640;
    let app = Guid::random();
    let (host, host_rec) = start_host(app, "Session 1", DPORT).await;
    let (p1, p1_rec) = join(&host, app, DPORT).await;
    let p1_id = p1.local_player_id();

    p1.close(CLOSE_IMMEDIATE).await.unwrap();

    // The departing peer announces itself; the session carries on for
    // the host, who only loses that one player.
    assert!(p1_rec
        .events()
        .iter()
        .any(|e| matches!(e, Ev::DestroyPlayer(id, _) if *id == p1_id)));
    wait_until(
        "host notices departure",
        || {
            host_rec
                .events()
                .iter()
                .any(|e| matches!(e, Ev::DestroyPlayer(id, _) if *id == p1_id))
        },
        2000,
    )
    .await;
    assert_eq!(host_rec.count(|e| matches!(e, Ev::TerminateSession(_))), 0);
    assert!(host.get_application_desc().is_ok());

    host.close(0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn host_destroy_peer_ejects_victim() {
    const DPORT: u16 = 42650;
    let app = Guid::random();
    let (host, _host_rec) = start_host(app, "Session 1", DPORT).await;
    let (p1, p1_rec) = join(&host, app, DPORT).await;
    let p1_id = p1.local_player_id();
    let (p2, p2_rec) = join(&host, app, DPORT).await;

    host.destroy_peer(p1_id, b"you are out").unwrap();

    wait_until(
        "victim leaves voluntarily",
        || p1_rec.count(|e| matches!(e, Ev::TerminateSession(Ok(())))) == 1,
        2000,
    )
    .await;
    wait_until(
        "other peer ejects the victim",
        || {
            p2_rec
                .events()
                .iter()
                .any(|e| matches!(e, Ev::DestroyPlayer(id, _) if *id == p1_id))
        },
        2000,
    )
    .await;

    p2.close(0).await.unwrap();
    host.close(0).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminate_session_reaches_all_peers() {
    const DPORT: u16 = 42660;
    let app = Guid::random();
    let (host, _host_rec) = start_host(app, "Session 1", DPORT).await;
    let (_p1, p1_rec) = join(&host, app, DPORT).await;
    let (_p2, p2_rec) = join(&host, app, DPORT).await;

    host.terminate_session(b"goodnight").await.unwrap();

    for rec in [&p1_rec, &p2_rec] {
        wait_until(
            "terminate delivered",
            || rec.count(|e| matches!(e, Ev::TerminateSession(Ok(())))) == 1,
            3000,
        )
        .await;
    }
}
