//! Host discovery.
//!
//! One task per `enum_hosts` call: broadcast (or unicast) the query on
//! a throwaway UDP socket, collect responses between retries, dispatch
//! one `enum_hosts_response` event per reply, and deliver exactly one
//! completion when the schedule ends or the operation is cancelled.
//! The schedule sends `enum_count` queries spaced `retry_interval_ms`
//! apart and waits `timeout_ms` after the last one.

use crate::error::SessionError;
use crate::event::EnumHostInfo;
use crate::message::{HostEnumRequest, HostEnumResponse, MSG_HOST_ENUM_RESPONSE};
use crate::ops::PendingOp;
use crate::packet::PacketReader;
use crate::session::SessionShared;
use crate::types::*;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Parameters for a host enumeration. Zero counts and intervals select
/// the defaults.
#[derive(Debug, Clone, Default)]
pub struct EnumHostsParams {
    /// Only sessions of this application answer; `None` matches all.
    pub application: Option<Guid>,
    /// Where to send the query; `None` broadcasts on the discovery
    /// port.
    pub target: Option<SocketAddrV4>,
    /// Opaque payload surfaced to each host's `enum_hosts_query`.
    pub user_data: Option<Vec<u8>>,
    pub enum_count: u32,
    pub retry_interval_ms: u64,
    pub timeout_ms: u64,
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run(
    shared: Arc<SessionShared>,
    reg_handle: AsyncHandle,
    exposed: AsyncHandle,
    ctx: UserContext,
    params: EnumHostsParams,
    discovery_port: u16,
    mut cancel: watch::Receiver<bool>,
    waiter: Option<oneshot::Sender<Result<(), SessionError>>>,
) {
    let result = drive(&shared, exposed, ctx, &params, discovery_port, &mut cancel).await;
    debug!(handle = reg_handle, ok = result.is_ok(), "enumeration finished");

    // Whoever removes the registry entry owns delivering the single
    // completion; close() claims it when it drains leftovers.
    let op = shared.lock().ops.remove(reg_handle);
    match waiter {
        Some(w) => {
            let _ = w.send(if op.is_some() {
                result
            } else {
                Err(SessionError::UserCancel)
            });
        }
        None => {
            if let Some(PendingOp::Enum { ctx, .. }) = op {
                shared.handler.async_op_complete(exposed, ctx, result);
            }
        }
    }
}

async fn drive(
    shared: &Arc<SessionShared>,
    exposed: AsyncHandle,
    ctx: UserContext,
    params: &EnumHostsParams,
    discovery_port: u16,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let count = if params.enum_count == 0 {
        DEFAULT_ENUM_COUNT
    } else {
        params.enum_count
    };
    let interval = Duration::from_millis(if params.retry_interval_ms == 0 {
        DEFAULT_ENUM_RETRY_MS
    } else {
        params.retry_interval_ms
    });
    let timeout = Duration::from_millis(if params.timeout_ms == 0 {
        DEFAULT_ENUM_TIMEOUT_MS
    } else {
        params.timeout_ms
    });

    let sock = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
        .await?;
    sock.set_broadcast(true)?;
    let target = params
        .target
        .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::BROADCAST, discovery_port));

    let mut buf = vec![0u8; 64 * 1024];
    for i in 0..count {
        if *cancel.borrow() {
            return Err(SessionError::UserCancel);
        }
        let frame = HostEnumRequest {
            application: params.application,
            user_data: params.user_data.clone(),
            tick: shared.tick_ms(),
        }
        .encode();
        let _ = sock.send_to(&frame, SocketAddr::V4(target)).await;

        // Responses are collected until the next retry; after the last
        // query the tail window is the caller's timeout.
        let window = if i + 1 == count { timeout } else { interval };
        let deadline = tokio::time::Instant::now() + window;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(SessionError::UserCancel);
                    }
                }
                recv = sock.recv_from(&mut buf) => {
                    if let Ok((n, SocketAddr::V4(from))) = recv {
                        if let Some(info) = parse_response(shared, &buf[..n], from) {
                            shared.handler.enum_hosts_response(exposed, ctx, &info);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn parse_response(
    shared: &Arc<SessionShared>,
    data: &[u8],
    from: SocketAddrV4,
) -> Option<EnumHostInfo> {
    let r = PacketReader::parse(data).ok()?;
    if r.msg_id() != MSG_HOST_ENUM_RESPONSE {
        return None;
    }
    let resp = HostEnumResponse::decode(&r).ok()?;
    Some(EnumHostInfo {
        desc: ApplicationDesc {
            instance: resp.instance,
            application: resp.application,
            max_players: resp.max_players,
            current_players: resp.current_players,
            session_name: resp.session_name,
            password: None,
            application_data: resp.application_data.unwrap_or_default(),
        },
        from,
        response_data: resp.response_data,
        round_trip_ms: shared.tick_ms().wrapping_sub(resp.tick),
    })
}
