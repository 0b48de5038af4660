//! Per-remote connection state.
//!
//! One `PeerRecord` exists per remote participant, created when a TCP
//! connection is accepted or initiated and destroyed only after the
//! application has seen the matching destroy-player event (when the
//! peer ever reached `Connected`) and every pending operation on it has
//! completed. Records are arena-style: the session owns the map from
//! internal peer id to record, and everything else refers to peers by
//! id only.

use crate::sendqueue::{SendCompletion, SendQueue};
use crate::types::*;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Connection lifecycle. Transitions are driven by the I/O tasks and
/// the join protocol handlers; see the state machine in proto.rs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Inbound connection accepted; waiting for its first message.
    Accepted,
    /// Outbound TCP to the host in progress.
    ConnectingHost,
    /// TCP to host open; CONNECT_HOST sent, awaiting the verdict.
    RequestingHost,
    /// Outbound TCP to a non-host peer in progress.
    ConnectingPeer,
    /// TCP to peer open; CONNECT_PEER sent, awaiting the verdict.
    RequestingPeer,
    /// Host side: join validated, application deciding on admission.
    Indicating,
    /// Fully-fledged session member.
    Connected,
    /// Draining outbound frames before the socket closes. Inbound
    /// application payloads are discarded; acks still resolve.
    Closing,
}

/// Invoked exactly once when the matching ACK arrives, or with a
/// connection-lost code when the peer dies first.
pub type AckCallback = Box<dyn FnOnce(u32, Option<Vec<u8>>) + Send + 'static>;

pub struct PeerRecord {
    pub state: PeerState,

    /// Remote session address: the peer's IP and listener port.
    /// Outgoing connections bind their source to the local session
    /// port, so the accept path sees this directly.
    pub addr: SocketAddrV4,

    /// Valid from `Connected` onwards (0 before).
    pub player_id: PlayerId,
    pub player_name: String,
    pub player_data: Vec<u8>,
    pub player_ctx: UserContext,

    pub send_queue: SendQueue,
    /// Cleared once a graceful shutdown has been queued; the writer
    /// drains the queue and then closes the stream.
    pub send_open: bool,
    pub writer_wake: Arc<Notify>,

    /// Set when the reader saw a clean EOF from the remote.
    pub remote_closed: bool,
    /// Overrides the computed destroy-player reason (host ejections,
    /// session termination).
    pub reason_hint: Option<crate::event::DestroyReason>,
    /// The peer reached `Connected` at some point, so its destruction
    /// must be announced to the application.
    pub reached_connected: bool,

    next_ack_id: u32,
    pub pending_acks: HashMap<u32, AckCallback>,

    /// Reader / writer / connect-attempt tasks, aborted on abrupt
    /// destruction.
    pub tasks: Vec<JoinHandle<()>>,
}

impl PeerRecord {
    pub fn new(state: PeerState, addr: SocketAddrV4) -> PeerRecord {
        PeerRecord {
            state,
            addr,
            player_id: 0,
            player_name: String::new(),
            player_data: Vec::new(),
            player_ctx: 0,
            send_queue: SendQueue::new(),
            send_open: true,
            writer_wake: Arc::new(Notify::new()),
            remote_closed: false,
            reason_hint: None,
            reached_connected: false,
            next_ack_id: 1,
            pending_acks: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Queue a frame and wake the writer.
    pub fn enqueue(&mut self, frame: Vec<u8>, handle: AsyncHandle, completion: Option<SendCompletion>) {
        self.send_queue.enqueue(frame, handle, completion);
        self.writer_wake.notify_one();
    }

    /// Queue a frame and mark the connection as closing afterwards: the
    /// writer drains everything already queued, then shuts the stream
    /// down. Used for FAIL responses and graceful teardown.
    pub fn enqueue_final(&mut self, frame: Vec<u8>) {
        self.send_queue.enqueue(frame, 0, None);
        self.close_after_drain();
    }

    pub fn close_after_drain(&mut self) {
        self.send_open = false;
        self.writer_wake.notify_one();
    }

    /// Per-peer rolling ack id; wraps and skips 0.
    pub fn alloc_ack_id(&mut self) -> u32 {
        let id = self.next_ack_id;
        self.next_ack_id = self.next_ack_id.wrapping_add(1);
        if self.next_ack_id == 0 {
            self.next_ack_id = 1;
        }
        id
    }

    pub fn register_ack(&mut self, ack_id: u32, callback: AckCallback) {
        self.pending_acks.insert(ack_id, callback);
    }

    pub fn take_ack(&mut self, ack_id: u32) -> Option<AckCallback> {
        self.pending_acks.remove(&ack_id)
    }

    /// Flush every pending ack for invocation with a terminal code.
    /// Called before the record is dropped.
    pub fn drain_acks(&mut self) -> Vec<AckCallback> {
        self.pending_acks.drain().map(|(_, cb)| cb).collect()
    }

    /// Still on its way into the session (any pre-`Connected` state).
    pub fn is_joining(&self) -> bool {
        !matches!(self.state, PeerState::Connected | PeerState::Closing)
    }

    pub fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record() -> PeerRecord {
        PeerRecord::new(
            PeerState::Accepted,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000),
        )
    }

    #[test]
    fn ack_ids_roll_and_skip_zero() {
        let mut p = record();
        assert_eq!(p.alloc_ack_id(), 1);
        assert_eq!(p.alloc_ack_id(), 2);
        p.next_ack_id = u32::MAX;
        assert_eq!(p.alloc_ack_id(), u32::MAX);
        assert_eq!(p.alloc_ack_id(), 1);
    }

    #[test]
    fn ack_callbacks_fire_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut p = record();
        let id = p.alloc_ack_id();
        let f = fired.clone();
        p.register_ack(
            id,
            Box::new(move |code, _| {
                assert_eq!(code, RESULT_OK);
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let cb = p.take_ack(id).unwrap();
        cb(RESULT_OK, None);
        assert!(p.take_ack(id).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_acks_empties_table() {
        let mut p = record();
        for _ in 0..3 {
            let id = p.alloc_ack_id();
            p.register_ack(id, Box::new(|_, _| {}));
        }
        assert_eq!(p.drain_acks().len(), 3);
        assert!(p.pending_acks.is_empty());
    }

    #[test]
    fn enqueue_final_closes_send_side() {
        let mut p = record();
        assert!(p.send_open);
        p.enqueue_final(vec![1, 2, 3]);
        assert!(!p.send_open);
        assert!(!p.send_queue.is_empty());
    }
}
