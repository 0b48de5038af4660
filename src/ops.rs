//! Pending asynchronous-operation registry.
//!
//! Every async operation in flight (enumeration, connect, send,
//! peer-info update) owns exactly one entry here, keyed by its opaque
//! handle, until its single completion is delivered. Cancellation, by
//! handle or by scope mask, works off this table; the kind-specific
//! teardown lives in session.rs.

use crate::types::*;
use std::collections::HashMap;
use tokio::sync::{oneshot, watch};

/// Signals a synchronous caller parked on the operation.
pub type SyncWaiter = oneshot::Sender<Result<(), crate::error::SessionError>>;

pub enum PendingOp {
    /// A running host enumeration. `cancel` stops the retry schedule.
    /// Sync enumerations resolve through the task's waiter and never
    /// dispatch a completion event.
    Enum {
        ctx: UserContext,
        cancel: watch::Sender<bool>,
        sync: bool,
    },
    /// The (single) outstanding connect.
    Connect { ctx: UserContext },
    /// A guaranteed send still sitting in peer send queues.
    Send {
        ctx: UserContext,
        /// Internal peer ids whose queues may still hold the frame.
        peer_ids: Vec<u64>,
        waiter: Option<SyncWaiter>,
    },
    /// A peer-info update waiting for acks.
    PlayerInfo {
        ctx: UserContext,
        /// `(peer_id, ack_id)` pairs not yet acknowledged.
        acks: Vec<(u64, u32)>,
        waiter: Option<SyncWaiter>,
    },
}

impl PendingOp {
    fn scope_bit(&self) -> u32 {
        match self {
            PendingOp::Enum { .. } => CANCEL_ENUMS,
            PendingOp::Connect { .. } => CANCEL_CONNECTS,
            PendingOp::Send { .. } => CANCEL_SENDS,
            PendingOp::PlayerInfo { .. } => CANCEL_PLAYER_INFOS,
        }
    }
}

#[derive(Default)]
pub struct OpRegistry {
    ops: HashMap<AsyncHandle, PendingOp>,
}

impl OpRegistry {
    pub fn new() -> OpRegistry {
        OpRegistry {
            ops: HashMap::new(),
        }
    }

    pub fn insert(&mut self, handle: AsyncHandle, op: PendingOp) {
        debug_assert!(handle != 0);
        self.ops.insert(handle, op);
    }

    pub fn remove(&mut self, handle: AsyncHandle) -> Option<PendingOp> {
        self.ops.remove(&handle)
    }

    pub fn get_mut(&mut self, handle: AsyncHandle) -> Option<&mut PendingOp> {
        self.ops.get_mut(&handle)
    }

    pub fn contains(&self, handle: AsyncHandle) -> bool {
        self.ops.contains_key(&handle)
    }

    /// Handles whose operation kind falls inside the scope mask.
    pub fn handles_in_scope(&self, scope: u32) -> Vec<AsyncHandle> {
        self.ops
            .iter()
            .filter(|(_, op)| op.scope_bit() & scope != 0)
            .map(|(h, _)| *h)
            .collect()
    }

    /// Drain every pending operation; used by close.
    pub fn drain(&mut self) -> Vec<(AsyncHandle, PendingOp)> {
        self.ops.drain().collect()
    }
}
