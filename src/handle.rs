//! Asynchronous-operation handle allocation.
//!
//! Handles are opaque non-zero u32s. The top two bits carry the
//! operation kind so that cancellation can dispatch on the handle
//! alone; the low 30 bits come from one wrapping counter per kind.

use crate::types::AsyncHandle;

const KIND_SHIFT: u32 = 30;
const KIND_MASK: u32 = 0b11 << KIND_SHIFT;
const COUNTER_MASK: u32 = !KIND_MASK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Enum,
    Connect,
    Send,
}

impl HandleKind {
    fn tag(self) -> u32 {
        match self {
            HandleKind::Enum => 1 << KIND_SHIFT,
            HandleKind::Connect => 2 << KIND_SHIFT,
            HandleKind::Send => 3 << KIND_SHIFT,
        }
    }

    /// Recover the kind from a handle. 0 and untagged values have none.
    pub fn of(handle: AsyncHandle) -> Option<HandleKind> {
        match handle & KIND_MASK {
            t if t == (1 << KIND_SHIFT) => Some(HandleKind::Enum),
            t if t == (2 << KIND_SHIFT) => Some(HandleKind::Connect),
            t if t == (3 << KIND_SHIFT) => Some(HandleKind::Send),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HandleAllocator {
    next_enum: u32,
    next_connect: u32,
    next_send: u32,
}

impl HandleAllocator {
    pub fn new() -> HandleAllocator {
        HandleAllocator {
            next_enum: 1,
            next_connect: 1,
            next_send: 1,
        }
    }

    fn bump(counter: &mut u32, kind: HandleKind) -> AsyncHandle {
        let handle = *counter | kind.tag();
        *counter = (*counter + 1) & COUNTER_MASK;
        if *counter == 0 {
            *counter = 1;
        }
        handle
    }

    pub fn new_enum(&mut self) -> AsyncHandle {
        Self::bump(&mut self.next_enum, HandleKind::Enum)
    }

    pub fn new_connect(&mut self) -> AsyncHandle {
        Self::bump(&mut self.next_connect, HandleKind::Connect)
    }

    pub fn new_send(&mut self) -> AsyncHandle {
        Self::bump(&mut self.next_send, HandleKind::Send)
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let mut a = HandleAllocator::new();
        let e = a.new_enum();
        let c = a.new_connect();
        let s = a.new_send();
        assert_eq!(HandleKind::of(e), Some(HandleKind::Enum));
        assert_eq!(HandleKind::of(c), Some(HandleKind::Connect));
        assert_eq!(HandleKind::of(s), Some(HandleKind::Send));
        assert_ne!(e, c);
        assert_ne!(c, s);
        assert_eq!(HandleKind::of(0), None);
    }

    #[test]
    fn counters_are_independent() {
        let mut a = HandleAllocator::new();
        let e1 = a.new_enum();
        let e2 = a.new_enum();
        let c1 = a.new_connect();
        assert_eq!(e2 & COUNTER_MASK, (e1 & COUNTER_MASK) + 1);
        assert_eq!(c1 & COUNTER_MASK, 1);
    }

    #[test]
    fn counter_wrap_skips_zero() {
        let mut a = HandleAllocator::new();
        a.next_send = COUNTER_MASK; // highest value the counter can hold
        let h = a.new_send();
        assert_eq!(h & COUNTER_MASK, COUNTER_MASK);
        assert_eq!(a.next_send, 1);
        let h2 = a.new_send();
        assert_eq!(h2 & COUNTER_MASK, 1);
    }
}
