//! Per-connection outbound FIFO.
//!
//! The queue never touches a socket; the connection's writer task peeks
//! the head, performs the write, and reports back via `advance` /
//! `pop_front`. Completions are returned to the caller rather than
//! invoked in place so they can run without the session lock held.

use crate::error::SessionError;
use crate::types::AsyncHandle;
use std::collections::VecDeque;

/// Invoked exactly once with the terminal result of a queued message.
pub type SendCompletion = Box<dyn FnOnce(Result<(), SessionError>) + Send + 'static>;

struct QueuedMessage {
    handle: AsyncHandle,
    frame: Vec<u8>,
    offset: usize,
    completion: Option<SendCompletion>,
}

#[derive(Default)]
pub struct SendQueue {
    queue: VecDeque<QueuedMessage>,
    queued_bytes: usize,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            queue: VecDeque::new(),
            queued_bytes: 0,
        }
    }

    /// `handle` is 0 for internal protocol frames, which are neither
    /// cancellable nor completion-tracked.
    pub fn enqueue(
        &mut self,
        frame: Vec<u8>,
        handle: AsyncHandle,
        completion: Option<SendCompletion>,
    ) {
        self.queued_bytes += frame.len();
        self.queue.push_back(QueuedMessage {
            handle,
            frame,
            offset: 0,
            completion,
        });
    }

    /// Unwritten remainder of the head message.
    pub fn peek_front(&self) -> Option<&[u8]> {
        self.queue.front().map(|m| &m.frame[m.offset..])
    }

    /// Consume `n` bytes of the head after a successful write. Returns
    /// true once the head has been fully written.
    pub fn advance(&mut self, n: usize) -> bool {
        let head = self.queue.front_mut().expect("advance on empty send queue");
        debug_assert!(head.offset + n <= head.frame.len());
        head.offset += n;
        self.queued_bytes -= n;
        head.offset == head.frame.len()
    }

    /// Drop the head and hand its completion (if any) to the caller for
    /// invocation outside the lock.
    pub fn pop_front(&mut self) -> Option<(AsyncHandle, Option<SendCompletion>)> {
        let m = self.queue.pop_front()?;
        self.queued_bytes -= m.frame.len() - m.offset;
        Some((m.handle, m.completion))
    }

    /// Remove a queued message by handle. Partially-transmitted heads
    /// are not removable: the frame boundary is already on the wire.
    pub fn cancel(&mut self, handle: AsyncHandle) -> Option<SendCompletion> {
        let idx = self
            .queue
            .iter()
            .position(|m| m.handle == handle && m.offset == 0)?;
        let m = self.queue.remove(idx).expect("indexed message vanished");
        self.queued_bytes -= m.frame.len();
        m.completion
    }

    /// Empty the queue, returning every completion for invocation with
    /// a terminal result.
    pub fn cancel_all(&mut self) -> Vec<SendCompletion> {
        self.queued_bytes = 0;
        self.queue
            .drain(..)
            .filter_map(|m| m.completion)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// `(messages, bytes)` still queued, for send-queue introspection.
    pub fn info(&self) -> (usize, usize) {
        (self.queue.len(), self.queued_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counted(counter: &Arc<AtomicU32>) -> SendCompletion {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fifo_order_and_partial_advance() {
        let mut q = SendQueue::new();
        q.enqueue(vec![1, 2, 3, 4], 0, None);
        q.enqueue(vec![5, 6], 0, None);

        assert_eq!(q.peek_front().unwrap(), &[1, 2, 3, 4]);
        assert!(!q.advance(2));
        assert_eq!(q.peek_front().unwrap(), &[3, 4]);
        assert!(q.advance(2));
        q.pop_front().unwrap();
        assert_eq!(q.peek_front().unwrap(), &[5, 6]);
        assert_eq!(q.info(), (1, 2));
    }

    #[test]
    fn pop_returns_completion_uninvoked() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut q = SendQueue::new();
        q.enqueue(vec![0], 9, Some(counted(&calls)));
        let (handle, completion) = q.pop_front().unwrap();
        assert_eq!(handle, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        completion.unwrap()(Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_by_handle_only_before_transmission() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut q = SendQueue::new();
        q.enqueue(vec![1, 2], 5, Some(counted(&calls)));
        q.enqueue(vec![3, 4], 6, Some(counted(&calls)));

        // Head has started transmitting: not cancellable.
        q.advance(1);
        assert!(q.cancel(5).is_none());

        let c = q.cancel(6).unwrap();
        c(Err(SessionError::UserCancel));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(q.info().0, 1);
    }

    #[test]
    fn cancel_all_drains_everything() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut q = SendQueue::new();
        q.enqueue(vec![1], 1, Some(counted(&calls)));
        q.enqueue(vec![2], 2, None);
        q.enqueue(vec![3], 3, Some(counted(&calls)));
        let completions = q.cancel_all();
        assert_eq!(completions.len(), 2);
        for c in completions {
            c(Err(SessionError::UserCancel));
        }
        assert!(q.is_empty());
        assert_eq!(q.info(), (0, 0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
