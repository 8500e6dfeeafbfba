//! Bounded queue whose sending side can be closed exactly once.
//!
//! The fan-out loop and session teardown may both try to close a
//! session's output queue. [`OutputQueue::close`] is idempotent and
//! reports whether this call was the one that closed it; pushes after
//! close are silent no-ops.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Outcome of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The item was queued.
    Sent,
    /// The queue was full; the item was dropped.
    Full,
    /// The queue is closed, or its receiver is gone.
    Closed,
}

/// Sending half of a bounded queue with a one-time close guard.
#[derive(Debug)]
pub struct OutputQueue<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    closed: AtomicBool,
}

/// Create a queue holding at most `capacity` items.
pub fn bounded<T>(capacity: usize) -> (OutputQueue<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let queue = OutputQueue {
        tx: Mutex::new(Some(tx)),
        closed: AtomicBool::new(false),
    };
    (queue, rx)
}

impl<T> OutputQueue<T> {
    /// Push without waiting.
    pub fn try_push(&self, item: T) -> Delivery {
        if self.closed.load(Ordering::Acquire) {
            return Delivery::Closed;
        }
        let Ok(guard) = self.tx.lock() else {
            return Delivery::Closed;
        };
        match guard.as_ref() {
            Some(tx) => match tx.try_send(item) {
                Ok(()) => Delivery::Sent,
                Err(TrySendError::Full(_)) => Delivery::Full,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
            None => Delivery::Closed,
        }
    }

    /// Close the queue. Returns `true` only for the call that closed it.
    ///
    /// Items already queued stay readable; the receiver sees the end of
    /// the stream once they are drained.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_until_full() {
        let (q, mut rx) = bounded::<u32>(2);
        assert_eq!(q.try_push(1), Delivery::Sent);
        assert_eq!(q.try_push(2), Delivery::Sent);
        assert_eq!(q.try_push(3), Delivery::Full);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(q.try_push(4), Delivery::Sent);
    }

    #[test]
    fn close_is_once() {
        let (q, _rx) = bounded::<u32>(1);
        assert!(q.close());
        assert!(!q.close());
        assert!(q.is_closed());
        assert_eq!(q.try_push(1), Delivery::Closed);
    }

    #[tokio::test]
    async fn receiver_drains_then_ends() {
        let (q, mut rx) = bounded::<u32>(4);
        q.try_push(7);
        q.close();
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn dropped_receiver_reads_as_closed() {
        let (q, rx) = bounded::<u32>(1);
        drop(rx);
        assert_eq!(q.try_push(1), Delivery::Closed);
    }
}
