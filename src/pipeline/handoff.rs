//! Bounded single-producer/single-consumer handoff between pipeline stages.
//!
//! Plain `mpsc` channels either block or fail when full; media streams need
//! a third behavior. Video wants drop-oldest (stale frames are worthless,
//! newest frame wins), while audio must never be discarded silently, so its
//! producer blocks briefly and then surfaces an error. [`BoundedHandoff`]
//! implements both policies over one queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// What to do when a push finds the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued item and count it as dropped. Used for video.
    DropOldest,
    /// Make the producer wait up to its deadline, then error. Used for
    /// audio, which is never dropped silently on the sender.
    Block,
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    dropped: AtomicU64,
    /// Signaled on push (wakes the consumer) and on pop (wakes a blocked
    /// producer).
    notify_pop: Notify,
    notify_push: Notify,
}

/// Bounded SPSC queue with per-stream overflow policy.
pub struct BoundedHandoff<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedHandoff<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> BoundedHandoff<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "handoff capacity must be non-zero");
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                policy,
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                notify_pop: Notify::new(),
                notify_push: Notify::new(),
            }),
        }
    }

    /// Single enqueue attempt. Returns the item back when the queue is full
    /// under the `Block` policy or already closed.
    fn offer(&self, item: T) -> std::result::Result<(), T> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(item);
        }
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= self.shared.capacity {
            match self.shared.policy {
                OverflowPolicy::DropOldest => {
                    queue.pop_front();
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                }
                OverflowPolicy::Block => return Err(item),
            }
        }
        queue.push_back(item);
        drop(queue);
        self.shared.notify_pop.notify_one();
        Ok(())
    }

    /// Push without waiting. Under `DropOldest` this always succeeds on an
    /// open queue; under `Block` it fails when full.
    pub fn try_push(&self, item: T) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::invariant("handoff closed"));
        }
        match self.offer(item) {
            Ok(()) => Ok(()),
            Err(_) if self.is_closed() => Err(Error::invariant("handoff closed")),
            Err(_) => Err(Error::transient_io("handoff full")),
        }
    }

    /// Push, waiting up to `deadline` for space when the policy is `Block`.
    ///
    /// A sustained overflow (no space freed within the deadline) surfaces a
    /// transient-io error to the caller so backpressure becomes visible.
    pub async fn push(&self, item: T, deadline: Duration) -> Result<()> {
        let wait = tokio::time::sleep(deadline);
        tokio::pin!(wait);

        let mut pending = item;
        loop {
            pending = match self.offer(pending) {
                Ok(()) => return Ok(()),
                Err(_) if self.is_closed() => return Err(Error::invariant("handoff closed")),
                Err(item) => item,
            };
            tokio::select! {
                _ = self.shared.notify_push.notified() => {}
                _ = &mut wait => {
                    return Err(Error::transient_io("handoff full past deadline"));
                }
            }
        }
    }

    /// Receive the next item, waiting up to `deadline`. Returns `None` on
    /// timeout or when the queue is closed and drained.
    pub async fn recv(&self, deadline: Duration) -> Option<T> {
        let wait = tokio::time::sleep(deadline);
        tokio::pin!(wait);

        loop {
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if let Some(item) = queue.pop_front() {
                    drop(queue);
                    self.shared.notify_push.notify_one();
                    return Some(item);
                }
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            tokio::select! {
                _ = self.shared.notify_pop.notified() => {}
                _ = &mut wait => return None,
            }
        }
    }

    /// Non-blocking pop.
    pub fn try_recv(&self) -> Option<T> {
        let mut queue = self.shared.queue.lock().unwrap();
        let item = queue.pop_front();
        drop(queue);
        if item.is_some() {
            self.shared.notify_push.notify_one();
        }
        item
    }

    /// Close the queue. Pending items remain receivable; producers fail.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify_pop.notify_waiters();
        self.shared.notify_push.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Discard everything queued. Used while draining on shutdown.
    pub fn drain(&self) -> usize {
        let mut queue = self.shared.queue.lock().unwrap();
        let n = queue.len();
        queue.clear();
        drop(queue);
        self.shared.notify_push.notify_waiters();
        n
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items evicted by the drop-oldest policy since creation.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
