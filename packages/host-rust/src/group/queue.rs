//! Ordered envelope queue owned by one service group.
//!
//! The queue also carries the group's lifecycle state so that "is the group
//! accepting work?" and "enqueue" happen under the same lock. Producers can
//! never slip an envelope in behind the shutdown sentinel.
//!
//! The thread that executes the group (the worker, or the host thread for the
//! main group) is recorded when the queue starts running. That thread never
//! blocks on a full queue: it is the only one that could make room.

use std::collections::VecDeque;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use svchost_core::{Envelope, GroupState, MessageKind, ProviderId};

struct QueueInner {
    items: VecDeque<Box<Envelope>>,
    state: GroupState,
    executor: Option<ThreadId>,
}

/// Why a push was refused. Either way the envelope is handed back.
#[derive(Debug)]
pub(crate) enum PushError {
    /// The group is not running.
    Closed(Box<Envelope>),
    /// The bounded queue is full and the producer is the group's own
    /// executing thread.
    Full(Box<Envelope>),
}

impl PushError {
    pub(crate) fn into_envelope(self) -> Box<Envelope> {
        match self {
            PushError::Closed(envelope) | PushError::Full(envelope) => envelope,
        }
    }
}

pub(crate) struct MessageQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

impl MessageQueue {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.unwrap_or(16).min(1024)),
                state: GroupState::Created,
                executor: None,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub(crate) fn state(&self) -> GroupState {
        self.inner.lock().state
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Created -> Running. Any other state is left untouched.
    ///
    /// Must be called on the thread that will execute the group.
    pub(crate) fn set_running(&self) {
        let mut inner = self.inner.lock();
        if inner.state == GroupState::Created {
            inner.state = GroupState::Running;
            inner.executor = Some(thread::current().id());
        }
    }

    /// Appends an envelope, blocking while a bounded queue is full.
    ///
    /// Hands the envelope back if the group is not running (including when it
    /// stops running while this producer was blocked), or if the queue is full
    /// and the caller is the group's executing thread.
    pub(crate) fn push(&self, mut envelope: Box<Envelope>) -> Result<(), PushError> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.state.accepts_messages() {
                return Err(PushError::Closed(envelope));
            }
            match self.capacity {
                Some(capacity) if inner.items.len() >= capacity => {
                    if inner.executor == Some(thread::current().id()) {
                        return Err(PushError::Full(envelope));
                    }
                    self.not_full.wait(&mut inner);
                }
                _ => break,
            }
        }
        envelope.mark_in_flight();
        inner.items.push_back(envelope);
        drop(inner);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an envelope is available.
    pub(crate) fn pop_blocking(&self) -> Box<Envelope> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(envelope) = inner.items.pop_front() {
                drop(inner);
                if self.capacity.is_some() {
                    self.not_full.notify_one();
                }
                return envelope;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    pub(crate) fn try_pop(&self) -> Option<Box<Envelope>> {
        let envelope = self.inner.lock().items.pop_front();
        if envelope.is_some() && self.capacity.is_some() {
            self.not_full.notify_one();
        }
        envelope
    }

    /// Running -> Draining.
    ///
    /// Appends `sentinel` as a `Shutdown` envelope behind everything already
    /// queued and returns how many envelopes were pending ahead of it. If the
    /// group is already draining or stopped the sentinel is handed back.
    pub(crate) fn begin_drain(&self, mut sentinel: Box<Envelope>) -> Result<usize, Box<Envelope>> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, GroupState::Draining | GroupState::Stopped) {
            return Err(sentinel);
        }
        inner.state = GroupState::Draining;
        let pending = inner.items.len();

        sentinel.address(MessageKind::Shutdown, ProviderId::new(0), 0);
        sentinel.mark_in_flight();
        // The sentinel ignores the capacity bound: it must always get in.
        inner.items.push_back(sentinel);
        drop(inner);

        self.not_empty.notify_all();
        // Wake blocked producers so they observe the new state and give up.
        self.not_full.notify_all();
        Ok(pending)
    }

    /// Terminal state. Later pushes fail immediately.
    pub(crate) fn mark_stopped(&self) {
        self.inner.lock().state = GroupState::Stopped;
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use svchost_core::MessagePool;

    use super::*;

    fn envelope(pool: &MessagePool, method: u32) -> Box<Envelope> {
        let mut env = pool.acquire();
        env.address(MessageKind::Post, ProviderId::new(1), method);
        env
    }

    #[test]
    fn created_queue_rejects_producers() {
        let pool = MessagePool::new();
        let queue = MessageQueue::new(None);
        assert_eq!(queue.state(), GroupState::Created);

        let rejected = queue.push(envelope(&pool, 1)).unwrap_err();
        assert!(matches!(rejected, PushError::Closed(_)));
        assert_eq!(rejected.into_envelope().method(), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn push_and_pop_are_fifo() {
        let pool = MessagePool::new();
        let queue = MessageQueue::new(None);
        queue.set_running();
        for method in 0..5 {
            queue.push(envelope(&pool, method)).unwrap();
        }
        let order: Vec<u32> = (0..5).map(|_| queue.pop_blocking().method()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn pushed_envelopes_are_in_flight() {
        let pool = MessagePool::new();
        let queue = MessageQueue::new(None);
        queue.set_running();
        queue.push(envelope(&pool, 0)).unwrap();
        let env = queue.try_pop().unwrap();
        assert_eq!(env.state(), svchost_core::EnvelopeState::InFlight);
    }

    #[test]
    fn drain_appends_sentinel_and_rejects_new_work() {
        let pool = MessagePool::new();
        let queue = MessageQueue::new(None);
        queue.set_running();
        queue.push(envelope(&pool, 7)).unwrap();

        assert_eq!(queue.begin_drain(pool.acquire()).unwrap(), 1);
        assert_eq!(queue.state(), GroupState::Draining);
        assert!(queue.push(envelope(&pool, 8)).is_err());

        assert_eq!(queue.pop_blocking().method(), 7);
        assert_eq!(queue.pop_blocking().kind(), MessageKind::Shutdown);

        // A second drain request is refused.
        assert!(queue.begin_drain(pool.acquire()).is_err());

        queue.mark_stopped();
        assert_eq!(queue.state(), GroupState::Stopped);
        assert!(queue.push(envelope(&pool, 9)).is_err());
    }

    #[test]
    fn pop_blocks_until_push() {
        let pool = MessagePool::new();
        let queue = Arc::new(MessageQueue::new(None));
        queue.set_running();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_blocking().method())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(envelope(&pool, 42)).unwrap();

        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn bounded_queue_blocks_producer_until_space() {
        let pool = MessagePool::new();
        let queue = Arc::new(MessageQueue::new(Some(1)));
        queue.set_running();
        queue.push(envelope(&pool, 1)).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let env = envelope(&pool, 2);
            thread::spawn(move || queue.push(env).is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop_blocking().method(), 1);
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop_blocking().method(), 2);
    }

    #[test]
    fn blocked_producer_is_released_by_drain() {
        let pool = MessagePool::new();
        let queue = Arc::new(MessageQueue::new(Some(1)));
        queue.set_running();
        queue.push(envelope(&pool, 1)).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let env = envelope(&pool, 2);
            thread::spawn(move || queue.push(env).is_err())
        };
        thread::sleep(Duration::from_millis(20));
        queue.begin_drain(pool.acquire()).unwrap();

        assert!(producer.join().unwrap());
    }

    #[test]
    fn full_queue_refuses_its_own_executor_instead_of_blocking() {
        let pool = MessagePool::new();
        let queue = Arc::new(MessageQueue::new(Some(1)));
        queue.set_running();
        queue.push(envelope(&pool, 1)).unwrap();

        let refused = queue.push(envelope(&pool, 2)).unwrap_err();
        assert!(matches!(refused, PushError::Full(_)));
        assert_eq!(refused.into_envelope().method(), 2);
        assert_eq!(queue.len(), 1);

        // Any other thread still waits for room.
        let producer = {
            let queue = Arc::clone(&queue);
            let env = envelope(&pool, 3);
            thread::spawn(move || queue.push(env).is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop_blocking().method(), 1);
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop_blocking().method(), 3);
    }
}
