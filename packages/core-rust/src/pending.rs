//! One-shot result delivery between the executing thread and the caller.
//!
//! A [`ResultSlot`] is a single-producer/single-consumer cell with three
//! states: `Pending -> Ready -> Consumed`. The executing side completes it
//! exactly once by handing over the finished envelope; the consuming side
//! takes the outcome exactly once. Taking swaps the state to `Consumed` under
//! the slot's lock, so two racing takes can never both succeed.
//!
//! [`PendingResult`] is the typed caller-side handle. It supports a bounded
//! wait, a non-blocking poll, a blocking take, and `.await`. A wait that times
//! out does not invalidate the handle: the call keeps running and the result
//! can still be taken later.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::CallError;
use crate::message::Envelope;

/// Observable state of a pending result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    /// The call has not completed yet.
    Pending,
    /// The outcome is available and has not been taken.
    Ready,
    /// The outcome was taken. Terminal.
    Consumed,
}

enum SlotInner {
    Pending { waker: Option<Waker> },
    Ready(Box<Envelope>),
    Consumed,
}

impl SlotInner {
    fn state(&self) -> ResultState {
        match self {
            SlotInner::Pending { .. } => ResultState::Pending,
            SlotInner::Ready(_) => ResultState::Ready,
            SlotInner::Consumed => ResultState::Consumed,
        }
    }
}

/// Shared completion cell for one call.
pub struct ResultSlot {
    inner: Mutex<SlotInner>,
    ready: Condvar,
}

impl ResultSlot {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SlotInner::Pending { waker: None }),
            ready: Condvar::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> ResultState {
        self.inner.lock().state()
    }

    /// Delivers the completed envelope and wakes every waiter.
    pub(crate) fn complete(&self, envelope: Box<Envelope>) {
        let mut inner = self.inner.lock();
        if !matches!(*inner, SlotInner::Pending { .. }) {
            drop(inner);
            tracing::warn!("result slot completed twice; discarding second outcome");
            if let Err(err) = envelope.release() {
                tracing::warn!(error = %err, "failed to recycle duplicate envelope");
            }
            return;
        }
        let waker = match std::mem::replace(&mut *inner, SlotInner::Ready(envelope)) {
            SlotInner::Pending { waker } => waker,
            _ => None,
        };
        drop(inner);

        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Blocks until the slot leaves `Pending` or the deadline passes.
    fn wait_until(&self, deadline: Option<Instant>) -> ResultState {
        let mut inner = self.inner.lock();
        while matches!(*inner, SlotInner::Pending { .. }) {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready.wait(&mut inner),
            }
        }
        inner.state()
    }

    /// Takes the envelope if ready. `Err(())` means it was already consumed.
    fn try_take(&self) -> Option<Result<Box<Envelope>, ()>> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut *inner, SlotInner::Consumed) {
            SlotInner::Ready(envelope) => Some(Ok(envelope)),
            SlotInner::Consumed => Some(Err(())),
            pending @ SlotInner::Pending { .. } => {
                *inner = pending;
                None
            }
        }
    }

    /// Like `try_take`, but registers `waker` while still pending.
    fn poll_take(&self, waker: &Waker) -> Option<Result<Box<Envelope>, ()>> {
        let mut inner = self.inner.lock();
        if let SlotInner::Pending { waker: slot_waker } = &mut *inner {
            match slot_waker {
                Some(existing) if existing.will_wake(waker) => {}
                _ => *slot_waker = Some(waker.clone()),
            }
            return None;
        }
        drop(inner);
        self.try_take()
    }
}

impl Drop for ResultSlot {
    fn drop(&mut self) {
        // A handle discarded before its result arrived: recycle the envelope.
        let inner = std::mem::replace(self.inner.get_mut(), SlotInner::Consumed);
        if let SlotInner::Ready(mut envelope) = inner {
            if let Some(error) = envelope.take_error() {
                tracing::warn!(
                    provider = %envelope.target(),
                    method = envelope.method(),
                    error = %error,
                    "call failed after its result handle was dropped"
                );
            }
            if let Err(err) = envelope.release() {
                tracing::warn!(error = %err, "failed to recycle unclaimed envelope");
            }
        }
    }
}

impl fmt::Debug for ResultSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSlot")
            .field("state", &self.state())
            .finish()
    }
}

/// Decoder turning a completed envelope into the caller's result type.
pub type Decode<T> = fn(&mut Envelope) -> Option<T>;

/// Caller-side handle to the outcome of one asynchronous call.
pub struct PendingResult<T> {
    slot: Arc<ResultSlot>,
    decode: Decode<T>,
}

impl<T> PendingResult<T> {
    #[must_use]
    pub fn new(slot: Arc<ResultSlot>, decode: Decode<T>) -> Self {
        Self { slot, decode }
    }

    #[must_use]
    pub fn state(&self) -> ResultState {
        self.slot.state()
    }

    /// Non-blocking poll.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ResultState::Ready
    }

    /// Waits at most `timeout` for the call to complete.
    ///
    /// Returns `Pending` on timeout; the handle stays valid and the result can
    /// still be taken once it arrives. A zero timeout only polls.
    #[must_use]
    pub fn wait_for(&self, timeout: Duration) -> ResultState {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.slot.wait_until(Some(deadline)),
            None => self.slot.wait_until(None),
        }
    }

    /// Waits until the call completes.
    #[must_use]
    pub fn wait(&self) -> ResultState {
        self.slot.wait_until(None)
    }

    /// Takes the outcome if it is available.
    ///
    /// Returns `None` while pending, and `Some(Err(CallError::AlreadyConsumed))`
    /// once the outcome has been taken.
    pub fn try_take(&self) -> Option<Result<T, CallError>> {
        self.slot
            .try_take()
            .map(|taken| taken.map_or(Err(CallError::AlreadyConsumed), |env| self.finish(env)))
    }

    /// Blocks until the call completes, then takes its outcome.
    ///
    /// # Errors
    ///
    /// - [`CallError::Remote`] carrying the error raised by the service.
    /// - [`CallError::AlreadyConsumed`] if the outcome was already taken.
    /// - [`CallError::UnexpectedReply`] if the reply could not be decoded as `T`.
    pub fn take(&self) -> Result<T, CallError> {
        let _ = self.wait();
        self.try_take().unwrap_or(Err(CallError::AlreadyConsumed))
    }

    fn finish(&self, mut envelope: Box<Envelope>) -> Result<T, CallError> {
        let outcome = match envelope.take_error() {
            Some(err) => Err(CallError::Remote(err)),
            None => (self.decode)(&mut envelope).ok_or(CallError::UnexpectedReply {
                expected: type_name::<T>(),
            }),
        };
        if let Err(err) = envelope.release() {
            tracing::warn!(error = %err, "failed to recycle consumed envelope");
        }
        outcome
    }
}

impl<T> Future for PendingResult<T> {
    type Output = Result<T, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.slot.poll_take(cx.waker()) {
            None => Poll::Pending,
            Some(Ok(envelope)) => Poll::Ready(self.finish(envelope)),
            Some(Err(())) => Poll::Ready(Err(CallError::AlreadyConsumed)),
        }
    }
}

impl<T> fmt::Debug for PendingResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResult")
            .field("type", &type_name::<T>())
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
