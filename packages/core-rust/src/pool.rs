//! `MessagePool`: reuse cache of envelopes for the per-call hot path.
//!
//! `acquire` prefers a recycled envelope (LIFO, so the most recently used one
//! is still warm) and only allocates when the free list is empty. As a result
//! the number of allocated envelopes never exceeds the high-water mark of
//! envelopes checked out at the same time.
//!
//! A pool is shared between the producers of one service group and the
//! group's executing thread, so its free list sits behind a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PoolError;
use crate::message::{Envelope, EnvelopeState};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Point-in-time view of a pool's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Envelopes ever allocated by this pool.
    pub allocated: usize,
    /// Envelopes currently sitting in the free list.
    pub free: usize,
    /// Envelopes currently handed out.
    pub checked_out: usize,
    /// Largest `checked_out` value observed.
    pub high_water: usize,
}

/// Failed release. The envelope is handed back so it is never silently lost.
#[derive(Debug, thiserror::Error)]
#[error("cannot release envelope: {kind}")]
pub struct ReleaseError {
    pub kind: PoolError,
    pub envelope: Box<Envelope>,
}

impl ReleaseError {
    #[must_use]
    pub fn into_envelope(self) -> Box<Envelope> {
        self.envelope
    }
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<Box<Envelope>>,
    allocated: usize,
    checked_out: usize,
    high_water: usize,
}

pub(crate) struct PoolShared {
    id: u64,
    state: Mutex<PoolState>,
}

/// Cloneable handle to a shared envelope pool.
#[derive(Clone)]
pub struct MessagePool {
    shared: Arc<PoolShared>,
}

impl MessagePool {
    #[must_use]
    pub fn new() -> Self {
        Self::with_prewarmed(0)
    }

    /// Creates a pool whose free list already holds `count` envelopes.
    #[must_use]
    pub fn with_prewarmed(count: usize) -> Self {
        let shared = Arc::new(PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PoolState::default()),
        });
        {
            let origin = Arc::downgrade(&shared);
            let mut state = shared.state.lock();
            state.free.reserve(count);
            for _ in 0..count {
                state.free.push(Box::new(Envelope::new(origin.clone())));
            }
            state.allocated = count;
        }
        Self { shared }
    }

    /// Unique id of this pool, for diagnostics.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Hands out a neutral envelope, reusing a free one when possible.
    #[must_use]
    pub fn acquire(&self) -> Box<Envelope> {
        let mut state = self.shared.state.lock();
        let mut envelope = match state.free.pop() {
            Some(envelope) => envelope,
            None => {
                state.allocated += 1;
                Box::new(Envelope::new(Arc::downgrade(&self.shared)))
            }
        };
        state.checked_out += 1;
        state.high_water = state.high_water.max(state.checked_out);
        drop(state);

        envelope.reset();
        envelope.set_state(EnvelopeState::CheckedOut);
        envelope
    }

    /// Returns an envelope to the free list.
    ///
    /// # Errors
    ///
    /// - [`PoolError::InFlight`] if the envelope is still queued or executing.
    /// - [`PoolError::NotCheckedOut`] if it is already marked free.
    /// - [`PoolError::ForeignPool`] if it was acquired from another pool.
    ///
    /// The envelope is returned inside the error in every case.
    pub fn release(&self, mut envelope: Box<Envelope>) -> Result<(), ReleaseError> {
        if !self.owns(&envelope) {
            return Err(ReleaseError {
                kind: PoolError::ForeignPool,
                envelope,
            });
        }
        match envelope.state() {
            EnvelopeState::InFlight => {
                return Err(ReleaseError {
                    kind: PoolError::InFlight,
                    envelope,
                })
            }
            EnvelopeState::Free => {
                return Err(ReleaseError {
                    kind: PoolError::NotCheckedOut,
                    envelope,
                })
            }
            EnvelopeState::CheckedOut | EnvelopeState::Completed => {}
        }

        envelope.reset();
        envelope.set_state(EnvelopeState::Free);

        let mut state = self.shared.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        state.free.push(envelope);
        Ok(())
    }

    /// Whether `envelope` was allocated by this pool.
    #[must_use]
    pub fn owns(&self, envelope: &Envelope) -> bool {
        std::ptr::eq(envelope.origin.as_ptr(), Arc::as_ptr(&self.shared))
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            allocated: state.allocated,
            free: state.free.len(),
            checked_out: state.checked_out,
            high_water: state.high_water,
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool")
            .field("id", &self.shared.id)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Releases `envelope` into the pool recorded in its back-reference.
pub(crate) fn release_to_origin(envelope: Box<Envelope>) -> Result<(), ReleaseError> {
    match envelope.origin.upgrade() {
        Some(shared) => MessagePool { shared }.release(envelope),
        // Pool already torn down: nothing to return to.
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
