//! The message envelope: one reusable unit describing a cross-thread call and
//! its outcome.
//!
//! An envelope has a fixed shape: a [`MessageKind`], the target provider and
//! method, two scalar parameters, an optional polymorphic payload, an optional
//! captured [`ServiceError`], and a back-reference to the pool it came from.
//! Trivial calls (e.g. "add two integers") travel in the scalar parameters and
//! never allocate a payload.
//!
//! # Lifecycle
//!
//! `Free -> CheckedOut -> InFlight -> Completed -> Free`
//!
//! Envelopes are only created by a [`MessagePool`](crate::pool::MessagePool).
//! While free they are owned by the pool; once released they are reset to the
//! neutral state.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::ServiceError;
use crate::pending::ResultSlot;
use crate::pool::{self, PoolShared, ReleaseError};
use crate::types::ProviderId;

/// Owned, type-erased request or response body.
pub type Payload = Box<dyn Any + Send>;

/// What an envelope represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Neutral state of a freshly acquired envelope.
    Invalid,
    /// A call whose outcome is delivered through a pending-result handle.
    Call,
    /// A fire-and-forget call. Failures are logged by the executing group.
    Post,
    /// Tells a group's pump loop that everything queued before it has been
    /// dispatched and it should stop.
    Shutdown,
}

/// Where an envelope is in its reuse cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    Free,
    CheckedOut,
    InFlight,
    Completed,
}

pub struct Envelope {
    kind: MessageKind,
    target: ProviderId,
    method: u32,
    param1: i64,
    param2: i64,
    payload: Option<Payload>,
    error: Option<ServiceError>,
    /// Set once the executing side writes an outcome.
    has_result: bool,
    state: EnvelopeState,
    reply: Option<Arc<ResultSlot>>,
    pub(crate) origin: Weak<PoolShared>,
}

impl Envelope {
    pub(crate) fn new(origin: Weak<PoolShared>) -> Self {
        Self {
            kind: MessageKind::Invalid,
            target: ProviderId::new(0),
            method: 0,
            param1: 0,
            param2: 0,
            payload: None,
            error: None,
            has_result: false,
            state: EnvelopeState::Free,
            reply: None,
            origin,
        }
    }

    /// Returns every field except the origin to its neutral value.
    pub(crate) fn reset(&mut self) {
        self.kind = MessageKind::Invalid;
        self.target = ProviderId::new(0);
        self.method = 0;
        self.param1 = 0;
        self.param2 = 0;
        self.payload = None;
        self.error = None;
        self.has_result = false;
        self.reply = None;
    }

    pub(crate) fn set_state(&mut self, state: EnvelopeState) {
        self.state = state;
    }

    // -- addressing ---------------------------------------------------------

    /// Describes the call this envelope carries.
    pub fn address(&mut self, kind: MessageKind, target: ProviderId, method: u32) {
        self.kind = kind;
        self.target = target;
        self.method = method;
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn target(&self) -> ProviderId {
        self.target
    }

    #[must_use]
    pub fn method(&self) -> u32 {
        self.method
    }

    #[must_use]
    pub fn state(&self) -> EnvelopeState {
        self.state
    }

    // -- arguments ----------------------------------------------------------

    pub fn set_params(&mut self, param1: i64, param2: i64) {
        self.param1 = param1;
        self.param2 = param2;
    }

    #[must_use]
    pub fn param1(&self) -> i64 {
        self.param1
    }

    #[must_use]
    pub fn param2(&self) -> i64 {
        self.param2
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = Some(payload);
    }

    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Borrows the payload as `T`, if it is one.
    #[must_use]
    pub fn payload_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Moves the payload out as `T`. A payload of another type stays in place.
    pub fn take_payload<T: Any>(&mut self) -> Option<T> {
        let payload = self.payload.take()?;
        match payload.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.payload = Some(other);
                None
            }
        }
    }

    // -- outcome (written by the executing side) ---------------------------

    /// Stores a scalar result in `param1`. Clears any argument payload.
    pub fn set_scalar_result(&mut self, value: i64) {
        self.param1 = value;
        self.param2 = 0;
        self.payload = None;
        self.has_result = true;
    }

    /// Stores a structured result as the payload.
    pub fn set_result<T: Any + Send>(&mut self, value: T) {
        self.payload = Some(Box::new(value));
        self.has_result = true;
    }

    /// Clears the argument payload for calls that return nothing.
    pub fn set_unit_result(&mut self) {
        self.payload = None;
        self.has_result = true;
    }

    /// Whether the executing side wrote an outcome.
    #[must_use]
    pub fn has_result(&self) -> bool {
        self.has_result
    }

    /// Captures a failure. An envelope carrying an error never also carries a
    /// result payload.
    pub fn fail(&mut self, error: ServiceError) {
        self.payload = None;
        self.has_result = false;
        self.error = Some(error);
    }

    #[must_use]
    pub fn error(&self) -> Option<&ServiceError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<ServiceError> {
        self.error.take()
    }

    // -- outcome decoders (used by the consuming side) ---------------------
    //
    // Each returns `None` when the service wrote no result, so the caller sees
    // `CallError::UnexpectedReply` rather than its own arguments echoed back.

    /// Decodes a scalar result written by [`Envelope::set_scalar_result`].
    pub fn read_scalar(&mut self) -> Option<i64> {
        self.has_result.then_some(self.param1)
    }

    /// Decodes the result of a call that returns nothing.
    pub fn read_unit(&mut self) -> Option<()> {
        self.has_result.then_some(())
    }

    /// Decodes a structured result written by [`Envelope::set_result`].
    pub fn read_result<T: Any>(&mut self) -> Option<T> {
        if !self.has_result {
            return None;
        }
        self.take_payload::<T>()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Attaches the slot through which the outcome will be delivered.
    pub fn set_reply(&mut self, slot: Arc<ResultSlot>) {
        self.reply = Some(slot);
    }

    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Marks the envelope as queued for execution.
    pub fn mark_in_flight(&mut self) {
        self.state = EnvelopeState::InFlight;
    }

    /// Completes the envelope after execution.
    ///
    /// If a pending-result handle is attached, the envelope is handed to it and
    /// `None` is returned. Otherwise the envelope goes back to its pool and any
    /// captured error is returned, since nobody else will observe it.
    ///
    /// A handle whose caller already dropped it counts as absent: the error,
    /// if any, is returned the same way.
    pub fn finish(mut self: Box<Self>) -> Option<ServiceError> {
        self.state = EnvelopeState::Completed;
        match self.reply.take() {
            Some(slot) if Arc::strong_count(&slot) > 1 => {
                slot.complete(self);
                None
            }
            _ => {
                let unobserved = self.error.take();
                if let Err(err) = self.release() {
                    tracing::warn!(error = %err, "failed to recycle completed envelope");
                }
                unobserved
            }
        }
    }

    /// Returns the envelope to the pool it was acquired from. If that pool no
    /// longer exists the envelope is simply dropped.
    ///
    /// # Errors
    ///
    /// Returns the envelope inside a [`ReleaseError`] if it is still in flight.
    pub fn release(self: Box<Self>) -> Result<(), ReleaseError> {
        pool::release_to_origin(self)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("method", &self.method)
            .field("param1", &self.param1)
            .field("param2", &self.param2)
            .field("payload", &self.payload.as_ref().map(|_| type_name::<Payload>()))
            .field("error", &self.error)
            .field("has_result", &self.has_result)
            .field("state", &self.state)
            .field("reply", &self.reply.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
