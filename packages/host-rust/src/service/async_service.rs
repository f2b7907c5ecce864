//! The two halves of an asynchronous service.
//!
//! Consumers hold an [`AsyncProxy`]-backed capability handle and may call it
//! from any thread. Every call becomes an envelope on the owning group's
//! queue. The [`AsyncServiceImpl`] lives on that group's thread and is the
//! only code that ever touches the implementation state.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use svchost_core::{
    CallError, Decode, Envelope, MessageKind, PendingResult, ProviderId, ResultSlot,
    ServiceError, ServiceGroupId,
};
use tracing::warn;

use crate::group::queue::PushError;
use crate::group::GroupShared;

/// Implementation half of an asynchronous service.
///
/// Constructed on the owning group's thread and never moved off it, so
/// implementations do not need to be `Send`.
pub trait AsyncServiceImpl: 'static {
    /// Executes one call or post addressed to this implementation.
    ///
    /// Results are written into `envelope` (see `Envelope::set_scalar_result`,
    /// `Envelope::set_result`). Returning `Err` records the error on the
    /// envelope for the caller to observe.
    ///
    /// # Errors
    ///
    /// Any [`ServiceError`]; it is delivered to the caller unchanged.
    fn process(&mut self, envelope: &mut Envelope) -> Result<(), ServiceError>;

    /// Called on the owning thread during group shutdown, after the queue is
    /// drained and in descending priority order.
    fn shutdown(&mut self) {}
}

/// Arguments of one call: two scalars plus an optional typed payload.
#[derive(Default)]
pub struct CallArgs {
    param1: i64,
    param2: i64,
    payload: Option<Box<dyn Any + Send>>,
}

impl CallArgs {
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scalars(param1: i64, param2: i64) -> Self {
        Self {
            param1,
            param2,
            payload: None,
        }
    }

    #[must_use]
    pub fn payload<T: Any + Send>(value: T) -> Self {
        Self::none().with_payload(value)
    }

    #[must_use]
    pub fn with_payload<T: Any + Send>(mut self, value: T) -> Self {
        self.payload = Some(Box::new(value));
        self
    }
}

impl fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallArgs")
            .field("param1", &self.param1)
            .field("param2", &self.param2)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

/// Caller-side handle that forwards calls to one async implementation.
///
/// Cheap to clone and usable from any thread. Calls made through clones of the
/// same proxy (or any proxy of the same group) execute in enqueue order.
#[derive(Clone)]
pub struct AsyncProxy {
    group: Arc<GroupShared>,
    target: ProviderId,
}

impl AsyncProxy {
    pub(crate) fn new(group: Arc<GroupShared>, target: ProviderId) -> Self {
        Self { group, target }
    }

    #[must_use]
    pub fn group(&self) -> ServiceGroupId {
        self.group.id
    }

    #[must_use]
    pub fn target(&self) -> ProviderId {
        self.target
    }

    /// Enqueues a call and returns the handle its outcome will arrive on.
    ///
    /// `decode` turns the completed envelope into the typed result; use
    /// `Envelope::read_scalar`, `Envelope::read_unit`, or
    /// `Envelope::read_result::<T>`.
    ///
    /// # Errors
    ///
    /// - `CallError::GroupShutDown` if the owning group is no longer running.
    /// - `CallError::QueueFull` if the group's bounded queue is full and this
    ///   is the thread that executes the group (for the main group, the host
    ///   thread between pumps).
    pub fn call<T>(
        &self,
        method: u32,
        args: CallArgs,
        decode: Decode<T>,
    ) -> Result<PendingResult<T>, CallError> {
        let mut envelope = self.prepare(MessageKind::Call, method, args);
        let slot = ResultSlot::new();
        envelope.set_reply(Arc::clone(&slot));
        self.enqueue(envelope)?;
        Ok(PendingResult::new(slot, decode))
    }

    /// Enqueues a fire-and-forget message. Errors raised while executing it
    /// are logged by the owning group.
    ///
    /// # Errors
    ///
    /// `CallError::GroupShutDown` or `CallError::QueueFull`, as for
    /// [`call`](Self::call).
    pub fn post(&self, method: u32, args: CallArgs) -> Result<(), CallError> {
        let envelope = self.prepare(MessageKind::Post, method, args);
        self.enqueue(envelope)
    }

    fn prepare(&self, kind: MessageKind, method: u32, args: CallArgs) -> Box<Envelope> {
        let mut envelope = self.group.pool.acquire();
        envelope.address(kind, self.target, method);
        envelope.set_params(args.param1, args.param2);
        if let Some(payload) = args.payload {
            envelope.set_payload(payload);
        }
        envelope
    }

    fn enqueue(&self, envelope: Box<Envelope>) -> Result<(), CallError> {
        self.group.queue.push(envelope).map_err(|rejected| {
            let group = self.group.id;
            let err = match rejected {
                PushError::Closed(_) => CallError::GroupShutDown { group },
                PushError::Full(_) => CallError::QueueFull { group },
            };
            if let Err(release) = rejected.into_envelope().release() {
                warn!(%group, error = %release, "failed to recycle rejected envelope");
            }
            err
        })
    }
}

impl fmt::Debug for AsyncProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncProxy")
            .field("group", &self.group.id)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}
