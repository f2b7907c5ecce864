//! Routes envelopes to the async implementations bound to one group.
//!
//! Runs on the group's own thread (the worker, or the host thread for the main
//! group). Implementations are started in ascending priority order and stopped
//! in reverse. A panicking implementation fails the envelope that triggered it
//! and the group keeps running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use metrics::Counter;
use svchost_core::{
    Envelope, MessageKind, Priority, ProviderId, ServiceError, ServiceGroupId, ServiceId,
};
use tracing::{debug, error, warn};

use crate::error::ConfigError;
use crate::service::factory::CreateImplFn;
use crate::service::AsyncServiceImpl;

/// Deferred construction of one async implementation.
pub(crate) struct AsyncLaunch {
    pub(crate) provider: ProviderId,
    pub(crate) service: ServiceId,
    pub(crate) priority: Priority,
    pub(crate) create: CreateImplFn,
}

struct BoundService {
    provider: ProviderId,
    service: ServiceId,
    priority: Priority,
    imp: Box<dyn AsyncServiceImpl>,
}

/// What the executor should do after one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Shutdown,
}

/// Per-group counter handles, registered once.
struct DispatchCounters {
    dispatched: Counter,
    failed: Counter,
    unobserved: Counter,
}

impl DispatchCounters {
    fn new(label: &str) -> Self {
        Self {
            dispatched: metrics::counter!("svchost_envelopes_dispatched_total", "group" => label.to_string()),
            failed: metrics::counter!("svchost_envelopes_failed_total", "group" => label.to_string()),
            unobserved: metrics::counter!("svchost_fire_and_forget_errors_total", "group" => label.to_string()),
        }
    }
}

pub(crate) struct Dispatcher {
    group: ServiceGroupId,
    counters: DispatchCounters,
    /// Ascending (priority, provider) order.
    services: Vec<BoundService>,
}

impl Dispatcher {
    pub(crate) fn new(group: ServiceGroupId, label: &str) -> Self {
        Self {
            group,
            counters: DispatchCounters::new(label),
            services: Vec::new(),
        }
    }

    /// Starts every launch in order. On failure the implementations already
    /// started are stopped in reverse before the error is returned.
    pub(crate) fn start(
        group: ServiceGroupId,
        label: &str,
        launches: Vec<AsyncLaunch>,
    ) -> Result<Self, ConfigError> {
        let mut dispatcher = Self::new(group, label);
        for launch in launches {
            if let Err(err) = dispatcher.launch(launch) {
                dispatcher.stop_services();
                return Err(err);
            }
        }
        Ok(dispatcher)
    }

    /// Constructs one implementation on the current thread and binds it.
    pub(crate) fn launch(&mut self, launch: AsyncLaunch) -> Result<(), ConfigError> {
        let AsyncLaunch {
            provider,
            service,
            priority,
            create,
        } = launch;

        let created = catch_unwind(AssertUnwindSafe(create))
            .map_err(|panic| ServiceError::from_panic(panic.as_ref()))
            .and_then(|result| result);

        match created {
            Ok(imp) => {
                debug!(%service, %priority, %provider, "async service started");
                self.services.push(BoundService {
                    provider,
                    service,
                    priority,
                    imp,
                });
                Ok(())
            }
            Err(source) => {
                error!(%service, %priority, error = %source, "async service failed to start");
                Err(ConfigError::StartFailed { service, source })
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.services.len()
    }

    /// Executes or consumes one envelope.
    pub(crate) fn dispatch(&mut self, envelope: Box<Envelope>) -> Step {
        match envelope.kind() {
            MessageKind::Shutdown => {
                envelope.finish();
                Step::Shutdown
            }
            MessageKind::Call | MessageKind::Post => {
                self.execute(envelope);
                Step::Continue
            }
            MessageKind::Invalid => {
                warn!(group = %self.group, "discarding envelope with invalid kind");
                let mut envelope = envelope;
                envelope.fail(ServiceError::InvalidState(
                    "envelope was never addressed".to_string(),
                ));
                self.complete(envelope);
                Step::Continue
            }
        }
    }

    fn execute(&mut self, mut envelope: Box<Envelope>) {
        let target = envelope.target();
        let method = envelope.method();
        let started = Instant::now();

        let outcome = match self.services.iter_mut().find(|bound| bound.provider == target) {
            Some(bound) => {
                let imp = &mut bound.imp;
                catch_unwind(AssertUnwindSafe(|| imp.process(&mut envelope))).unwrap_or_else(
                    |panic| {
                        let err = ServiceError::from_panic(panic.as_ref());
                        error!(
                            group = %self.group,
                            service = %bound.service,
                            method,
                            error = %err,
                            "async service panicked"
                        );
                        Err(err)
                    },
                )
            }
            None => {
                warn!(group = %self.group, %target, method, "no async service bound to target");
                Err(ServiceError::InvalidState(format!(
                    "no async service bound to {target}"
                )))
            }
        };

        self.counters.dispatched.increment(1);
        if let Err(err) = outcome {
            self.counters.failed.increment(1);
            envelope.fail(err);
        }

        debug!(
            group = %self.group,
            %target,
            method,
            elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "envelope dispatched"
        );
        self.complete(envelope);
    }

    fn complete(&self, envelope: Box<Envelope>) {
        let target = envelope.target();
        let method = envelope.method();
        // Posts, and calls whose handle was dropped, have no one else to
        // report their error to.
        if let Some(unobserved) = envelope.finish() {
            self.counters.unobserved.increment(1);
            warn!(
                group = %self.group,
                %target,
                method,
                error = %unobserved,
                "unobserved call failed"
            );
        }
    }

    /// Stops every implementation in descending priority order.
    pub(crate) fn stop_services(&mut self) {
        while let Some(mut bound) = self.services.pop() {
            let imp = &mut bound.imp;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| imp.shutdown())) {
                error!(
                    group = %self.group,
                    service = %bound.service,
                    error = %ServiceError::from_panic(panic.as_ref()),
                    "async service panicked during shutdown"
                );
            }
            debug!(service = %bound.service, priority = %bound.priority, "async service stopped");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop_services();
    }
}
