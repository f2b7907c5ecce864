//! The main service group, executed cooperatively by the host thread.

use std::sync::Arc;

use svchost_core::ServiceError;
use tracing::{debug, info};

use super::dispatch::{AsyncLaunch, Dispatcher, Step};
use super::GroupShared;
use crate::error::ConfigError;

pub(crate) struct MainGroup {
    shared: Arc<GroupShared>,
    dispatcher: Option<Dispatcher>,
    budget: Option<usize>,
}

impl MainGroup {
    pub(crate) fn new(shared: Arc<GroupShared>, budget: Option<usize>) -> Self {
        let dispatcher = Dispatcher::new(shared.id, &shared.label());
        Self {
            shared,
            dispatcher: Some(dispatcher),
            budget,
        }
    }

    /// Constructs a main-group async implementation on the calling thread.
    pub(crate) fn launch(&mut self, launch: AsyncLaunch) -> Result<(), ConfigError> {
        match self.dispatcher.as_mut() {
            Some(dispatcher) => dispatcher.launch(launch),
            None => Err(ConfigError::StartFailed {
                service: launch.service,
                source: ServiceError::InvalidState(
                    "main group already stopped".to_string(),
                ),
            }),
        }
    }

    /// Opens the queue and records the calling thread as the one that pumps it.
    pub(crate) fn set_running(&self) {
        self.shared.queue.set_running();
        info!(
            services = self.dispatcher.as_ref().map_or(0, Dispatcher::len),
            "main service group running"
        );
    }

    /// Dispatches the envelopes that were queued when the pump started, up to
    /// the configured budget. Returns how many were dispatched.
    pub(crate) fn pump(&mut self) -> usize {
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return 0;
        };

        let queued = self.shared.queue.len();
        let limit = self.budget.map_or(queued, |budget| budget.min(queued));
        let mut dispatched = 0;
        while dispatched < limit {
            let Some(envelope) = self.shared.queue.try_pop() else {
                break;
            };
            match dispatcher.dispatch(envelope) {
                Step::Continue => dispatched += 1,
                Step::Shutdown => break,
            }
        }
        dispatched
    }

    /// Drains everything still queued, stops the main-group implementations
    /// in descending priority order, and marks the group stopped. Idempotent.
    pub(crate) fn stop(&mut self) {
        let Some(mut dispatcher) = self.dispatcher.take() else {
            return;
        };
        let pending = self.shared.begin_drain().unwrap_or(0);
        info!(pending, "draining main service group");

        let mut drained = 0_usize;
        while let Some(envelope) = self.shared.queue.try_pop() {
            match dispatcher.dispatch(envelope) {
                Step::Continue => drained += 1,
                Step::Shutdown => break,
            }
        }
        debug!(drained, "main service group drained");

        dispatcher.stop_services();
        self.shared.queue.mark_stopped();
    }
}

impl Drop for MainGroup {
    fn drop(&mut self) {
        self.stop();
    }
}
