//! The running host: owns every service group and the provider.
//!
//! Created by `ServiceRegistry::start`. Shutdown (explicit or on drop) runs
//! in this order:
//!
//! 1. Worker groups drain and stop, most recently created first.
//! 2. The main group drains and its async implementations stop.
//! 3. The provider table is closed; later lookups fail.
//! 4. Global services are released in descending priority order.

use std::collections::HashMap;
use std::sync::Arc;

use svchost_core::{GroupState, PoolStats, Priority, ServiceGroupId, ServiceId};
use tracing::{debug, info};

use crate::group::main_group::MainGroup;
use crate::group::worker::WorkerGroup;
use crate::group::GroupShared;
use crate::service::factory::SharedInstance;
use crate::service::ServiceProvider;

pub(crate) struct StartedGlobal {
    pub(crate) service: ServiceId,
    pub(crate) priority: Priority,
    pub(crate) instance: SharedInstance,
}

/// Everything that has been started and must be stopped in order.
pub(crate) struct HostServices {
    pub(crate) main: MainGroup,
    /// Ascending priority order.
    pub(crate) globals: Vec<StartedGlobal>,
    /// Group creation order.
    pub(crate) workers: Vec<WorkerGroup>,
}

impl HostServices {
    pub(crate) fn new(main: MainGroup) -> Self {
        Self {
            main,
            globals: Vec::new(),
            workers: Vec::new(),
        }
    }

    /// Stops whatever has been started so far. Idempotent.
    pub(crate) fn stop(&mut self) {
        self.stop_groups();
        self.release_globals();
    }

    /// Worker groups in reverse creation order, then the main group.
    pub(crate) fn stop_groups(&mut self) {
        while let Some(mut worker) = self.workers.pop() {
            worker.stop();
        }
        self.main.stop();
    }

    /// Descending priority order.
    pub(crate) fn release_globals(&mut self) {
        while let Some(global) = self.globals.pop() {
            debug!(
                service = %global.service,
                priority = %global.priority,
                "global service released"
            );
            drop(global.instance);
        }
    }
}

/// A started set of services.
///
/// The host is tied to the thread that started it: main-group services live
/// on that thread and only run while it calls [`pump`](Self::pump).
pub struct ServiceHost {
    provider: ServiceProvider,
    services: HostServices,
    groups: Vec<Arc<GroupShared>>,
    names: HashMap<String, ServiceGroupId>,
    stopped: bool,
}

impl ServiceHost {
    pub(crate) fn new(
        provider: ServiceProvider,
        services: HostServices,
        groups: Vec<Arc<GroupShared>>,
        names: HashMap<String, ServiceGroupId>,
    ) -> Self {
        info!(
            groups = groups.len(),
            globals = services.globals.len(),
            "service host started"
        );
        Self {
            provider,
            services,
            groups,
            names,
            stopped: false,
        }
    }

    /// Lookup handle for the registered capabilities. Clone it freely and
    /// hand it to other threads.
    #[must_use]
    pub fn provider(&self) -> &ServiceProvider {
        &self.provider
    }

    /// Executes queued main-group work on the calling thread.
    ///
    /// Dispatches the envelopes that were queued when the call started, up to
    /// `HostConfig::main_pump_budget`, and returns how many were dispatched.
    pub fn pump(&mut self) -> usize {
        self.services.main.pump()
    }

    #[must_use]
    pub fn group_id(&self, name: &str) -> Option<ServiceGroupId> {
        self.names.get(name).copied()
    }

    #[must_use]
    pub fn group_state(&self, group: ServiceGroupId) -> Option<GroupState> {
        self.group(group).map(|shared| shared.state())
    }

    /// Envelopes waiting in a group's queue.
    #[must_use]
    pub fn queue_len(&self, group: ServiceGroupId) -> Option<usize> {
        self.group(group).map(|shared| shared.queue_len())
    }

    #[must_use]
    pub fn pool_stats(&self, group: ServiceGroupId) -> Option<PoolStats> {
        self.group(group).map(|shared| shared.pool_stats())
    }

    /// Group ids in creation order, main first.
    #[must_use]
    pub fn groups(&self) -> Vec<ServiceGroupId> {
        self.groups.iter().map(|shared| shared.id).collect()
    }

    /// Drains every group and releases every service. Dropping the host does
    /// the same.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn group(&self, group: ServiceGroupId) -> Option<&Arc<GroupShared>> {
        self.groups.iter().find(|shared| shared.id == group)
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("service host shutting down");
        self.services.stop_groups();
        drop(self.provider.close());
        self.services.release_globals();
        info!("service host stopped");
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("groups", &self.groups())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}
