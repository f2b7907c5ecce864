//! Service groups: one ordered queue, one envelope pool, one executing thread.
//!
//! - `queue` -- the group's FIFO plus its lifecycle state
//! - `dispatch` -- routes envelopes to the group's async implementations
//! - `worker` -- the dedicated thread behind every non-main group
//! - `main_group` -- the main group, pumped by the host thread

pub(crate) mod dispatch;
pub(crate) mod main_group;
pub(crate) mod queue;
pub(crate) mod worker;

use svchost_core::{GroupState, MessagePool, PoolStats, ServiceGroupId};
use tracing::warn;

use crate::service::HostConfig;
use queue::MessageQueue;

/// State shared between a group's executor and every proxy targeting it.
pub(crate) struct GroupShared {
    pub(crate) id: ServiceGroupId,
    pub(crate) name: Option<String>,
    pub(crate) queue: MessageQueue,
    pub(crate) pool: MessagePool,
}

impl GroupShared {
    pub(crate) fn new(id: ServiceGroupId, name: Option<String>, config: &HostConfig) -> Self {
        Self {
            id,
            name,
            queue: MessageQueue::new(config.queue_capacity),
            pool: MessagePool::with_prewarmed(config.pool_prewarm),
        }
    }

    /// Name used in logs, metrics labels, and thread names.
    pub(crate) fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }

    pub(crate) fn state(&self) -> GroupState {
        self.queue.state()
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Moves the group to `Draining` behind a shutdown sentinel.
    ///
    /// Returns the number of envelopes still queued ahead of the sentinel, or
    /// `None` if the group was already draining or stopped.
    pub(crate) fn begin_drain(&self) -> Option<usize> {
        match self.queue.begin_drain(self.pool.acquire()) {
            Ok(pending) => Some(pending),
            Err(sentinel) => {
                if let Err(err) = sentinel.release() {
                    warn!(group = %self.id, error = %err, "failed to recycle shutdown sentinel");
                }
                None
            }
        }
    }
}
