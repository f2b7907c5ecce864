//! Dedicated worker thread behind a non-main service group.
//!
//! The thread:
//! 1. Constructs the group's async implementations (ascending priority)
//! 2. Reports startup success or failure back to the host
//! 3. Pops and dispatches envelopes until it reaches the shutdown sentinel
//! 4. Stops the implementations (descending priority) and marks the group
//!    `Stopped`

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, info_span};

use super::dispatch::{AsyncLaunch, Dispatcher, Step};
use super::GroupShared;
use crate::error::ConfigError;
use crate::service::HostConfig;

pub(crate) struct WorkerGroup {
    shared: Arc<GroupShared>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawns the worker and blocks until its implementations are running.
    ///
    /// # Errors
    ///
    /// - `ConfigError::ThreadSpawn` if the OS refuses the thread.
    /// - `ConfigError::StartFailed` if an implementation fails to construct.
    /// - `ConfigError::WorkerLost` if the thread dies before reporting.
    pub(crate) fn start(
        shared: Arc<GroupShared>,
        launches: Vec<AsyncLaunch>,
        config: &HostConfig,
    ) -> Result<Self, ConfigError> {
        let group = shared.id;
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), ConfigError>>(1);

        let mut builder =
            thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, shared.label()));
        if let Some(stack_size) = config.worker_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let thread_shared = Arc::clone(&shared);
        let handle = builder
            .spawn(move || run(&thread_shared, launches, &ready_tx))
            .map_err(|source| ConfigError::ThreadSpawn { group, source })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                handle: Some(handle),
            }),
            Ok(Err(err)) => {
                join(handle, &shared);
                Err(err)
            }
            Err(_) => {
                join(handle, &shared);
                Err(ConfigError::WorkerLost { group })
            }
        }
    }

    /// Drains the queue, stops the implementations, and joins the thread.
    /// Idempotent.
    pub(crate) fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Some(pending) = self.shared.begin_drain() {
                info!(group = %self.shared.id, pending, "draining service group");
            }
            join(handle, &self.shared);
        }
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join(handle: JoinHandle<()>, shared: &GroupShared) {
    if handle.join().is_err() {
        error!(group = %shared.id, "service group worker panicked");
        shared.queue.mark_stopped();
    }
}

fn run(
    shared: &GroupShared,
    launches: Vec<AsyncLaunch>,
    ready: &mpsc::SyncSender<Result<(), ConfigError>>,
) {
    let span = info_span!("service_group", group = %shared.id, name = %shared.label());
    let _entered = span.enter();

    let mut dispatcher = match Dispatcher::start(shared.id, &shared.label(), launches) {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            shared.queue.mark_stopped();
            // The host is blocked on this channel; a send failure means it is gone.
            let _ = ready.send(Err(err));
            return;
        }
    };

    shared.queue.set_running();
    info!(services = dispatcher.len(), "service group running");
    let _ = ready.send(Ok(()));

    let mut dispatched: u64 = 0;
    loop {
        let envelope = shared.queue.pop_blocking();
        match dispatcher.dispatch(envelope) {
            Step::Continue => dispatched += 1,
            Step::Shutdown => break,
        }
    }

    dispatcher.stop_services();
    shared.queue.mark_stopped();
    info!(dispatched, "service group stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread::ThreadId;
    use std::time::Duration;

    use parking_lot::Mutex;
    use svchost_core::{
        Envelope, GroupState, Priority, ProviderId, ServiceError, ServiceGroupId, ServiceId,
    };

    use super::*;
    use crate::service::{AsyncProxy, AsyncServiceImpl, CallArgs};

    struct ThreadRecorder {
        seen: Arc<Mutex<Vec<ThreadId>>>,
    }

    impl AsyncServiceImpl for ThreadRecorder {
        fn process(&mut self, envelope: &mut Envelope) -> Result<(), ServiceError> {
            self.seen.lock().push(thread::current().id());
            envelope.set_scalar_result(envelope.param1());
            Ok(())
        }
    }

    fn group(id: u32) -> Arc<GroupShared> {
        Arc::new(GroupShared::new(
            ServiceGroupId::new(id),
            Some(format!("worker-{id}")),
            &HostConfig::default(),
        ))
    }

    fn recording_launch(seen: &Arc<Mutex<Vec<ThreadId>>>) -> AsyncLaunch {
        let seen = Arc::clone(seen);
        AsyncLaunch {
            provider: ProviderId::new(1),
            service: ServiceId::of::<ThreadRecorder>(),
            priority: Priority::NORMAL,
            create: Box::new(move || {
                seen.lock().push(thread::current().id());
                Ok(Box::new(ThreadRecorder { seen }) as Box<dyn AsyncServiceImpl>)
            }),
        }
    }

    #[test]
    fn worker_runs_everything_on_one_thread() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let shared = group(1);
        let mut worker =
            WorkerGroup::start(Arc::clone(&shared), vec![recording_launch(&seen)], &HostConfig::default())
                .unwrap();
        assert_eq!(shared.state(), GroupState::Running);

        let proxy = AsyncProxy::new(Arc::clone(&shared), ProviderId::new(1));
        let results: Vec<i64> = (0..4)
            .map(|n| proxy.call(0, CallArgs::scalars(n, 0), Envelope::read_scalar).unwrap())
            .map(|pending| pending.take().unwrap())
            .collect();
        assert_eq!(results, vec![0, 1, 2, 3]);

        worker.stop();
        assert_eq!(shared.state(), GroupState::Stopped);

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|id| *id == seen[0]));
        assert_ne!(seen[0], thread::current().id());
    }

    #[test]
    fn queued_work_drains_before_stop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let shared = group(2);
        let mut worker =
            WorkerGroup::start(Arc::clone(&shared), vec![recording_launch(&seen)], &HostConfig::default())
                .unwrap();

        let proxy = AsyncProxy::new(Arc::clone(&shared), ProviderId::new(1));
        let pending: Vec<_> = (0..16)
            .map(|n| proxy.call(0, CallArgs::scalars(n, 0), Envelope::read_scalar).unwrap())
            .collect();
        worker.stop();

        for (n, result) in pending.into_iter().enumerate() {
            assert_eq!(result.wait_for(Duration::ZERO), svchost_core::ResultState::Ready);
            assert_eq!(result.take().unwrap(), i64::try_from(n).unwrap());
        }
        assert!(proxy.post(0, CallArgs::none()).is_err());
    }

    #[test]
    fn startup_failure_is_reported() {
        let shared = group(3);
        let failing = AsyncLaunch {
            provider: ProviderId::new(1),
            service: ServiceId::of::<ThreadRecorder>(),
            priority: Priority::NORMAL,
            create: Box::new(|| Err(ServiceError::InvalidState("no gpu".to_string()))),
        };
        let err = WorkerGroup::start(Arc::clone(&shared), vec![failing], &HostConfig::default())
            .err()
            .unwrap();

        assert!(matches!(err, ConfigError::StartFailed { .. }));
        assert_eq!(shared.state(), GroupState::Stopped);
    }

    #[test]
    fn stop_is_idempotent() {
        let shared = group(4);
        let mut worker =
            WorkerGroup::start(Arc::clone(&shared), Vec::new(), &HostConfig::default()).unwrap();
        worker.stop();
        worker.stop();
        assert_eq!(shared.state(), GroupState::Stopped);
    }
}
