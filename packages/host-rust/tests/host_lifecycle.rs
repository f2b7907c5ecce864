//! End-to-end host behavior: ordering, delivery, errors, and shutdown.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use svchost::{
    AsyncProxy, AsyncServiceImpl, CallArgs, CallError, ConfigError, Envelope, ErrorKind,
    GroupState, HostConfig, LookupError, Priority, ResultState, ServiceError, ServiceFactory,
    ServiceGroupId, ServiceHost, ServiceRegistry,
};

type Journal = Arc<Mutex<Vec<String>>>;

const ECHO: u32 = 1;
const RECORD: u32 = 2;
const FAIL: u32 = 3;
const PANIC: u32 = 4;
const SLEEP: u32 = 5;
const ADD: u32 = 6;

/// Global service that records its release.
struct Tracked {
    name: &'static str,
    journal: Journal,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.journal.lock().push(format!("drop {}", self.name));
    }
}

struct Worker {
    name: &'static str,
    journal: Journal,
}

impl AsyncServiceImpl for Worker {
    fn process(&mut self, envelope: &mut Envelope) -> Result<(), ServiceError> {
        match envelope.method() {
            ECHO => envelope.set_scalar_result(envelope.param1()),
            RECORD => {
                self.journal
                    .lock()
                    .push(format!("{} {}", self.name, envelope.param1()));
                envelope.set_unit_result();
            }
            FAIL => {
                return Err(ServiceError::custom_with_detail(
                    "asset",
                    "texture missing",
                    "atlas/grass.png",
                ))
            }
            PANIC => panic!("worker {} panicked", self.name),
            SLEEP => {
                thread::sleep(Duration::from_millis(envelope.param1().unsigned_abs()));
                envelope.set_unit_result();
            }
            ADD => envelope.set_scalar_result(envelope.param1() + envelope.param2()),
            method => return Err(ServiceError::UnknownMethod { method }),
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.journal.lock().push(format!("stop {}", self.name));
    }
}

fn worker(name: &'static str, journal: &Journal) -> ServiceFactory {
    let journal = Arc::clone(journal);
    ServiceFactory::asynchronous::<AsyncProxy, _, _, _>(
        move || {
            journal.lock().push(format!("start {name}"));
            Ok(Worker { name, journal })
        },
        Arc::new,
    )
}

fn tracked(name: &'static str, journal: &Journal) -> ServiceFactory {
    let journal = Arc::clone(journal);
    ServiceFactory::global::<Tracked, _>(move || {
        journal.lock().push(format!("start {name}"));
        Ok(Arc::new(Tracked { name, journal }))
    })
}

/// One worker group running a single `Worker`, returned with its proxy.
fn single_worker_host(config: HostConfig) -> (ServiceHost, AsyncProxy, ServiceGroupId) {
    let journal = Journal::default();
    let mut registry = ServiceRegistry::with_config(config).unwrap();
    let group = registry.create_named_service_group("jobs").unwrap();
    registry
        .register(worker("jobs", &journal), Priority::NORMAL, group)
        .unwrap();
    let host = registry.start().unwrap();
    let proxy = AsyncProxy::clone(&host.provider().get::<AsyncProxy>().unwrap());
    (host, proxy, group)
}

#[test]
fn add_completes_within_deadline_on_worker_group() {
    let (host, proxy, _) = single_worker_host(HostConfig::default());

    let pending = proxy
        .call(ADD, CallArgs::scalars(42, 2), Envelope::read_scalar)
        .unwrap();
    assert_eq!(pending.wait_for(Duration::from_secs(5)), ResultState::Ready);
    assert_eq!(pending.take(), Ok(44));

    host.shutdown();
}

#[test]
fn add_on_main_group_is_pending_until_pumped_then_observed_once() {
    let journal = Journal::default();
    let mut registry = ServiceRegistry::new();
    registry
        .register(worker("main", &journal), Priority::NORMAL, ServiceGroupId::MAIN)
        .unwrap();
    let mut host = registry.start().unwrap();
    let proxy = host.provider().get::<AsyncProxy>().unwrap();

    let pending = proxy
        .call(ADD, CallArgs::scalars(42, 2), Envelope::read_scalar)
        .unwrap();
    assert_eq!(pending.wait_for(Duration::ZERO), ResultState::Pending);
    assert_eq!(pending.try_take(), None);

    let mut observed = Vec::new();
    for _ in 0..10 {
        host.pump();
        if let Some(Ok(sum)) = pending.try_take() {
            observed.push(sum);
        }
    }
    assert_eq!(observed, vec![44]);
    assert_eq!(pending.state(), ResultState::Consumed);
    assert_eq!(pending.try_take(), Some(Err(CallError::AlreadyConsumed)));
}

#[test]
fn startup_and_shutdown_follow_group_and_priority_order() {
    let journal = Journal::default();
    let mut registry = ServiceRegistry::new();
    let first = registry.create_named_service_group("first").unwrap();
    let second = registry.create_named_service_group("second").unwrap();

    registry
        .register_multiple(tracked("g-late", &journal), Priority::new(10), ServiceGroupId::MAIN)
        .unwrap();
    registry
        .register_multiple(worker("b", &journal), Priority::new(-20), second)
        .unwrap();
    registry
        .register_multiple(worker("m", &journal), Priority::NORMAL, ServiceGroupId::MAIN)
        .unwrap();
    registry
        .register_multiple(worker("a2", &journal), Priority::new(5), first)
        .unwrap();
    registry
        .register_multiple(worker("a1", &journal), Priority::new(5), first)
        .unwrap();
    registry
        .register_multiple(tracked("g-early", &journal), Priority::new(-10), ServiceGroupId::MAIN)
        .unwrap();

    let host = registry.start().unwrap();
    assert_eq!(
        *journal.lock(),
        vec!["start g-early", "start m", "start g-late", "start a2", "start a1", "start b"]
    );
    journal.lock().clear();

    host.shutdown();
    assert_eq!(
        *journal.lock(),
        vec!["stop b", "stop a1", "stop a2", "stop m", "drop g-late", "drop g-early"]
    );
}

#[test]
fn calls_through_one_proxy_execute_in_order() {
    let journal = Journal::default();
    let mut registry = ServiceRegistry::new();
    let group = registry.create_service_group();
    registry
        .register(worker("w", &journal), Priority::NORMAL, group)
        .unwrap();
    let host = registry.start().unwrap();
    let proxy = host.provider().get::<AsyncProxy>().unwrap();

    for n in 0..50 {
        proxy.post(RECORD, CallArgs::scalars(n, 0)).unwrap();
    }
    let last = proxy
        .call(ECHO, CallArgs::scalars(-1, 0), Envelope::read_scalar)
        .unwrap();
    assert_eq!(last.take(), Ok(-1));

    let expected: Vec<String> = (0..50).map(|n| format!("w {n}")).collect();
    let recorded: Vec<String> = journal
        .lock()
        .iter()
        .filter(|line| line.starts_with("w "))
        .cloned()
        .collect();
    assert_eq!(recorded, expected);
    host.shutdown();
}

#[test]
fn concurrent_callers_each_get_their_own_result() {
    let (host, proxy, _) = single_worker_host(HostConfig {
        queue_capacity: Some(4),
        ..HostConfig::default()
    });

    let handles: Vec<_> = (0..4)
        .map(|caller| {
            let proxy = proxy.clone();
            thread::spawn(move || {
                (0..25)
                    .map(|n| {
                        let value = caller * 1000 + n;
                        proxy
                            .call(ECHO, CallArgs::scalars(value, 0), Envelope::read_scalar)
                            .unwrap()
                            .take()
                            .unwrap()
                            == value
                    })
                    .all(|matched| matched)
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
    host.shutdown();
}

#[test]
fn remote_errors_arrive_unchanged() {
    let (host, proxy, _) = single_worker_host(HostConfig::default());

    let err = proxy
        .call(FAIL, CallArgs::none(), Envelope::read_unit)
        .unwrap()
        .take()
        .unwrap_err();
    let remote = err.as_remote().unwrap();
    assert_eq!(remote.kind(), ErrorKind::Custom);
    assert_eq!(remote.message(), "texture missing");
    assert_eq!(remote.detail(), Some("atlas/grass.png"));
    assert!(matches!(remote, ServiceError::Custom { kind, .. } if kind == "asset"));

    let err = proxy
        .call(99, CallArgs::none(), Envelope::read_unit)
        .unwrap()
        .take()
        .unwrap_err();
    assert_eq!(
        err,
        CallError::Remote(ServiceError::UnknownMethod { method: 99 })
    );
    host.shutdown();
}

#[test]
fn panicking_call_fails_alone_and_group_keeps_running() {
    let (host, proxy, group) = single_worker_host(HostConfig::default());

    let err = proxy
        .call(PANIC, CallArgs::none(), Envelope::read_unit)
        .unwrap()
        .take()
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::Remote(ServiceError::Panicked(ref msg)) if msg == "worker jobs panicked"
    ));

    assert_eq!(host.group_state(group), Some(GroupState::Running));
    let pending = proxy
        .call(ECHO, CallArgs::scalars(7, 0), Envelope::read_scalar)
        .unwrap();
    assert_eq!(pending.take(), Ok(7));
    host.shutdown();
}

#[test]
fn shutdown_drains_queued_work_then_rejects_calls() {
    let (host, proxy, group) = single_worker_host(HostConfig::default());

    proxy.post(SLEEP, CallArgs::scalars(20, 0)).unwrap();
    let pending: Vec<_> = (0..10)
        .map(|n| {
            proxy
                .call(ECHO, CallArgs::scalars(n, 0), Envelope::read_scalar)
                .unwrap()
        })
        .collect();
    assert_eq!(host.group_state(group), Some(GroupState::Running));

    host.shutdown();

    for (n, result) in (0..10).zip(pending) {
        assert_eq!(result.try_take(), Some(Ok(n)));
    }
    assert_eq!(
        proxy
            .call(ECHO, CallArgs::none(), Envelope::read_scalar)
            .unwrap_err(),
        CallError::GroupShutDown { group }
    );
    assert!(matches!(
        proxy.post(RECORD, CallArgs::none()),
        Err(CallError::GroupShutDown { .. })
    ));
}

#[test]
fn bounded_main_queue_reports_full_to_the_host_thread() {
    let journal = Journal::default();
    let config = HostConfig {
        queue_capacity: Some(1),
        ..HostConfig::default()
    };
    let mut registry = ServiceRegistry::with_config(config).unwrap();
    registry
        .register(worker("main", &journal), Priority::NORMAL, ServiceGroupId::MAIN)
        .unwrap();
    let mut host = registry.start().unwrap();
    let proxy = host.provider().get::<AsyncProxy>().unwrap();

    proxy.post(RECORD, CallArgs::scalars(1, 0)).unwrap();
    assert_eq!(
        proxy.post(RECORD, CallArgs::scalars(2, 0)),
        Err(CallError::QueueFull {
            group: ServiceGroupId::MAIN
        })
    );

    assert_eq!(host.pump(), 1);
    proxy.post(RECORD, CallArgs::scalars(3, 0)).unwrap();
    assert_eq!(host.pump(), 1);
    host.shutdown();

    assert_eq!(
        *journal.lock(),
        vec!["start main", "main 1", "main 3", "stop main"]
    );
}

#[test]
fn lookups_fail_after_shutdown() {
    let (host, _proxy, _) = single_worker_host(HostConfig::default());
    let provider = host.provider().clone();
    assert!(provider.get::<AsyncProxy>().is_ok());

    drop(host);

    assert_eq!(
        provider.get::<AsyncProxy>().unwrap_err(),
        LookupError::ProviderClosed
    );
    assert!(provider.try_get::<AsyncProxy>().is_none());
    assert!(provider.is_closed());
}

#[test]
fn local_services_are_created_once_per_thread() {
    struct Scratch {
        owner: thread::ThreadId,
    }

    let mut registry = ServiceRegistry::new();
    registry
        .register_local::<Scratch, _>(Priority::NORMAL, || {
            Ok(Arc::new(Scratch {
                owner: thread::current().id(),
            }))
        })
        .unwrap();
    let host = registry.start().unwrap();
    let provider = host.provider().clone();

    let here = provider.get::<Scratch>().unwrap();
    assert!(Arc::ptr_eq(&here, &provider.get::<Scratch>().unwrap()));
    assert_eq!(here.owner, thread::current().id());

    let remote_provider = provider.clone();
    let remote_matches = thread::spawn(move || {
        let scratch = remote_provider.get::<Scratch>().unwrap();
        scratch.owner == thread::current().id()
    })
    .join()
    .unwrap();
    assert!(remote_matches);
}

#[test]
fn failed_worker_startup_rolls_back_started_services() {
    let journal = Journal::default();
    let mut registry = ServiceRegistry::new();
    let healthy = registry.create_service_group();
    let broken = registry.create_service_group();

    registry
        .register_multiple(tracked("g", &journal), Priority::NORMAL, ServiceGroupId::MAIN)
        .unwrap();
    registry
        .register_multiple(worker("ok", &journal), Priority::NORMAL, healthy)
        .unwrap();
    registry
        .register_multiple(
            ServiceFactory::asynchronous::<AsyncProxy, Worker, _, _>(
                || Err(ServiceError::InvalidState("no device".to_string())),
                Arc::new,
            ),
            Priority::NORMAL,
            broken,
        )
        .unwrap();

    let err = registry.start().unwrap_err();
    assert!(matches!(err, ConfigError::StartFailed { .. }));
    assert_eq!(*journal.lock(), vec!["start g", "start ok", "stop ok", "drop g"]);
}

#[test]
fn host_reports_group_state_and_queue_length() {
    let journal = Journal::default();
    let mut registry = ServiceRegistry::new();
    registry
        .register(worker("main", &journal), Priority::NORMAL, ServiceGroupId::MAIN)
        .unwrap();
    let named = registry.create_named_service_group("idle").unwrap();
    let mut host = registry.start().unwrap();

    assert_eq!(host.group_id("idle"), Some(named));
    assert_eq!(host.groups(), vec![ServiceGroupId::MAIN, named]);
    assert_eq!(host.group_state(named), Some(GroupState::Running));
    assert_eq!(host.group_state(ServiceGroupId::new(9)), None);

    let proxy = host.provider().get::<AsyncProxy>().unwrap();
    for _ in 0..3 {
        proxy.post(RECORD, CallArgs::none()).unwrap();
    }
    assert_eq!(host.queue_len(ServiceGroupId::MAIN), Some(3));
    assert_eq!(host.pump(), 3);
    assert_eq!(host.queue_len(ServiceGroupId::MAIN), Some(0));

    let stats = host.pool_stats(ServiceGroupId::MAIN).unwrap();
    assert_eq!(stats.checked_out, 0);
    assert!(stats.high_water >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_result_can_be_awaited() {
    let (host, proxy, _) = single_worker_host(HostConfig::default());

    let pending = proxy
        .call(ADD, CallArgs::scalars(40, 2), Envelope::read_scalar)
        .unwrap();
    let sum = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("call timed out")
        .unwrap();
    assert_eq!(sum, 42);

    host.shutdown();
}
