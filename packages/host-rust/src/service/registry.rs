//! Service registration: the single-threaded configuration phase.
//!
//! A [`ServiceRegistry`] collects groups and factories, then `start` turns
//! them into a running [`ServiceHost`](crate::ServiceHost).

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use svchost_core::{Priority, ProviderId, ServiceError, ServiceGroupId, ServiceId};
use tracing::{debug, error, info};

use super::async_service::{AsyncProxy, AsyncServiceImpl};
use super::config::HostConfig;
use super::factory::{CreateGlobalFn, ServiceFactory, ServiceStrategy, Strategy};
use super::launch::{LaunchKind, LocalAllocator, ServiceLaunchRecord};
use super::provider::{ProviderTable, ServiceProvider};
use crate::error::ConfigError;
use crate::group::dispatch::AsyncLaunch;
use crate::group::main_group::MainGroup;
use crate::group::worker::WorkerGroup;
use crate::group::GroupShared;
use crate::host::{HostServices, ServiceHost, StartedGlobal};

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

struct Registration {
    provider: ProviderId,
    service: ServiceId,
    priority: Priority,
    group: ServiceGroupId,
    multiple: bool,
    factory: ServiceFactory,
}

/// Provider-table entry produced while planning startup.
struct Planned {
    service: ServiceId,
    multiple: bool,
    record: ServiceLaunchRecord,
}

/// One main-thread construction step, in priority order.
enum MainStep {
    Global {
        slot: usize,
        service: ServiceId,
        priority: Priority,
        create: CreateGlobalFn,
    },
    Async(AsyncLaunch),
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Configuration phase of the host.
///
/// Collects service groups and registrations, validates them eagerly, and
/// turns them into a running [`ServiceHost`] with [`start`](Self::start).
///
/// Startup order is ascending priority; ties keep registration order. Main
/// group services (globals and main-group async implementations) start
/// first, then each worker group in creation order.
pub struct ServiceRegistry {
    config: HostConfig,
    /// Creation order; the main group is always first.
    groups: Vec<Arc<GroupShared>>,
    names: HashMap<String, ServiceGroupId>,
    registrations: Vec<Registration>,
    single: HashSet<ServiceId>,
    multiple: HashSet<ServiceId>,
    next_group: u32,
    next_provider: u32,
}

impl ServiceRegistry {
    /// Creates an empty registry with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::build(HostConfig::default())
    }

    /// # Errors
    ///
    /// Returns `ConfigError::InvalidConfig` if `config` fails validation.
    pub fn with_config(config: HostConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: HostConfig) -> Self {
        let main = Arc::new(GroupShared::new(ServiceGroupId::MAIN, None, &config));
        Self {
            config,
            groups: vec![main],
            names: HashMap::new(),
            registrations: Vec::new(),
            single: HashSet::new(),
            multiple: HashSet::new(),
            next_group: ServiceGroupId::MAIN.value() + 1,
            next_provider: 1,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Creates an anonymous service group backed by its own worker thread.
    pub fn create_service_group(&mut self) -> ServiceGroupId {
        self.add_group(None)
    }

    /// Creates a service group that can later be found by `name`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::GroupNameTaken` if `name` already names a group.
    pub fn create_named_service_group(
        &mut self,
        name: impl Into<String>,
    ) -> Result<ServiceGroupId, ConfigError> {
        let name = name.into();
        if let Some(&existing) = self.names.get(&name) {
            return Err(ConfigError::GroupNameTaken { name, existing });
        }
        let id = self.add_group(Some(name.clone()));
        self.names.insert(name, id);
        Ok(id)
    }

    #[must_use]
    pub fn group_id(&self, name: &str) -> Option<ServiceGroupId> {
        self.names.get(name).copied()
    }

    fn add_group(&mut self, name: Option<String>) -> ServiceGroupId {
        let id = ServiceGroupId::new(self.next_group);
        self.next_group += 1;
        debug!(group = %id, name = name.as_deref().unwrap_or(""), "service group created");
        self.groups
            .push(Arc::new(GroupShared::new(id, name, &self.config)));
        id
    }

    /// Registers the single provider of a capability.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownGroup` if `group` was not created here.
    /// - `ConfigError::StrategyNotAllowed` for a local or global service
    ///   outside the main group.
    /// - `ConfigError::DuplicateRegistration` if the capability already has a
    ///   provider.
    pub fn register(
        &mut self,
        factory: ServiceFactory,
        priority: Priority,
        group: ServiceGroupId,
    ) -> Result<ProviderId, ConfigError> {
        self.add_registration(factory, priority, group, false)
    }

    /// Registers one of several providers of a capability. Every provider is
    /// reachable through `ServiceProvider::get_all`, in priority order.
    ///
    /// # Errors
    ///
    /// As [`register`](Self::register), except that only an existing single
    /// registration of the capability counts as a duplicate.
    pub fn register_multiple(
        &mut self,
        factory: ServiceFactory,
        priority: Priority,
        group: ServiceGroupId,
    ) -> Result<ProviderId, ConfigError> {
        self.add_registration(factory, priority, group, true)
    }

    /// Shorthand for registering a [`ServiceFactory::local`] in the main group.
    ///
    /// # Errors
    ///
    /// As [`register`](Self::register).
    pub fn register_local<C, F>(
        &mut self,
        priority: Priority,
        allocate: F,
    ) -> Result<ProviderId, ConfigError>
    where
        C: ?Sized + 'static,
        F: Fn() -> Result<Arc<C>, ServiceError> + Send + Sync + 'static,
    {
        self.register(ServiceFactory::local::<C, F>(allocate), priority, ServiceGroupId::MAIN)
    }

    /// Shorthand for registering a [`ServiceFactory::global`] in the main group.
    ///
    /// # Errors
    ///
    /// As [`register`](Self::register).
    pub fn register_global<C, F>(
        &mut self,
        priority: Priority,
        create: F,
    ) -> Result<ProviderId, ConfigError>
    where
        C: ?Sized + Send + Sync + 'static,
        F: FnOnce() -> Result<Arc<C>, ServiceError> + Send + 'static,
    {
        self.register(ServiceFactory::global::<C, F>(create), priority, ServiceGroupId::MAIN)
    }

    /// Shorthand for registering a [`ServiceFactory::asynchronous`].
    ///
    /// # Errors
    ///
    /// As [`register`](Self::register).
    pub fn register_async<C, I, F, P>(
        &mut self,
        priority: Priority,
        group: ServiceGroupId,
        create_impl: F,
        create_proxy: P,
    ) -> Result<ProviderId, ConfigError>
    where
        C: ?Sized + Send + Sync + 'static,
        I: AsyncServiceImpl,
        F: FnOnce() -> Result<I, ServiceError> + Send + 'static,
        P: FnOnce(AsyncProxy) -> Arc<C> + Send + 'static,
    {
        self.register(
            ServiceFactory::asynchronous::<C, I, F, P>(create_impl, create_proxy),
            priority,
            group,
        )
    }

    /// Number of registrations so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn add_registration(
        &mut self,
        factory: ServiceFactory,
        priority: Priority,
        group: ServiceGroupId,
        multiple: bool,
    ) -> Result<ProviderId, ConfigError> {
        let service = factory.service_id();
        let strategy = factory.strategy();

        if !self.groups.iter().any(|shared| shared.id == group) {
            return Err(ConfigError::UnknownGroup { group });
        }
        if strategy != ServiceStrategy::Async && !group.is_main() {
            return Err(ConfigError::StrategyNotAllowed {
                service,
                strategy: strategy.as_str(),
                group,
            });
        }
        let duplicate = if multiple {
            self.single.contains(&service)
        } else {
            self.single.contains(&service) || self.multiple.contains(&service)
        };
        if duplicate {
            return Err(ConfigError::DuplicateRegistration { service });
        }

        if multiple {
            self.multiple.insert(service);
        } else {
            self.single.insert(service);
        }
        let provider = ProviderId::new(self.next_provider);
        self.next_provider += 1;
        debug!(%service, %strategy, %priority, %group, %provider, "service registered");

        self.registrations.push(Registration {
            provider,
            service,
            priority,
            group,
            multiple,
            factory,
        });
        Ok(provider)
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Instantiates every registered service and returns the running host.
    ///
    /// Must be called on the thread that will pump the main group. If any
    /// service fails to start, everything started so far is stopped in reverse
    /// order before the error is returned.
    ///
    /// # Errors
    ///
    /// - `ConfigError::StartFailed` if a factory returns an error or panics.
    /// - `ConfigError::ThreadSpawn` / `ConfigError::WorkerLost` if a worker
    ///   thread cannot be brought up.
    pub fn start(self) -> Result<ServiceHost, ConfigError> {
        let ServiceRegistry {
            config,
            groups,
            names,
            mut registrations,
            ..
        } = self;
        info!(
            services = registrations.len(),
            groups = groups.len(),
            "starting service host"
        );

        registrations.sort_by_key(|registration| (registration.priority, registration.provider));

        let mut planned = Vec::with_capacity(registrations.len());
        let mut main_steps = Vec::new();
        let mut worker_launches: HashMap<ServiceGroupId, Vec<AsyncLaunch>> = HashMap::new();

        for registration in registrations {
            let Registration {
                provider,
                service,
                priority,
                group,
                multiple,
                factory,
            } = registration;

            let record = match factory.into_strategy() {
                Strategy::Local { allocate } => ServiceLaunchRecord::from_parts(
                    LaunchKind::InstanceAllocator,
                    None,
                    Some(LocalAllocator::new(provider, allocate)),
                ),
                Strategy::Global { create } => {
                    main_steps.push(MainStep::Global {
                        slot: planned.len(),
                        service,
                        priority,
                        create,
                    });
                    // Filled in once the instance exists.
                    ServiceLaunchRecord::Invalid
                }
                Strategy::Async {
                    create_impl,
                    create_proxy,
                } => {
                    let shared = groups
                        .iter()
                        .find(|shared| shared.id == group)
                        .ok_or(ConfigError::UnknownGroup { group })?;
                    let instance = create_proxy(AsyncProxy::new(Arc::clone(shared), provider));
                    let launch = AsyncLaunch {
                        provider,
                        service,
                        priority,
                        create: create_impl,
                    };
                    if group.is_main() {
                        main_steps.push(MainStep::Async(launch));
                    } else {
                        worker_launches.entry(group).or_default().push(launch);
                    }
                    ServiceLaunchRecord::from_parts(LaunchKind::Instance, Some(instance), None)
                }
            };
            planned.push(Planned {
                service,
                multiple,
                record,
            });
        }

        let main = MainGroup::new(Arc::clone(&groups[0]), config.main_pump_budget);
        let mut services = HostServices::new(main);

        let launched = launch_services(
            &mut services,
            &mut planned,
            main_steps,
            worker_launches,
            &groups,
            &config,
        )
        .and_then(|()| build_table(planned));

        match launched {
            Ok(table) => Ok(ServiceHost::new(
                ServiceProvider::new(table),
                services,
                groups,
                names,
            )),
            Err(err) => {
                error!(error = %err, "service host failed to start, rolling back");
                services.stop();
                Err(err)
            }
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("groups", &self.groups.len())
            .field("registrations", &self.registrations.len())
            .finish_non_exhaustive()
    }
}

fn launch_services(
    services: &mut HostServices,
    planned: &mut [Planned],
    main_steps: Vec<MainStep>,
    mut worker_launches: HashMap<ServiceGroupId, Vec<AsyncLaunch>>,
    groups: &[Arc<GroupShared>],
    config: &HostConfig,
) -> Result<(), ConfigError> {
    for step in main_steps {
        match step {
            MainStep::Global {
                slot,
                service,
                priority,
                create,
            } => {
                let instance = catch_unwind(AssertUnwindSafe(create))
                    .map_err(|panic| ServiceError::from_panic(panic.as_ref()))
                    .and_then(|result| result)
                    .map_err(|source| {
                        error!(%service, %priority, error = %source, "global service failed to start");
                        ConfigError::StartFailed { service, source }
                    })?;
                debug!(%service, %priority, "global service started");
                planned[slot].record = ServiceLaunchRecord::from_parts(
                    LaunchKind::Instance,
                    Some(Arc::clone(&instance)),
                    None,
                );
                services.globals.push(StartedGlobal {
                    service,
                    priority,
                    instance,
                });
            }
            MainStep::Async(launch) => services.main.launch(launch)?,
        }
    }
    services.main.set_running();

    for shared in groups.iter().filter(|shared| !shared.id.is_main()) {
        let launches = worker_launches.remove(&shared.id).unwrap_or_default();
        let worker = WorkerGroup::start(Arc::clone(shared), launches, config)?;
        services.workers.push(worker);
    }
    Ok(())
}

fn build_table(planned: Vec<Planned>) -> Result<ProviderTable, ConfigError> {
    let mut table = ProviderTable::default();
    for Planned {
        service,
        multiple,
        record,
    } in planned
    {
        if !record.is_valid() {
            return Err(ConfigError::InvalidLaunchRecord {
                service,
                reason: "service produced no instance or allocator",
            });
        }
        if multiple {
            table.push_multiple(service, record);
        } else {
            table.insert_single(service, record);
        }
    }
    Ok(table)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
