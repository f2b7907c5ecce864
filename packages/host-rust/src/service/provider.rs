//! Capability lookup.
//!
//! The provider table is built once by `ServiceRegistry::start` and is
//! read-only afterwards, except that host shutdown swaps it out so later
//! lookups fail with `LookupError::ProviderClosed`.
//!
//! Local service instances are cached per thread. Closing a provider releases
//! the closing thread's instances at once. Every other thread releases its
//! instances of a closed provider on its next lookup through any provider, or
//! at thread exit.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use svchost_core::{ProviderId, ServiceId};
use tracing::debug;

use super::factory::LocalInstance;
use super::launch::{LocalAllocator, ServiceLaunchRecord};
use crate::error::LookupError;

static NEXT_PROVIDER: AtomicU64 = AtomicU64::new(1);

/// Bumped by every `close`. A thread sweeps its locals when it sees a new value.
static CLOSE_EPOCH: AtomicU64 = AtomicU64::new(0);

struct LocalEntry {
    owner: Weak<ProviderShared>,
    owner_closed: Arc<AtomicBool>,
    instance: LocalInstance,
}

impl LocalEntry {
    /// Never upgrades `owner`, so the sweep cannot end up dropping a provider
    /// while the thread-local map is borrowed.
    fn is_live(&self) -> bool {
        self.owner.strong_count() > 0 && !self.owner_closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct LocalInstances {
    seen_epoch: u64,
    /// Keyed by (provider instance, registration).
    entries: HashMap<(u64, ProviderId), LocalEntry>,
}

thread_local! {
    /// Local service instances owned by this thread.
    static LOCAL_INSTANCES: RefCell<LocalInstances> = RefCell::new(LocalInstances::default());
}

/// Releases this thread's local instances whose provider is closed or gone.
fn evict_closed_locals() {
    let epoch = CLOSE_EPOCH.load(Ordering::SeqCst);
    let released: Vec<LocalEntry> = LOCAL_INSTANCES.with(|locals| {
        let mut locals = locals.borrow_mut();
        if locals.seen_epoch == epoch {
            return Vec::new();
        }
        locals.seen_epoch = epoch;
        let stale: Vec<_> = locals
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live())
            .map(|(key, _)| *key)
            .collect();
        stale
            .iter()
            .filter_map(|key| locals.entries.remove(key))
            .collect()
    });
    if !released.is_empty() {
        debug!(released = released.len(), "released local services of closed providers");
    }
    // Dropped outside the borrow: a local service may do lookups while being
    // torn down.
    drop(released);
}

/// Resolved capabilities, keyed by service id.
#[derive(Default)]
pub(crate) struct ProviderTable {
    single: HashMap<ServiceId, ServiceLaunchRecord>,
    /// Providers of multi-provider capabilities, in priority order.
    multiple: HashMap<ServiceId, Vec<ServiceLaunchRecord>>,
}

impl ProviderTable {
    pub(crate) fn insert_single(&mut self, service: ServiceId, record: ServiceLaunchRecord) {
        self.single.insert(service, record);
    }

    /// Appends one provider of a multi-provider capability. Call in priority
    /// order.
    pub(crate) fn push_multiple(&mut self, service: ServiceId, record: ServiceLaunchRecord) {
        self.single
            .entry(service)
            .or_insert(ServiceLaunchRecord::MultipleProviderTag);
        self.multiple.entry(service).or_default().push(record);
    }

    pub(crate) fn len(&self) -> usize {
        self.single.len()
    }
}

struct ProviderShared {
    instance: u64,
    closed: Arc<AtomicBool>,
    table: ArcSwapOption<ProviderTable>,
}

/// Read-only view of the registered capabilities.
///
/// Cheap to clone and usable from any thread. Global services and async
/// proxies resolve to the same shared handle everywhere. Local services
/// resolve to one instance per consuming thread.
#[derive(Clone)]
pub struct ServiceProvider {
    shared: Arc<ProviderShared>,
}

impl ServiceProvider {
    pub(crate) fn new(table: ProviderTable) -> Self {
        Self {
            shared: Arc::new(ProviderShared {
                instance: NEXT_PROVIDER.fetch_add(1, Ordering::Relaxed),
                closed: Arc::new(AtomicBool::new(false)),
                table: ArcSwapOption::from_pointee(table),
            }),
        }
    }

    /// Resolves capability `C`.
    ///
    /// For a capability with several providers this is the first one in
    /// priority order.
    ///
    /// # Errors
    ///
    /// - `LookupError::NotFound` if nothing provides `C`.
    /// - `LookupError::ProviderClosed` after host shutdown.
    /// - `LookupError::AllocationFailed` if a local service could not be
    ///   created for this thread.
    pub fn get<C: ?Sized + 'static>(&self) -> Result<Arc<C>, LookupError> {
        evict_closed_locals();
        let service = ServiceId::of::<C>();
        let guard = self.shared.table.load();
        let table = guard.as_deref().ok_or(LookupError::ProviderClosed)?;

        match table.single.get(&service) {
            Some(ServiceLaunchRecord::MultipleProviderTag) => table
                .multiple
                .get(&service)
                .and_then(|providers| providers.first())
                .ok_or(LookupError::NotFound { service })
                .and_then(|record| self.resolve::<C>(service, record)),
            Some(record) => self.resolve::<C>(service, record),
            None => Err(LookupError::NotFound { service }),
        }
    }

    /// Like [`get`](Self::get), but any failure yields `None`.
    #[must_use]
    pub fn try_get<C: ?Sized + 'static>(&self) -> Option<Arc<C>> {
        self.get::<C>().ok()
    }

    /// Resolves every provider of `C` in priority order. A capability with a
    /// single provider yields one handle; an unknown capability yields none.
    ///
    /// # Errors
    ///
    /// `LookupError::ProviderClosed` after host shutdown, or
    /// `LookupError::AllocationFailed` for a failing local provider.
    pub fn get_all<C: ?Sized + 'static>(&self) -> Result<Vec<Arc<C>>, LookupError> {
        evict_closed_locals();
        let service = ServiceId::of::<C>();
        let guard = self.shared.table.load();
        let table = guard.as_deref().ok_or(LookupError::ProviderClosed)?;

        match table.single.get(&service) {
            Some(ServiceLaunchRecord::MultipleProviderTag) => table
                .multiple
                .get(&service)
                .map_or(&[][..], Vec::as_slice)
                .iter()
                .map(|record| self.resolve::<C>(service, record))
                .collect(),
            Some(record) => Ok(vec![self.resolve::<C>(service, record)?]),
            None => Ok(Vec::new()),
        }
    }

    /// Whether `C` has at least one provider.
    #[must_use]
    pub fn contains<C: ?Sized + 'static>(&self) -> bool {
        self.shared
            .table
            .load()
            .as_deref()
            .is_some_and(|table| table.single.contains_key(&ServiceId::of::<C>()))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.table.load().is_none()
    }

    /// Drops the provider table and this thread's local instances. Other
    /// threads drop theirs on their next lookup.
    pub(crate) fn close(&self) -> Option<Arc<ProviderTable>> {
        self.shared.closed.store(true, Ordering::SeqCst);
        let table = self.shared.table.swap(None);
        CLOSE_EPOCH.fetch_add(1, Ordering::SeqCst);
        evict_closed_locals();
        table
    }

    fn resolve<C: ?Sized + 'static>(
        &self,
        service: ServiceId,
        record: &ServiceLaunchRecord,
    ) -> Result<Arc<C>, LookupError> {
        match record {
            ServiceLaunchRecord::Instance(instance) => instance
                .downcast_ref::<Arc<C>>()
                .cloned()
                .ok_or(LookupError::NotFound { service }),
            ServiceLaunchRecord::InstanceAllocator(allocator) => {
                self.local_instance::<C>(service, allocator)
            }
            ServiceLaunchRecord::Invalid | ServiceLaunchRecord::MultipleProviderTag => {
                Err(LookupError::NotFound { service })
            }
        }
    }

    fn local_instance<C: ?Sized + 'static>(
        &self,
        service: ServiceId,
        allocator: &LocalAllocator,
    ) -> Result<Arc<C>, LookupError> {
        let key = (self.shared.instance, allocator.provider);
        let cached = LOCAL_INSTANCES.with(|locals| {
            locals
                .borrow()
                .entries
                .get(&key)
                .and_then(|entry| entry.instance.downcast_ref::<Arc<C>>().cloned())
        });
        if let Some(instance) = cached {
            return Ok(instance);
        }

        // The allocator runs outside the borrow so it may look up other
        // local services itself.
        let fresh = allocator
            .allocate()
            .map_err(|source| LookupError::AllocationFailed { service, source })?;
        let handle = fresh
            .downcast_ref::<Arc<C>>()
            .cloned()
            .ok_or(LookupError::NotFound { service })?;
        debug!(%service, provider = %allocator.provider, "local service allocated for thread");
        // A provider closed meanwhile must not gain a cache entry that no
        // later sweep on this thread would see.
        if !self.shared.closed.load(Ordering::SeqCst) {
            LOCAL_INSTANCES.with(|locals| {
                locals.borrow_mut().entries.entry(key).or_insert(LocalEntry {
                    owner: Arc::downgrade(&self.shared),
                    owner_closed: Arc::clone(&self.shared.closed),
                    instance: fresh,
                });
            });
        }
        Ok(handle)
    }
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("instance", &self.shared.instance)
            .field(
                "capabilities",
                &self.shared.table.load().as_deref().map(ProviderTable::len),
            )
            .finish()
    }
}
