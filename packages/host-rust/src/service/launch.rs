//! Resolved entry of the provider table.

use std::fmt;

use svchost_core::{ProviderId, ServiceError};

use super::factory::{AllocateFn, LocalInstance, SharedInstance};

/// Which shape a [`ServiceLaunchRecord`] has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum LaunchKind {
    Invalid,
    Instance,
    InstanceAllocator,
    MultipleProviderTag,
}

/// Per-thread allocator for a local service.
#[derive(Clone)]
pub(crate) struct LocalAllocator {
    pub(crate) provider: ProviderId,
    allocate: AllocateFn,
}

impl LocalAllocator {
    pub(crate) fn new(provider: ProviderId, allocate: AllocateFn) -> Self {
        Self { provider, allocate }
    }

    pub(crate) fn allocate(&self) -> Result<LocalInstance, ServiceError> {
        (self.allocate)()
    }
}

/// How a capability lookup is satisfied.
///
/// - `Instance` holds exactly one shared handle (global services and async
///   proxies).
/// - `InstanceAllocator` holds exactly one per-thread allocator.
/// - `MultipleProviderTag` marks a capability with several providers; the
///   providers themselves live in a separate ordered list.
/// - `Invalid` holds nothing and never resolves.
#[derive(Clone)]
pub(crate) enum ServiceLaunchRecord {
    Invalid,
    Instance(SharedInstance),
    InstanceAllocator(LocalAllocator),
    MultipleProviderTag,
}

impl ServiceLaunchRecord {
    /// Builds a record, yielding `Invalid` unless exactly the payload required
    /// by `kind` is present.
    pub(crate) fn from_parts(
        kind: LaunchKind,
        instance: Option<SharedInstance>,
        allocator: Option<LocalAllocator>,
    ) -> Self {
        match (kind, instance, allocator) {
            (LaunchKind::Instance, Some(instance), None) => Self::Instance(instance),
            (LaunchKind::InstanceAllocator, None, Some(allocator)) => {
                Self::InstanceAllocator(allocator)
            }
            (LaunchKind::MultipleProviderTag, None, None) => Self::MultipleProviderTag,
            _ => Self::Invalid,
        }
    }

    pub(crate) fn kind(&self) -> LaunchKind {
        match self {
            Self::Invalid => LaunchKind::Invalid,
            Self::Instance(_) => LaunchKind::Instance,
            Self::InstanceAllocator(_) => LaunchKind::InstanceAllocator,
            Self::MultipleProviderTag => LaunchKind::MultipleProviderTag,
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.kind() != LaunchKind::Invalid
    }
}

impl fmt::Debug for ServiceLaunchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceAllocator(allocator) => f
                .debug_tuple("InstanceAllocator")
                .field(&allocator.provider)
                .finish(),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn shared() -> SharedInstance {
        Arc::new(Arc::new(7_u32))
    }

    fn allocator() -> LocalAllocator {
        LocalAllocator::new(
            ProviderId::new(1),
            Arc::new(|| Ok(Box::new(Arc::new(1_u8)) as LocalInstance)),
        )
    }

    #[test]
    fn well_formed_records() {
        let record = ServiceLaunchRecord::from_parts(LaunchKind::Instance, Some(shared()), None);
        assert_eq!(record.kind(), LaunchKind::Instance);
        assert!(record.is_valid());

        let record =
            ServiceLaunchRecord::from_parts(LaunchKind::InstanceAllocator, None, Some(allocator()));
        assert_eq!(record.kind(), LaunchKind::InstanceAllocator);

        let record = ServiceLaunchRecord::from_parts(LaunchKind::MultipleProviderTag, None, None);
        assert_eq!(record.kind(), LaunchKind::MultipleProviderTag);
        assert!(record.is_valid());
    }

    #[test]
    fn mismatched_payloads_are_invalid() {
        let cases = [
            ServiceLaunchRecord::from_parts(LaunchKind::Instance, None, None),
            ServiceLaunchRecord::from_parts(LaunchKind::Instance, Some(shared()), Some(allocator())),
            ServiceLaunchRecord::from_parts(LaunchKind::InstanceAllocator, Some(shared()), None),
            ServiceLaunchRecord::from_parts(LaunchKind::MultipleProviderTag, Some(shared()), None),
            ServiceLaunchRecord::from_parts(LaunchKind::Invalid, None, None),
        ];
        for record in cases {
            assert_eq!(record.kind(), LaunchKind::Invalid, "{record:?}");
            assert!(!record.is_valid());
        }
    }

    #[test]
    fn allocator_produces_instances() {
        let instance = allocator().allocate().unwrap();
        assert_eq!(**instance.downcast_ref::<Arc<u8>>().unwrap(), 1);
    }
}
