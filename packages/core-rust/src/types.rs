//! Identity and ordering values: `Priority`, `ServiceId`, `ProviderId`,
//! `ServiceGroupId`, and the `GroupState` lifecycle.
//!
//! These are immutable value objects created at registration time. They carry
//! no behavior beyond comparison, hashing, and display.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Startup ordering key for a registered service.
///
/// Lower values start earlier and stop later. Services with equal priority
/// keep their registration order (the registry sorts stably).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(i32);

impl Priority {
    /// Starts before everything else.
    pub const EARLIEST: Priority = Priority(i32::MIN);
    /// Default priority for ordinary services.
    pub const NORMAL: Priority = Priority(0);
    /// Starts after everything else.
    pub const LATEST: Priority = Priority(i32::MAX);

    #[must_use]
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> i32 {
        self.0
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ServiceId
// ---------------------------------------------------------------------------

/// Identity of a capability, derived from its interface type.
///
/// Consumers look services up by capability type (usually a `dyn Trait`),
/// never by group or thread. Equality and hashing use the `TypeId` only; the
/// type name is kept for diagnostics.
#[derive(Clone, Copy)]
pub struct ServiceId {
    type_id: TypeId,
    type_name: &'static str,
}

impl ServiceId {
    /// Returns the identity of capability `C`.
    #[must_use]
    pub fn of<C: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<C>(),
            type_name: std::any::type_name::<C>(),
        }
    }

    /// Human-readable capability name, e.g. `dyn my_crate::Calculator`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for ServiceId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ServiceId {}

impl Hash for ServiceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceId").field(&self.type_name).finish()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

// ---------------------------------------------------------------------------
// ProviderId
// ---------------------------------------------------------------------------

/// Identity of one registration (one provider of a capability).
///
/// Assigned sequentially by the registry, so it doubles as the registration
/// order tie-breaker for equal priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(u32);

impl ProviderId {
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ServiceGroupId
// ---------------------------------------------------------------------------

/// Identity of a thread-affinity domain.
///
/// `ServiceGroupId::MAIN` is the host thread; every other id names a group
/// that owns a dedicated worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceGroupId(u32);

impl ServiceGroupId {
    /// The host (calling) thread's group.
    pub const MAIN: ServiceGroupId = ServiceGroupId(0);

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_main(self) -> bool {
        self.0 == Self::MAIN.0
    }
}

impl fmt::Display for ServiceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_main() {
            f.write_str("main")
        } else {
            write!(f, "group#{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// GroupState
// ---------------------------------------------------------------------------

/// Lifecycle of a service group's queue.
///
/// State machine: Created -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupState {
    /// Group exists but its services have not been started.
    Created,
    /// Accepting and dispatching envelopes.
    Running,
    /// Dispatching what is already queued; new envelopes are rejected.
    Draining,
    /// Terminal. Every enqueue attempt fails.
    Stopped,
}

impl GroupState {
    /// Only a running group accepts new envelopes from producers.
    #[must_use]
    pub const fn accepts_messages(self) -> bool {
        matches!(self, GroupState::Running)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
