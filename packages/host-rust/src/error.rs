//! Configuration and lookup errors.
//!
//! Call-time errors (`CallError`) and the captured remote error
//! (`ServiceError`) live in `svchost_core` because the envelope and the
//! pending-result handle carry them.

use svchost_core::{ServiceError, ServiceGroupId, ServiceId};

/// Errors detected while configuring or starting the host. Fatal to startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{service} is already registered")]
    DuplicateRegistration { service: ServiceId },
    #[error("unknown service group {group}")]
    UnknownGroup { group: ServiceGroupId },
    #[error("service group name {name:?} is already bound to {existing}")]
    GroupNameTaken {
        name: String,
        existing: ServiceGroupId,
    },
    #[error("{strategy} service {service} cannot be registered into {group}")]
    StrategyNotAllowed {
        service: ServiceId,
        strategy: &'static str,
        group: ServiceGroupId,
    },
    #[error("invalid launch record for {service}: {reason}")]
    InvalidLaunchRecord {
        service: ServiceId,
        reason: &'static str,
    },
    #[error("invalid host configuration: {0}")]
    InvalidConfig(String),
    #[error("service {service} failed to start: {source}")]
    StartFailed {
        service: ServiceId,
        #[source]
        source: ServiceError,
    },
    #[error("failed to spawn worker thread for {group}: {source}")]
    ThreadSpawn {
        group: ServiceGroupId,
        #[source]
        source: std::io::Error,
    },
    #[error("worker thread for {group} exited during startup")]
    WorkerLost { group: ServiceGroupId },
}

/// Errors returned by capability lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("capability {service} is not registered")]
    NotFound { service: ServiceId },
    /// The host has shut down and released its services.
    #[error("service provider is closed")]
    ProviderClosed,
    #[error("failed to allocate local service {service}: {source}")]
    AllocationFailed {
        service: ServiceId,
        #[source]
        source: ServiceError,
    },
}
