//! Service registration and lookup.
//!
//! Configuration and startup run in this order:
//!
//! 1. **Factories** (`factory`): how a capability gets its implementation
//!    (local, global, or async)
//! 2. **Registry** (`registry`): groups and registrations, validated eagerly,
//!    then `start` turns them into a running host
//! 3. **Launch records** (`launch`): the resolved provider-table entries
//! 4. **Provider** (`provider`): capability lookup from any thread
//! 5. **Async services** (`async_service`): the proxy/implementation pair that
//!    carries calls across threads
//! 6. **Config** (`config`): host-wide settings

pub mod async_service;
pub mod config;
pub mod factory;
pub(crate) mod launch;
pub mod provider;
pub mod registry;

// Re-export key types for convenient access.
pub use async_service::{AsyncProxy, AsyncServiceImpl, CallArgs};
pub use config::HostConfig;
pub use factory::{ServiceFactory, ServiceStrategy};
pub use provider::ServiceProvider;
pub use registry::ServiceRegistry;
