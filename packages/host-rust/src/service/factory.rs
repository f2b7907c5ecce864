//! Service factories: how a capability gets its implementation.
//!
//! A factory is one of three strategies:
//!
//! | Strategy | Created | Lives on | Handle handed out |
//! |----------|---------|----------|-------------------|
//! | local    | lazily, once per consuming thread | that thread | the thread's own instance |
//! | global   | at host start | main group | one shared instance |
//! | async    | at host start | its group's thread | a proxy that forwards calls |

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use svchost_core::{ServiceError, ServiceId};

use super::async_service::{AsyncProxy, AsyncServiceImpl};

/// Type-erased shared handle: an `Arc<C>` boxed behind `Any`.
pub(crate) type SharedInstance = Arc<dyn Any + Send + Sync>;
/// Type-erased per-thread handle: an `Arc<C>` boxed behind `Any`.
pub(crate) type LocalInstance = Box<dyn Any>;

pub(crate) type AllocateFn = Arc<dyn Fn() -> Result<LocalInstance, ServiceError> + Send + Sync>;
pub(crate) type CreateGlobalFn = Box<dyn FnOnce() -> Result<SharedInstance, ServiceError> + Send>;
pub(crate) type CreateImplFn =
    Box<dyn FnOnce() -> Result<Box<dyn AsyncServiceImpl>, ServiceError> + Send>;
pub(crate) type CreateProxyFn = Box<dyn FnOnce(AsyncProxy) -> SharedInstance + Send>;

/// Instantiation strategy of a registered capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStrategy {
    Local,
    Global,
    Async,
}

impl ServiceStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStrategy::Local => "local",
            ServiceStrategy::Global => "global",
            ServiceStrategy::Async => "async",
        }
    }
}

impl fmt::Display for ServiceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum Strategy {
    Local {
        allocate: AllocateFn,
    },
    Global {
        create: CreateGlobalFn,
    },
    Async {
        create_impl: CreateImplFn,
        create_proxy: CreateProxyFn,
    },
}

/// Recipe for one capability, consumed by `ServiceRegistry::register`.
pub struct ServiceFactory {
    service: ServiceId,
    strategy: Strategy,
}

impl ServiceFactory {
    /// A per-thread service. `allocate` runs the first time each thread looks
    /// the capability up; that thread keeps the instance until it exits.
    pub fn local<C, F>(allocate: F) -> Self
    where
        C: ?Sized + 'static,
        F: Fn() -> Result<Arc<C>, ServiceError> + Send + Sync + 'static,
    {
        Self {
            service: ServiceId::of::<C>(),
            strategy: Strategy::Local {
                allocate: Arc::new(move || {
                    allocate().map(|instance| Box::new(instance) as LocalInstance)
                }),
            },
        }
    }

    /// A single shared instance created during host start.
    pub fn global<C, F>(create: F) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
        F: FnOnce() -> Result<Arc<C>, ServiceError> + Send + 'static,
    {
        Self {
            service: ServiceId::of::<C>(),
            strategy: Strategy::Global {
                create: Box::new(move || {
                    create().map(|instance| Arc::new(instance) as SharedInstance)
                }),
            },
        }
    }

    /// An implementation bound to a service group plus the proxy consumers
    /// see. `create_impl` runs on the group's thread; `create_proxy` wraps the
    /// [`AsyncProxy`] in whatever type implements `C`.
    pub fn asynchronous<C, I, F, P>(create_impl: F, create_proxy: P) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
        I: AsyncServiceImpl,
        F: FnOnce() -> Result<I, ServiceError> + Send + 'static,
        P: FnOnce(AsyncProxy) -> Arc<C> + Send + 'static,
    {
        Self {
            service: ServiceId::of::<C>(),
            strategy: Strategy::Async {
                create_impl: Box::new(move || {
                    create_impl().map(|imp| Box::new(imp) as Box<dyn AsyncServiceImpl>)
                }),
                create_proxy: Box::new(move |proxy| Arc::new(create_proxy(proxy)) as SharedInstance),
            },
        }
    }

    #[must_use]
    pub fn service_id(&self) -> ServiceId {
        self.service
    }

    #[must_use]
    pub fn strategy(&self) -> ServiceStrategy {
        match self.strategy {
            Strategy::Local { .. } => ServiceStrategy::Local,
            Strategy::Global { .. } => ServiceStrategy::Global,
            Strategy::Async { .. } => ServiceStrategy::Async,
        }
    }

    pub(crate) fn into_strategy(self) -> Strategy {
        self.strategy
    }
}

impl fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceFactory")
            .field("service", &self.service)
            .field("strategy", &self.strategy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use svchost_core::Envelope;

    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    struct Noop;

    impl AsyncServiceImpl for Noop {
        fn process(&mut self, _envelope: &mut Envelope) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    #[test]
    fn factories_report_capability_and_strategy() {
        let local = ServiceFactory::local::<dyn Greeter, _>(|| Ok(Arc::new(English)));
        assert_eq!(local.service_id(), ServiceId::of::<dyn Greeter>());
        assert_eq!(local.strategy(), ServiceStrategy::Local);

        let global = ServiceFactory::global::<dyn Greeter, _>(|| Ok(Arc::new(English)));
        assert_eq!(global.strategy(), ServiceStrategy::Global);

        let asynchronous = ServiceFactory::asynchronous::<dyn Greeter, _, _, _>(
            || Ok(Noop),
            |_proxy| Arc::new(English),
        );
        assert_eq!(asynchronous.strategy(), ServiceStrategy::Async);
        assert_eq!(asynchronous.strategy().to_string(), "async");
    }

    #[test]
    fn global_factory_erases_to_arc_of_capability() {
        let factory = ServiceFactory::global::<dyn Greeter, _>(|| Ok(Arc::new(English)));
        let Strategy::Global { create } = factory.into_strategy() else {
            panic!("expected global strategy");
        };
        let instance = create().unwrap();
        let greeter = instance.downcast_ref::<Arc<dyn Greeter>>().unwrap();
        assert_eq!(greeter.greet(), "hello");
    }

    #[test]
    fn local_factory_allocates_fresh_instances() {
        let factory = ServiceFactory::local::<dyn Greeter, _>(|| Ok(Arc::new(English)));
        let Strategy::Local { allocate } = factory.into_strategy() else {
            panic!("expected local strategy");
        };
        let first = allocate().unwrap();
        let second = allocate().unwrap();
        let first = first.downcast_ref::<Arc<dyn Greeter>>().unwrap();
        let second = second.downcast_ref::<Arc<dyn Greeter>>().unwrap();
        assert!(!Arc::ptr_eq(first, second));
    }

    #[test]
    fn factory_errors_pass_through() {
        let factory = ServiceFactory::global::<dyn Greeter, _>(|| {
            Err(ServiceError::NotSupported("no locale".to_string()))
        });
        let Strategy::Global { create } = factory.into_strategy() else {
            panic!("expected global strategy");
        };
        assert!(matches!(create(), Err(ServiceError::NotSupported(_))));
    }
}
