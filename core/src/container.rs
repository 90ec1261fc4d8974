//! Type-keyed dependency container shared by every module of a host process.
//!
//! Keys are type identities, so both concrete types and trait objects can be published:
//!
//! ```
//! use forge_core::Container;
//! use std::sync::Arc;
//!
//! trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//! struct English;
//! impl Greeter for English {
//!     fn greet(&self) -> String {
//!         "hello".to_string()
//!     }
//! }
//!
//! let container = Container::new();
//! container.register::<dyn Greeter>(Arc::new(English));
//! let greeter = container.try_resolve::<dyn Greeter>().unwrap();
//! assert_eq!(greeter.greet(), "hello");
//! ```

use crate::errors::ContainerError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Each entry holds an `Arc<T>` boxed as `Any`, so `T` may be unsized.
type Slot = Box<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct Container {
    entries: DashMap<TypeId, Slot>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `instance` under `T`. The first registration wins; returns false and leaves
    /// the existing entry untouched if `T` is already registered.
    pub fn register<T>(&self, instance: Arc<T>) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        match self.entries.entry(TypeId::of::<T>()) {
            Entry::Occupied(_) => {
                debug!(key = type_name::<T>(), "Dependency already registered, keeping first");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Box::new(instance));
                debug!(key = type_name::<T>(), "Registered dependency");
                true
            }
        }
    }

    /// Returns the registered instance, constructing and registering a default one on first use.
    pub fn resolve<T>(&self) -> Arc<T>
    where
        T: Default + Send + Sync + 'static,
    {
        if let Some(existing) = self.try_resolve::<T>() {
            return existing;
        }
        // Built outside the map lock; a concurrent registration may still win.
        let created: Arc<T> = Arc::new(T::default());
        let slot = self
            .entries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(created.clone()));
        downcast::<T>(slot.value()).unwrap_or(created)
    }

    /// Non-constructing lookup.
    pub fn try_resolve<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|slot| downcast::<T>(slot.value()))
    }

    /// Lookup for keys that cannot be constructed on demand.
    pub fn get<T>(&self) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.try_resolve::<T>()
            .ok_or(ContainerError::NotFound(type_name::<T>()))
    }

    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + 'static,
    {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn downcast<T>(slot: &Slot) -> Option<Arc<T>>
where
    T: ?Sized + Send + Sync + 'static,
{
    slot.downcast_ref::<Arc<T>>().cloned()
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct Named(&'static str);

    #[derive(Default)]
    struct Counter {
        hits: AtomicUsize,
    }

    trait Clock: Send + Sync {
        fn now(&self) -> u64;
    }

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn now(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn test_first_registration_wins() {
        let container = Container::new();
        assert!(container.register(Arc::new(Named("A"))));
        assert!(!container.register(Arc::new(Named("B"))));

        let resolved = container.get::<Named>().unwrap();
        assert_eq!(*resolved, Named("A"));
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn test_resolve_constructs_once() {
        let container = Container::new();
        assert!(!container.contains::<Counter>());

        let first = container.resolve::<Counter>();
        first.hits.fetch_add(1, Ordering::SeqCst);
        let second = container.resolve::<Counter>();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.hits.load(Ordering::SeqCst), 1);
        assert!(container.contains::<Counter>());
    }

    #[test]
    fn test_resolve_prefers_registered_instance() {
        let container = Container::new();
        let registered = Arc::new(Counter::default());
        registered.hits.store(7, Ordering::SeqCst);
        container.register(registered.clone());

        assert!(Arc::ptr_eq(&container.resolve::<Counter>(), &registered));
    }

    #[test]
    fn test_try_resolve_does_not_construct() {
        let container = Container::new();
        assert!(container.try_resolve::<Counter>().is_none());
        assert!(container.is_empty());
    }

    #[test]
    fn test_get_missing_reports_type() {
        let container = Container::new();
        match container.get::<Named>() {
            Err(ContainerError::NotFound(name)) => assert!(name.ends_with("Named")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_trait_object_keys() {
        let container = Container::new();
        container.register::<dyn Clock>(Arc::new(FixedClock(42)));
        container.register::<dyn Clock>(Arc::new(FixedClock(7)));

        assert_eq!(container.get::<dyn Clock>().unwrap().now(), 42);
        // Concrete and trait-object keys are distinct
        assert!(container.try_resolve::<FixedClock>().is_none());
    }

    #[test]
    fn test_concurrent_resolve_yields_single_instance() {
        let container = Arc::new(Container::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let container = container.clone();
                std::thread::spawn(move || container.resolve::<Counter>())
            })
            .collect();
        let instances: Vec<Arc<Counter>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for instance in &instances[1..] {
            assert!(Arc::ptr_eq(&instances[0], instance));
        }
    }
}
