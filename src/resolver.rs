//! Dependency resolution contract and a built-in registry resolver.
//!
//! Handlers are resolved by the `TypeId` of their concrete type, either from
//! the root resolver or from a child scope whose lifetime equals one
//! message's processing. Scopes release their instances on drop.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::message::AnyMessage;

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Root dependency resolver handed to the bus at build time.
pub trait DependencyResolver: Send + Sync {
    /// Resolve an instance by its concrete type id, or `None` when nothing
    /// is registered for it.
    fn resolve(&self, type_id: TypeId) -> Option<AnyMessage>;

    /// Open a child scope. Instances created within the scope live until the
    /// scope is dropped.
    fn create_scope(&self) -> Box<dyn DependencyScope>;
}

/// A child resolution context tied to one message. Dropping the scope
/// releases every instance it created.
pub trait DependencyScope: Send + Sync {
    fn resolve(&self, type_id: TypeId) -> Option<AnyMessage>;

    /// Release one cached instance early, before the scope itself is
    /// dropped. Default is a no-op for scopes that do not cache.
    fn release(&self, _type_id: TypeId) {}
}

/// Pass-through scope used when per-message scoping is disabled: resolves
/// from the root and caches nothing.
pub(crate) struct RootScope {
    root: Arc<dyn DependencyResolver>,
}

impl RootScope {
    pub(crate) fn new(root: Arc<dyn DependencyResolver>) -> Self {
        Self { root }
    }
}

impl DependencyScope for RootScope {
    fn resolve(&self, type_id: TypeId) -> Option<AnyMessage> {
        self.root.resolve(type_id)
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

type HandlerFactory = Arc<dyn Fn() -> AnyMessage + Send + Sync>;

/// Built-in resolver: singletons plus per-scope factories.
///
/// Singletons resolve to the same shared instance everywhere. Factory
/// registrations produce a fresh instance per root resolve, and one cached
/// instance per scope (released when the scope drops).
#[derive(Default)]
pub struct HandlerRegistry {
    singletons: HashMap<TypeId, AnyMessage>,
    factories: HashMap<TypeId, HandlerFactory>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared singleton instance.
    pub fn register<T: Send + Sync + 'static>(&mut self, instance: T) {
        self.singletons.insert(TypeId::of::<T>(), Arc::new(instance));
    }

    /// Register a factory invoked once per scope (or per root resolve).
    pub fn register_factory<T, F>(&mut self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factories
            .insert(TypeId::of::<T>(), Arc::new(move || Arc::new(factory()) as AnyMessage));
    }
}

impl DependencyResolver for HandlerRegistry {
    fn resolve(&self, type_id: TypeId) -> Option<AnyMessage> {
        if let Some(instance) = self.singletons.get(&type_id) {
            return Some(instance.clone());
        }
        self.factories.get(&type_id).map(|factory| factory())
    }

    fn create_scope(&self) -> Box<dyn DependencyScope> {
        Box::new(RegistryScope {
            singletons: self.singletons.clone(),
            factories: self.factories.clone(),
            cache: Mutex::new(HashMap::new()),
        })
    }
}

/// Scope over a [`HandlerRegistry`]: factory instances are cached for the
/// scope's lifetime and released together on drop.
struct RegistryScope {
    singletons: HashMap<TypeId, AnyMessage>,
    factories: HashMap<TypeId, HandlerFactory>,
    cache: Mutex<HashMap<TypeId, AnyMessage>>,
}

impl DependencyScope for RegistryScope {
    fn resolve(&self, type_id: TypeId) -> Option<AnyMessage> {
        if let Some(instance) = self.singletons.get(&type_id) {
            return Some(instance.clone());
        }
        let factory = self.factories.get(&type_id)?;
        let mut cache = self.cache.lock();
        Some(cache.entry(type_id).or_insert_with(|| factory()).clone())
    }

    fn release(&self, type_id: TypeId) {
        self.cache.lock().remove(&type_id);
    }
}

impl Drop for RegistryScope {
    fn drop(&mut self) {
        let count = self.cache.lock().len();
        if count > 0 {
            trace!(instances = count, "releasing message scope");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
