//! Managed objects - externally sourced resources with a defined lifecycle.
//!
//! A [`ManagedObjectSource`] provides instances, synchronously or via a
//! later callback on [`ManagedObjectUser`]. Sources may be fronted by a
//! [`ManagedObjectPool`] that recycles instances across uses. Each use of a
//! managed object goes through a container that tracks the
//! `Unsourced → Sourcing → Ready → InUse → (Returned | Lost)` lifecycle and
//! parks job nodes on its asset monitor while the object is not ready.

mod container;
mod pool;

pub use container::{AsynchronousContext, ContainerPhase, ObjectRegistry};
pub(crate) use container::{Dependency, ManagedObjectContainer, Readiness};
pub use pool::{
    FreeListPool, FreeListPoolFactory, ManagedObjectPool, ManagedObjectPoolFactory, PoolStatus,
    ThreadCompletionListener,
};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::fault::Fault;
use crate::types::{property_usize, InstanceId, Result};

/// A sourced resource.
pub trait ManagedObject: Send + Sync + fmt::Debug {
    /// The object handed to functions.
    fn object(&self) -> Arc<dyn Any + Send + Sync>;

    /// Extension capability used by governance and administration.
    fn extension(&self, _extension: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    /// Coordinating objects receive their dependencies here once ready.
    fn load_objects(&self, _registry: &ObjectRegistry<'_>) -> std::result::Result<(), Fault> {
        Ok(())
    }

    /// Objects performing asynchronous operations keep this context.
    fn register_asynchronous_listener(&self, _context: AsynchronousContext) {}

    /// Called once the instance leaves circulation.
    fn release(&self) {}
}

/// A sourced instance with a process-unique identity.
#[derive(Debug, Clone)]
pub struct ManagedObjectInstance {
    id: InstanceId,
    object: Arc<dyn ManagedObject>,
}

impl ManagedObjectInstance {
    pub fn new(object: Arc<dyn ManagedObject>) -> Self {
        Self {
            id: InstanceId::next(),
            object,
        }
    }

    /// Wrap a plain value as a managed object instance.
    pub fn from_value<T: Any + Send + Sync>(value: T) -> Self {
        Self::new(Arc::new(ValueManagedObject::new(value)))
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn managed_object(&self) -> &Arc<dyn ManagedObject> {
        &self.object
    }
}

/// Receives the outcome of sourcing.
pub trait ManagedObjectUser: Send + Sync {
    fn set_managed_object(&self, instance: ManagedObjectInstance);
    fn set_failure(&self, fault: Fault);
}

/// Name and properties a source is started with.
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    name: &'a str,
    properties: &'a HashMap<String, String>,
}

impl<'a> SourceContext<'a> {
    pub fn new(name: &'a str, properties: &'a HashMap<String, String>) -> Self {
        Self { name, properties }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn property_usize(&self, name: &str, default: usize) -> Result<usize> {
        property_usize(self.properties, name, default)
    }
}

/// Provider of managed object instances.
pub trait ManagedObjectSource: Send + Sync + fmt::Debug {
    fn start(&self, _context: &SourceContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Provide an instance to `user`, now or later from another thread.
    fn source_managed_object(&self, user: Arc<dyn ManagedObjectUser>);

    fn stop(&self) {}
}

// =============================================================================
// Convenience implementations
// =============================================================================

/// Managed object exposing a fixed value and optional extensions.
pub struct ValueManagedObject {
    value: Arc<dyn Any + Send + Sync>,
    extensions: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ValueManagedObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            extensions: HashMap::new(),
        }
    }

    pub fn with_extension<E: Any + Send + Sync>(mut self, name: impl Into<String>, extension: E) -> Self {
        self.extensions.insert(name.into(), Arc::new(extension));
        self
    }
}

impl fmt::Debug for ValueManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueManagedObject")
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ManagedObject for ValueManagedObject {
    fn object(&self) -> Arc<dyn Any + Send + Sync> {
        self.value.clone()
    }

    fn extension(&self, extension: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.extensions.get(extension).cloned()
    }
}

/// Synchronous source backed by a factory closure.
pub struct FnManagedObjectSource<F> {
    factory: F,
}

impl<F> FnManagedObjectSource<F>
where
    F: Fn() -> std::result::Result<Arc<dyn ManagedObject>, Fault> + Send + Sync,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F> fmt::Debug for FnManagedObjectSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnManagedObjectSource")
    }
}

impl<F> ManagedObjectSource for FnManagedObjectSource<F>
where
    F: Fn() -> std::result::Result<Arc<dyn ManagedObject>, Fault> + Send + Sync,
{
    fn source_managed_object(&self, user: Arc<dyn ManagedObjectUser>) {
        match (self.factory)() {
            Ok(object) => user.set_managed_object(ManagedObjectInstance::new(object)),
            Err(fault) => user.set_failure(fault),
        }
    }
}

// =============================================================================
// Source Binding
// =============================================================================

/// A configured source: the provider plus its optional pool and timeouts.
#[derive(Debug)]
pub(crate) struct ManagedObjectSourceBinding {
    pub name: String,
    pub source: Arc<dyn ManagedObjectSource>,
    pub pool: Option<Arc<dyn ManagedObjectPool>>,
    pub timeout: Duration,
    pub async_timeout: Duration,
    pub properties: HashMap<String, String>,
}

impl ManagedObjectSourceBinding {
    /// Source through the pool when there is one.
    pub fn source_managed_object(&self, user: Arc<dyn ManagedObjectUser>) {
        match &self.pool {
            Some(pool) => pool.source_managed_object(user),
            None => self.source.source_managed_object(user),
        }
    }

    /// A used instance goes back to the pool, or is released.
    pub fn return_managed_object(&self, instance: ManagedObjectInstance) {
        match &self.pool {
            Some(pool) => pool.return_managed_object(instance),
            None => instance.managed_object().release(),
        }
    }

    /// An unusable instance leaves circulation.
    pub fn lost_managed_object(&self, instance: ManagedObjectInstance, cause: &Fault) {
        match &self.pool {
            Some(pool) => pool.lost_managed_object(&instance, cause),
            None => instance.managed_object().release(),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.source
            .start(&SourceContext::new(&self.name, &self.properties))
    }

    /// Drain the pool, then stop the source.
    pub fn stop(&self) {
        if let Some(pool) = &self.pool {
            pool.empty();
        }
        self.source.stop();
    }

    pub fn pool_status(&self) -> Option<PoolStatus> {
        self.pool.as_ref().map(|pool| pool.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture {
        instance: Mutex<Option<ManagedObjectInstance>>,
        fault: Mutex<Option<Fault>>,
    }

    impl ManagedObjectUser for Capture {
        fn set_managed_object(&self, instance: ManagedObjectInstance) {
            *self.instance.lock().unwrap() = Some(instance);
        }

        fn set_failure(&self, fault: Fault) {
            *self.fault.lock().unwrap() = Some(fault);
        }
    }

    #[test]
    fn test_value_managed_object_exposes_value_and_extension() {
        let object = ValueManagedObject::new(41u32).with_extension("counter", "ext");
        assert_eq!(*object.object().downcast::<u32>().unwrap(), 41);
        assert_eq!(*object.extension("counter").unwrap().downcast::<&str>().unwrap(), "ext");
        assert!(object.extension("missing").is_none());
    }

    #[test]
    fn test_fn_source_delivers_instance_or_failure() {
        let ok = FnManagedObjectSource::new(|| Ok(Arc::new(ValueManagedObject::new(1u8)) as Arc<dyn ManagedObject>));
        let capture = Arc::new(Capture::default());
        ok.source_managed_object(capture.clone());
        assert!(capture.instance.lock().unwrap().is_some());

        let failing = FnManagedObjectSource::new(|| Err(Fault::application("down")));
        let capture = Arc::new(Capture::default());
        failing.source_managed_object(capture.clone());
        assert_eq!(capture.fault.lock().unwrap().as_ref().unwrap().message(), "down");
    }

    #[test]
    fn test_instances_have_distinct_ids() {
        let a = ManagedObjectInstance::from_value(1u8);
        let b = ManagedObjectInstance::from_value(1u8);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_source_context_properties() {
        let mut properties = HashMap::new();
        properties.insert("size".to_string(), "3".to_string());
        let context = SourceContext::new("db", &properties);
        assert_eq!(context.name(), "db");
        assert_eq!(context.property("size"), Some("3"));
        assert_eq!(context.property_usize("size", 1).unwrap(), 3);
        assert_eq!(context.property_usize("other", 1).unwrap(), 1);
    }
}
