//! Faults raised while executing work.
//!
//! A [`Fault`] is the run-time analogue of an exception: it carries a
//! [`FaultType`] drawn from a single-inheritance hierarchy so escalation
//! procedures can match on "declared type or any subtype".
//!
//! ```text
//! Fault
//! ├── Application
//! ├── Panic
//! └── Escalation
//!     ├── ManagedObject
//!     │   ├── FailedToSourceManagedObject
//!     │   ├── SourceManagedObjectTimedOut
//!     │   └── AsynchronousOperationTimedOut
//!     ├── FlowJoinTimedOut
//!     └── UnknownKey
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::types::{Error, FaultId, Result};

/// A node in the fault type hierarchy.
///
/// Declared as statics so identity is stable for the process lifetime:
///
/// ```
/// use floor_kernel::kernel::{faults, FaultType};
///
/// static SQL_FAULT: FaultType = FaultType::new("SqlFault", Some(&faults::APPLICATION));
/// assert!(SQL_FAULT.is_a(&faults::FAULT));
/// ```
#[derive(Debug)]
pub struct FaultType {
    name: &'static str,
    parent: Option<&'static FaultType>,
}

impl FaultType {
    pub const fn new(name: &'static str, parent: Option<&'static FaultType>) -> Self {
        Self { name, parent }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static FaultType> {
        self.parent
    }

    /// Whether this type is `other` or a subtype of it.
    pub fn is_a(&self, other: &FaultType) -> bool {
        let mut current: Option<&FaultType> = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent;
        }
        false
    }

    /// Distance from this type up to `ancestor` (0 for the same type).
    pub fn depth_to(&self, ancestor: &FaultType) -> Option<usize> {
        let mut depth = 0;
        let mut current: Option<&FaultType> = Some(self);
        while let Some(kind) = current {
            if kind == ancestor {
                return Some(depth);
            }
            depth += 1;
            current = kind.parent;
        }
        None
    }
}

impl PartialEq for FaultType {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || self.name == other.name
    }
}

impl Eq for FaultType {}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Built-in kernel fault types.
pub mod faults {
    use super::FaultType;

    pub static FAULT: FaultType = FaultType::new("Fault", None);
    pub static APPLICATION: FaultType = FaultType::new("Application", Some(&FAULT));
    pub static PANIC: FaultType = FaultType::new("Panic", Some(&FAULT));
    pub static ESCALATION: FaultType = FaultType::new("Escalation", Some(&FAULT));
    pub static MANAGED_OBJECT: FaultType = FaultType::new("ManagedObject", Some(&ESCALATION));
    pub static FAILED_TO_SOURCE_MANAGED_OBJECT: FaultType =
        FaultType::new("FailedToSourceManagedObject", Some(&MANAGED_OBJECT));
    pub static SOURCE_MANAGED_OBJECT_TIMED_OUT: FaultType =
        FaultType::new("SourceManagedObjectTimedOut", Some(&MANAGED_OBJECT));
    pub static ASYNCHRONOUS_OPERATION_TIMED_OUT: FaultType =
        FaultType::new("AsynchronousOperationTimedOut", Some(&MANAGED_OBJECT));
    pub static FLOW_JOIN_TIMED_OUT: FaultType =
        FaultType::new("FlowJoinTimedOut", Some(&ESCALATION));
    pub static UNKNOWN_KEY: FaultType = FaultType::new("UnknownKey", Some(&ESCALATION));

    /// All built-in types, root first.
    pub fn builtin() -> [&'static FaultType; 10] {
        [
            &FAULT,
            &APPLICATION,
            &PANIC,
            &ESCALATION,
            &MANAGED_OBJECT,
            &FAILED_TO_SOURCE_MANAGED_OBJECT,
            &SOURCE_MANAGED_OBJECT_TIMED_OUT,
            &ASYNCHRONOUS_OPERATION_TIMED_OUT,
            &FLOW_JOIN_TIMED_OUT,
            &UNKNOWN_KEY,
        ]
    }
}

/// A fault raised during execution.
///
/// Cloning keeps the [`FaultId`], so a handler re-raising the fault it was
/// given is recognised as re-raising the same instance.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct Fault {
    id: FaultId,
    kind: &'static FaultType,
    message: String,
    #[source]
    cause: Option<Arc<Fault>>,
}

impl Fault {
    pub fn new(kind: &'static FaultType, message: impl Into<String>) -> Self {
        Self {
            id: FaultId::next(),
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Fault raised by application logic.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(&faults::APPLICATION, message)
    }

    pub fn with_cause(mut self, cause: Fault) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn id(&self) -> FaultId {
        self.id
    }

    pub fn kind(&self) -> &'static FaultType {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Fault> {
        self.cause.as_deref()
    }

    /// Whether this fault's type is `kind` or a subtype of it.
    pub fn is_a(&self, kind: &FaultType) -> bool {
        self.kind.is_a(kind)
    }

    /// Innermost fault of the cause chain.
    pub fn root_cause(&self) -> &Fault {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }
}

/// Resolves configured fault type names to static types.
#[derive(Debug, Clone)]
pub struct FaultTypeRegistry {
    types: HashMap<&'static str, &'static FaultType>,
}

impl FaultTypeRegistry {
    /// Registry containing the built-in kernel fault types.
    pub fn new() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
        };
        for kind in faults::builtin() {
            registry.register(kind);
        }
        registry
    }

    /// Register a fault type along with its ancestors.
    pub fn register(&mut self, kind: &'static FaultType) {
        let mut current = Some(kind);
        while let Some(k) = current {
            self.types.entry(k.name()).or_insert(k);
            current = k.parent();
        }
    }

    pub fn resolve(&self, name: &str) -> Result<&'static FaultType> {
        if name.trim().is_empty() {
            return Err(Error::configuration("fault type name cannot be empty"));
        }
        self.types
            .get(name)
            .copied()
            .ok_or_else(|| Error::configuration(format!("unknown fault type: {}", name)))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for FaultTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    static DATA_FAULT: FaultType = FaultType::new("DataFault", Some(&faults::APPLICATION));
    static SQL_FAULT: FaultType = FaultType::new("SqlFault", Some(&DATA_FAULT));

    #[test]
    fn test_is_a_walks_hierarchy() {
        assert!(SQL_FAULT.is_a(&SQL_FAULT));
        assert!(SQL_FAULT.is_a(&DATA_FAULT));
        assert!(SQL_FAULT.is_a(&faults::FAULT));
        assert!(!DATA_FAULT.is_a(&SQL_FAULT));
        assert!(!SQL_FAULT.is_a(&faults::ESCALATION));
        assert!(faults::SOURCE_MANAGED_OBJECT_TIMED_OUT.is_a(&faults::MANAGED_OBJECT));
    }

    #[test]
    fn test_depth_to() {
        assert_eq!(SQL_FAULT.depth_to(&SQL_FAULT), Some(0));
        assert_eq!(SQL_FAULT.depth_to(&faults::APPLICATION), Some(2));
        assert_eq!(SQL_FAULT.depth_to(&faults::PANIC), None);
    }

    #[test]
    fn test_clone_keeps_identity() {
        let fault = Fault::new(&SQL_FAULT, "TEST");
        let copy = fault.clone();
        assert_eq!(fault.id(), copy.id());
        assert_ne!(fault.id(), Fault::new(&SQL_FAULT, "TEST").id());
    }

    #[test]
    fn test_display_and_source_chain() {
        let cause = Fault::application("disk full");
        let fault = Fault::new(&faults::FAILED_TO_SOURCE_MANAGED_OBJECT, "db").with_cause(cause);
        assert_eq!(fault.to_string(), "FailedToSourceManagedObject: db");
        assert_eq!(fault.source().unwrap().to_string(), "Application: disk full");
        assert_eq!(fault.root_cause().message(), "disk full");
    }

    #[test]
    fn test_registry_resolves_registered_types() {
        let mut registry = FaultTypeRegistry::new();
        assert!(registry.resolve("SqlFault").is_err());
        registry.register(&SQL_FAULT);
        assert_eq!(registry.resolve("SqlFault").unwrap(), &SQL_FAULT);
        assert_eq!(registry.resolve("DataFault").unwrap(), &DATA_FAULT);
        assert!(registry.resolve("").unwrap_err().is_configuration());
        assert_eq!(registry.resolve("Fault").unwrap(), &faults::FAULT);
    }
}
