//! Function logic and the context it executes with.
//!
//! A function reaches its managed objects and flows by [`Key`]: the
//! declared symbolic key, or the position of the declaration. Flows are
//! instigated during execution but only scheduled once the function has
//! returned successfully.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::fault::{faults, Fault};
use super::managed_object::ManagedObjectContainer;
use super::office::{FlowMetaData, FunctionIndex, ObjectBinding};
use super::process_state::ProcessState;
use super::thread_state::ThreadState;
use crate::types::{ProcessId, ThreadId};

/// Identifier of a flow or dependency: symbolic, or by declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Named(String),
    Indexed(usize),
}

impl Key {
    /// Whether the declaration at `position` is identified by this key.
    ///
    /// A declaration without a symbolic key answers to the name of what it
    /// refers to.
    pub fn matches(&self, position: usize, declared: Option<&str>, name: &str) -> bool {
        match self {
            Key::Indexed(index) => *index == position,
            Key::Named(key) => declared.unwrap_or(name) == key,
        }
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Key::Named(key.to_string())
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Key::Named(key)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Key::Indexed(index)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Named(key) => write!(f, "'{}'", key),
            Key::Indexed(index) => write!(f, "#{}", index),
        }
    }
}

/// Argument passed into a function.
#[derive(Debug, Clone, Default)]
pub enum Argument {
    #[default]
    None,
    Value(serde_json::Value),
    /// The fault an escalation handler was dispatched for.
    Fault(Fault),
}

impl Argument {
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Argument::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Argument::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Argument::None)
    }
}

impl From<serde_json::Value> for Argument {
    fn from(value: serde_json::Value) -> Self {
        Argument::Value(value)
    }
}

impl From<()> for Argument {
    fn from(_: ()) -> Self {
        Argument::None
    }
}

impl From<Fault> for Argument {
    fn from(fault: Fault) -> Self {
        Argument::Fault(fault)
    }
}

/// Function logic.
pub trait ManagedFunction: Send + Sync {
    fn execute(&self, context: &mut FunctionContext<'_>) -> Result<(), Fault>;
}

impl<F> ManagedFunction for F
where
    F: Fn(&mut FunctionContext<'_>) -> Result<(), Fault> + Send + Sync,
{
    fn execute(&self, context: &mut FunctionContext<'_>) -> Result<(), Fault> {
        self(context)
    }
}

/// Handle on a flow running on its own thread of execution.
#[derive(Clone)]
pub struct FlowHandle {
    thread: Arc<ThreadState>,
}

impl fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowHandle")
            .field("thread", &self.thread.id())
            .finish()
    }
}

impl FlowHandle {
    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }

    pub fn is_complete(&self) -> bool {
        self.thread.is_complete()
    }
}

pub(crate) fn downcast_object<T: Any + Send + Sync>(
    object: Arc<dyn Any + Send + Sync>,
    key: &Key,
) -> Result<Arc<T>, Fault> {
    object.downcast::<T>().map_err(|_| {
        Fault::new(
            &faults::UNKNOWN_KEY,
            format!("object {} is not a {}", key, type_name::<T>()),
        )
    })
}

// =============================================================================
// Flow instigation
// =============================================================================

/// A flow requested during execution, scheduled once the caller returns.
#[derive(Debug)]
pub(crate) enum FlowRequest {
    /// Runs in the same thread after the instigating node.
    Sequential {
        function: FunctionIndex,
        argument: Argument,
    },
    /// Created but not yet started.
    Spawned(Arc<ThreadState>),
}

/// Flow instigation shared by functions, duties and governance activities.
#[derive(Debug)]
pub(crate) struct Flows<'a> {
    process: &'a Arc<ProcessState>,
    declared: &'a [FlowMetaData],
    requested: Vec<FlowRequest>,
}

impl<'a> Flows<'a> {
    pub fn new(process: &'a Arc<ProcessState>, declared: &'a [FlowMetaData]) -> Self {
        Self {
            process,
            declared,
            requested: Vec::new(),
        }
    }

    pub fn do_flow(&mut self, key: Key, argument: Argument) -> Result<Option<FlowHandle>, Fault> {
        let flow = self
            .declared
            .iter()
            .enumerate()
            .find(|(position, flow)| key.matches(*position, flow.key.as_deref(), &flow.function_name))
            .map(|(_, flow)| flow)
            .ok_or_else(|| Fault::new(&faults::UNKNOWN_KEY, format!("no flow {}", key)))?;

        if flow.spawn_thread {
            let thread = ThreadState::new(self.process.clone(), flow.function, argument);
            self.requested.push(FlowRequest::Spawned(thread.clone()));
            Ok(Some(FlowHandle { thread }))
        } else {
            self.requested.push(FlowRequest::Sequential {
                function: flow.function,
                argument,
            });
            Ok(None)
        }
    }

    pub fn into_requests(self) -> Vec<FlowRequest> {
        self.requested
    }
}

// =============================================================================
// Function Context
// =============================================================================

/// What a function asked for while executing.
#[derive(Debug, Default)]
pub(crate) struct FunctionOutcome {
    pub flows: Vec<FlowRequest>,
    pub joins: Vec<(Arc<ThreadState>, Option<Duration>)>,
    pub next_argument: Option<Argument>,
}

/// Context handed to function logic.
#[derive(Debug)]
pub struct FunctionContext<'a> {
    function: &'a str,
    process: &'a ProcessId,
    argument: Argument,
    objects: &'a [ObjectBinding],
    containers: Vec<Arc<ManagedObjectContainer>>,
    flows: Flows<'a>,
    joins: Vec<(Arc<ThreadState>, Option<Duration>)>,
    next_argument: Option<Argument>,
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(
        function: &'a str,
        process: &'a Arc<ProcessState>,
        argument: Argument,
        objects: &'a [ObjectBinding],
        containers: Vec<Arc<ManagedObjectContainer>>,
        flows: &'a [FlowMetaData],
    ) -> Self {
        Self {
            function,
            process: process.id(),
            argument,
            objects,
            containers,
            flows: Flows::new(process, flows),
            joins: Vec::new(),
            next_argument: None,
        }
    }

    pub fn function_name(&self) -> &str {
        self.function
    }

    pub fn process_id(&self) -> &ProcessId {
        self.process
    }

    pub fn argument(&self) -> &Argument {
        &self.argument
    }

    fn container(&self, key: &Key) -> Result<&Arc<ManagedObjectContainer>, Fault> {
        self.objects
            .iter()
            .zip(&self.containers)
            .enumerate()
            .find(|(position, (binding, _))| key.matches(*position, binding.key.as_deref(), &binding.name))
            .map(|(_, (_, container))| container)
            .ok_or_else(|| {
                Fault::new(
                    &faults::UNKNOWN_KEY,
                    format!("function {} has no object {}", self.function, key),
                )
            })
    }

    /// The managed object bound under `key`.
    pub fn object(&self, key: impl Into<Key>) -> Result<Arc<dyn Any + Send + Sync>, Fault> {
        self.container(&key.into())?.object()
    }

    pub fn object_as<T: Any + Send + Sync>(&self, key: impl Into<Key>) -> Result<Arc<T>, Fault> {
        let key = key.into();
        let object = self.container(&key)?.object()?;
        downcast_object(object, &key)
    }

    /// Instigate a declared flow. Spawned flows return a handle to join on.
    pub fn do_flow(
        &mut self,
        key: impl Into<Key>,
        argument: impl Into<Argument>,
    ) -> Result<Option<FlowHandle>, Fault> {
        self.flows.do_flow(key.into(), argument.into())
    }

    /// Wait for a spawned flow before this thread continues.
    ///
    /// The wait happens after the function returns; exceeding `timeout`
    /// raises [`faults::FLOW_JOIN_TIMED_OUT`].
    pub fn join(&mut self, flow: &FlowHandle, timeout: Option<Duration>) {
        self.joins.push((flow.thread.clone(), timeout));
    }

    /// Argument for the configured next function.
    pub fn set_next_argument(&mut self, argument: impl Into<Argument>) {
        self.next_argument = Some(argument.into());
    }

    /// Declare the object under `key` unusable. Return the fault to escalate it.
    pub fn lost_object(&self, key: impl Into<Key>, cause: Fault) -> Fault {
        match self.container(&key.into()) {
            Ok(container) => container.lost_managed_object(cause),
            Err(fault) => fault.with_cause(cause),
        }
    }

    pub(crate) fn into_outcome(self) -> FunctionOutcome {
        FunctionOutcome {
            flows: self.flows.into_requests(),
            joins: self.joins,
            next_argument: self.next_argument,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_matching() {
        let named = Key::from("db");
        assert!(named.matches(3, Some("db"), "connection"));
        assert!(named.matches(0, None, "db"));
        assert!(!named.matches(0, Some("cache"), "db"));

        let indexed = Key::from(1usize);
        assert!(indexed.matches(1, Some("x"), "y"));
        assert!(!indexed.matches(0, None, "y"));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(Key::from("db").to_string(), "'db'");
        assert_eq!(Key::Indexed(2).to_string(), "#2");
    }

    #[test]
    fn test_argument_accessors() {
        let value: Argument = json!({"id": 1}).into();
        assert_eq!(value.value().unwrap()["id"], 1);
        assert!(value.fault().is_none());

        let fault: Argument = Fault::application("x").into();
        assert_eq!(fault.fault().unwrap().message(), "x");
        assert!(Argument::from(()).is_none());
    }

    #[test]
    fn test_downcast_mismatch_is_unknown_key() {
        let object: Arc<dyn Any + Send + Sync> = Arc::new(1u32);
        assert_eq!(*downcast_object::<u32>(object.clone(), &Key::Indexed(0)).unwrap(), 1);
        let err = downcast_object::<String>(object, &Key::Indexed(0)).unwrap_err();
        assert!(err.is_a(&faults::UNKNOWN_KEY));
    }

    #[test]
    fn test_closures_are_functions() {
        fn assert_function<F: ManagedFunction>(_: &F) {}
        let logic = |ctx: &mut FunctionContext<'_>| -> Result<(), Fault> {
            let _ = ctx.argument();
            Ok(())
        };
        assert_function(&logic);
    }
}
