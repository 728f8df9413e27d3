//! Shared fixtures for kernel integration tests.

#![allow(dead_code)]

use floor_kernel::kernel::{
    EscalationHandler, Fault, ManagedObjectInstance, ManagedObjectSource, ManagedObjectUser,
};
use floor_kernel::types::{KernelConfig, ProcessId};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Parse a kernel configuration from a JSON literal.
pub fn config(value: serde_json::Value) -> KernelConfig {
    serde_json::from_value(value).unwrap()
}

/// Assets section that leaves sweeping to the test.
pub fn manual_assets() -> serde_json::Value {
    serde_json::json!({ "check_interval": "10ms", "monitor_on_open": false, "max_nodes_per_run": 64 })
}

/// Shared ordered record of what ran.
#[derive(Debug, Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Kernel handler remembering the type of every unhandled fault.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    faults: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn faults(&self) -> Vec<String> {
        self.faults.lock().unwrap().clone()
    }
}

impl EscalationHandler for RecordingHandler {
    fn handle_escalation(&self, _process: &ProcessId, fault: &Fault) {
        self.faults.lock().unwrap().push(fault.kind().name().to_string());
    }
}

/// Source that holds every request until the test delivers.
#[derive(Default)]
pub struct DeferredSource {
    pending: Mutex<Vec<Arc<dyn ManagedObjectUser>>>,
}

impl fmt::Debug for DeferredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredSource")
            .field("pending", &self.pending.lock().unwrap().len())
            .finish()
    }
}

impl DeferredSource {
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn deliver(&self, value: u32) {
        let users: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for user in users {
            user.set_managed_object(ManagedObjectInstance::from_value(value));
        }
    }
}

impl ManagedObjectSource for DeferredSource {
    fn source_managed_object(&self, user: Arc<dyn ManagedObjectUser>) {
        self.pending.lock().unwrap().push(user);
    }
}
