//! Offices - named groups of functions, managed objects and governance.
//!
//! All metadata is resolved by [`crate::kernel::KernelBuilder`]; references
//! between functions, objects and governance are indices into the office's
//! tables, so the run-time never looks anything up by name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::administration::Administration;
use super::escalation::EscalationProcedure;
use super::function::{Argument, ManagedFunction};
use super::governance::GovernanceFactory;
use super::managed_object::ManagedObjectSourceBinding;
use super::process_state::{ProcessHandle, ProcessState};
use super::team::Team;
use super::thread_state::ThreadState;
use super::KernelContext;
use crate::types::{Error, ManagedObjectScope, Result};

pub(crate) type FunctionIndex = usize;

/// Object used by a function, duty or coordinating object.
#[derive(Debug, Clone)]
pub(crate) struct ObjectBinding {
    pub key: Option<String>,
    /// Index into the office's managed objects.
    pub object: usize,
    pub name: String,
}

#[derive(Debug, Clone)]
pub(crate) struct FlowMetaData {
    pub key: Option<String>,
    pub function: FunctionIndex,
    pub function_name: String,
    pub spawn_thread: bool,
}

#[derive(Debug)]
pub(crate) struct ManagedObjectMetaData {
    pub name: String,
    pub binding: Arc<ManagedObjectSourceBinding>,
    pub scope: ManagedObjectScope,
    pub dependencies: Vec<ObjectBinding>,
}

pub(crate) struct FunctionMetaData {
    pub name: String,
    pub logic: Arc<dyn ManagedFunction>,
    pub team: Arc<dyn Team>,
    pub objects: Vec<ObjectBinding>,
    /// Objects to make ready, dependencies before dependents.
    pub load_order: Vec<usize>,
    pub flows: Vec<FlowMetaData>,
    pub next: Option<FunctionIndex>,
    pub escalation: EscalationProcedure<FunctionIndex>,
    pub governance: Vec<usize>,
    pub pre_duties: Vec<DutyMetaData>,
    pub post_duties: Vec<DutyMetaData>,
}

impl fmt::Debug for FunctionMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionMetaData")
            .field("name", &self.name)
            .field("team", &self.team.name())
            .field("objects", &self.objects)
            .field("load_order", &self.load_order)
            .field("next", &self.next)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct DutyMetaData {
    pub name: String,
    pub administration: Arc<dyn Administration>,
    pub extension: String,
    /// Indices into the office's managed objects.
    pub objects: Vec<usize>,
    pub team: Arc<dyn Team>,
    pub flows: Vec<FlowMetaData>,
    pub escalation: EscalationProcedure<FunctionIndex>,
}

#[derive(Debug)]
pub(crate) struct GovernanceMetaData {
    pub name: String,
    pub factory: Arc<dyn GovernanceFactory>,
    pub extension: String,
    pub team: Option<Arc<dyn Team>>,
    pub flows: Vec<FlowMetaData>,
    pub escalation: EscalationProcedure<FunctionIndex>,
}

#[derive(Debug)]
pub(crate) struct OfficeMetaData {
    pub name: String,
    pub functions: Vec<FunctionMetaData>,
    pub function_index: HashMap<String, FunctionIndex>,
    pub objects: Vec<ManagedObjectMetaData>,
    pub governance: Vec<GovernanceMetaData>,
    pub escalation: EscalationProcedure<FunctionIndex>,
}

#[derive(Debug, Default)]
pub(crate) struct OfficeCounters {
    pub processes_started: AtomicU64,
    pub processes_completed: AtomicU64,
    pub processes_failed: AtomicU64,
    pub threads_started: AtomicU64,
    pub job_nodes_created: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct OfficeInner {
    pub meta: OfficeMetaData,
    pub kernel: Arc<KernelContext>,
    pub counters: OfficeCounters,
}

/// Management snapshot of an office.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficeStatus {
    pub name: String,
    pub functions: usize,
    pub managed_objects: usize,
    pub processes_started: u64,
    pub processes_completed: u64,
    pub processes_failed: u64,
    pub processes_active: u64,
    pub threads_started: u64,
    pub job_nodes_created: u64,
}

/// Handle on an office of an open kernel.
#[derive(Debug, Clone)]
pub struct Office {
    inner: Arc<OfficeInner>,
}

impl Office {
    pub(crate) fn new(meta: OfficeMetaData, kernel: Arc<KernelContext>) -> Self {
        Self {
            inner: Arc::new(OfficeInner {
                meta,
                kernel,
                counters: OfficeCounters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.meta.name
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.inner.meta.functions.iter().map(|f| f.name.as_str()).collect()
    }

    /// Start a new unit of work with `function`.
    pub fn invoke_function(&self, function: &str, argument: impl Into<Argument>) -> Result<ProcessHandle> {
        if !self.inner.kernel.is_open() {
            return Err(Error::state_transition(format!(
                "office {} is not open",
                self.name()
            )));
        }
        let index = *self.inner.meta.function_index.get(function).ok_or_else(|| {
            Error::not_found(format!("function {} in office {}", function, self.name()))
        })?;

        let process = ProcessState::new(self.inner.clone());
        let handle = process.handle();
        tracing::debug!(
            "process_started: office={}, function={}, process={}",
            self.name(),
            function,
            process.id()
        );
        ThreadState::new(process, index, argument.into()).start();
        Ok(handle)
    }

    #[cfg(test)]
    pub(crate) fn load_order(&self, function: &str) -> Option<Vec<usize>> {
        let index = *self.inner.meta.function_index.get(function)?;
        Some(self.inner.meta.functions[index].load_order.clone())
    }

    pub fn status(&self) -> OfficeStatus {
        let counters = &self.inner.counters;
        let started = counters.processes_started.load(Ordering::Relaxed);
        let completed = counters.processes_completed.load(Ordering::Relaxed);
        let failed = counters.processes_failed.load(Ordering::Relaxed);
        OfficeStatus {
            name: self.inner.meta.name.clone(),
            functions: self.inner.meta.functions.len(),
            managed_objects: self.inner.meta.objects.len(),
            processes_started: started,
            processes_completed: completed,
            processes_failed: failed,
            processes_active: started.saturating_sub(completed + failed),
            threads_started: counters.threads_started.load(Ordering::Relaxed),
            job_nodes_created: counters.job_nodes_created.load(Ordering::Relaxed),
        }
    }
}
