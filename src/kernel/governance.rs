//! Governance - oversight of managed objects exposing an extension.
//!
//! Governance becomes active on a thread of execution before the first
//! function requiring it. While active, every managed object a function
//! uses that provides the governance's extension is handed to it once.
//! Active governance is enforced when the thread completes, or disregarded
//! when a fault is escalated. Each of those activities is a job node of its
//! own, with the governance's flows and escalation procedure.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::fault::Fault;
use super::function::{Argument, FlowHandle, FlowRequest, Flows, Key};
use crate::types::InstanceId;

/// A single activation of governance on a thread.
pub trait Governance: Send + fmt::Debug {
    /// Take a managed object's extension under governance.
    fn govern_managed_object(
        &mut self,
        extension: Arc<dyn Any + Send + Sync>,
        context: &mut GovernanceContext<'_>,
    ) -> Result<(), Fault>;

    /// Apply the governance (e.g. commit).
    fn enforce_governance(&mut self, context: &mut GovernanceContext<'_>) -> Result<(), Fault>;

    /// Abandon the governance (e.g. roll back).
    fn disregard_governance(&mut self, context: &mut GovernanceContext<'_>) -> Result<(), Fault>;
}

/// Creates a governance activation each time a thread requires it.
pub trait GovernanceFactory: Send + Sync + fmt::Debug {
    fn create_governance(&self) -> Box<dyn Governance>;
}

/// Context handed to governance activities.
#[derive(Debug)]
pub struct GovernanceContext<'a> {
    name: &'a str,
    flows: Flows<'a>,
}

impl<'a> GovernanceContext<'a> {
    pub(crate) fn new(name: &'a str, flows: Flows<'a>) -> Self {
        Self { name, flows }
    }

    pub fn governance_name(&self) -> &str {
        self.name
    }

    pub fn do_flow(
        &mut self,
        key: impl Into<Key>,
        argument: impl Into<Argument>,
    ) -> Result<Option<FlowHandle>, Fault> {
        self.flows.do_flow(key.into(), argument.into())
    }

    pub(crate) fn into_requests(self) -> Vec<FlowRequest> {
        self.flows.into_requests()
    }
}

// =============================================================================
// Governance Manager
// =============================================================================

/// Governance active on one thread of execution.
#[derive(Debug)]
pub(crate) struct ActiveGovernance {
    pub index: usize,
    pub governance: Box<dyn Governance>,
    governed: HashSet<InstanceId>,
}

/// Per-thread registry of active governance, in activation order.
#[derive(Debug, Default)]
pub(crate) struct GovernanceManager {
    active: Vec<ActiveGovernance>,
}

impl GovernanceManager {
    pub fn is_active(&self, index: usize) -> bool {
        self.active.iter().any(|a| a.index == index)
    }

    /// Activate governance `index`. Returns false if already active.
    pub fn activate(&mut self, index: usize, create: impl FnOnce() -> Box<dyn Governance>) -> bool {
        if self.is_active(index) {
            return false;
        }
        self.active.push(ActiveGovernance {
            index,
            governance: create(),
            governed: HashSet::new(),
        });
        true
    }

    /// Deactivate governance `index`, handing back the activation.
    pub fn take(&mut self, index: usize) -> Option<ActiveGovernance> {
        let position = self.active.iter().position(|a| a.index == index)?;
        Some(self.active.remove(position))
    }

    /// Indices of active governance, in activation order.
    pub fn active_indices(&self) -> Vec<usize> {
        self.active.iter().map(|a| a.index).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// The activation of `index` if `instance` has not yet been governed by it.
    pub fn ungoverned(&mut self, index: usize, instance: InstanceId) -> Option<&mut ActiveGovernance> {
        let active = self.active.iter_mut().find(|a| a.index == index)?;
        if active.governed.insert(instance) {
            Some(active)
        } else {
            None
        }
    }
}
