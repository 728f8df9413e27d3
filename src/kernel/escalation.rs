//! Escalation procedures - ordered fault-to-handler tables.
//!
//! A fault raised by a job node is matched against the procedures enclosing
//! it, innermost first:
//!
//! ```text
//!   hook (duty / governance)  →  function  →  office  →  kernel handler
//! ```
//!
//! Within one procedure the first entry whose declared type is the fault's
//! type or a supertype of it wins. A handler re-raising the fault it was
//! given resumes matching at the next outer level, never its own.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::fault::{Fault, FaultType, FaultTypeRegistry};
use crate::types::{EscalationConfig, Error, ProcessId, Result};

/// Scope level an escalation procedure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EscalationLevel {
    /// Duty or governance activity.
    Hook,
    Function,
    Office,
    /// Global kernel handler.
    Kernel,
}

impl EscalationLevel {
    /// The level matching resumes at when a handler at this level re-raises.
    pub fn outer(self) -> Option<EscalationLevel> {
        match self {
            EscalationLevel::Hook => Some(EscalationLevel::Function),
            EscalationLevel::Function => Some(EscalationLevel::Office),
            EscalationLevel::Office => Some(EscalationLevel::Kernel),
            EscalationLevel::Kernel => None,
        }
    }
}

/// Single entry: faults of `fault_type` (or subtypes) go to `handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationFlow<H> {
    pub fault_type: &'static FaultType,
    pub handler: H,
}

/// Ordered escalation table.
///
/// Generic over the handler reference so offices can store function indices
/// while tests use plain names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationProcedure<H> {
    flows: Vec<EscalationFlow<H>>,
}

impl<H> Default for EscalationProcedure<H> {
    fn default() -> Self {
        Self { flows: Vec::new() }
    }
}

impl<H> EscalationProcedure<H> {
    pub fn new(flows: Vec<EscalationFlow<H>>) -> Self {
        Self { flows }
    }

    /// Resolve configured entries, failing fast on a malformed entry.
    pub fn resolve(
        configs: &[EscalationConfig],
        fault_types: &FaultTypeRegistry,
        mut resolve_handler: impl FnMut(&str) -> Option<H>,
    ) -> Result<Self> {
        let mut flows = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            let fault_type = fault_types.resolve(&config.fault_type).map_err(|e| {
                Error::configuration(format!("escalation {}: {}", index, e))
            })?;
            if config.function.trim().is_empty() {
                return Err(Error::configuration(format!(
                    "escalation {} for {} has no handling function",
                    index, config.fault_type
                )));
            }
            let handler = resolve_handler(&config.function).ok_or_else(|| {
                Error::configuration(format!(
                    "escalation {} for {} refers to unknown function {}",
                    index, config.fault_type, config.function
                ))
            })?;
            flows.push(EscalationFlow { fault_type, handler });
        }
        Ok(Self { flows })
    }

    /// First entry whose declared type the fault is, in declaration order.
    pub fn get_escalation(&self, fault: &Fault) -> Option<&EscalationFlow<H>> {
        self.flows.iter().find(|flow| fault.is_a(flow.fault_type))
    }

    pub fn flows(&self) -> &[EscalationFlow<H>] {
        &self.flows
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Procedures enclosing a job node, innermost first.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EscalationScope<'a, H> {
    pub hook: Option<&'a EscalationProcedure<H>>,
    pub function: Option<&'a EscalationProcedure<H>>,
    pub office: &'a EscalationProcedure<H>,
}

impl<H: Copy> EscalationScope<'_, H> {
    /// Find a handler for `fault`, starting at `from` and moving outward.
    pub fn find(&self, fault: &Fault, from: EscalationLevel) -> Option<(H, EscalationLevel)> {
        let levels = [
            (EscalationLevel::Hook, self.hook),
            (EscalationLevel::Function, self.function),
            (EscalationLevel::Office, Some(self.office)),
        ];
        levels
            .into_iter()
            .filter(|(level, _)| *level >= from)
            .find_map(|(level, procedure)| {
                procedure
                    .and_then(|p| p.get_escalation(fault))
                    .map(|flow| (flow.handler, level))
            })
    }
}

// =============================================================================
// Kernel Handler
// =============================================================================

/// Receives faults no procedure handled. The unit of work then fails.
pub trait EscalationHandler: Send + Sync + fmt::Debug {
    fn handle_escalation(&self, process: &ProcessId, fault: &Fault);
}

/// Default kernel handler: logs the fault and its cause chain.
#[derive(Debug, Default)]
pub struct LoggingEscalationHandler;

impl EscalationHandler for LoggingEscalationHandler {
    fn handle_escalation(&self, process: &ProcessId, fault: &Fault) {
        tracing::error!(
            "unhandled_escalation: process={}, fault={}, kind={}, root_cause={}",
            process,
            fault.id(),
            fault.kind(),
            fault.root_cause()
        );
    }
}
