//! Administration - duties run before or after a specific function.
//!
//! A duty receives the extensions of the function's managed objects it
//! administers. Duties run as job nodes spliced around the function; a
//! function without duties gets none.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::fault::Fault;
use super::function::{Argument, FlowHandle, FlowRequest, Flows, Key};

/// Logic of a duty.
pub trait Administration: Send + Sync + fmt::Debug {
    fn administer(
        &self,
        extensions: &[Arc<dyn Any + Send + Sync>],
        context: &mut AdministrationContext<'_>,
    ) -> Result<(), Fault>;
}

/// Context handed to a duty.
#[derive(Debug)]
pub struct AdministrationContext<'a> {
    duty: &'a str,
    function: &'a str,
    flows: Flows<'a>,
}

impl<'a> AdministrationContext<'a> {
    pub(crate) fn new(duty: &'a str, function: &'a str, flows: Flows<'a>) -> Self {
        Self {
            duty,
            function,
            flows,
        }
    }

    pub fn duty_name(&self) -> &str {
        self.duty
    }

    /// The function the duty is attached to.
    pub fn function_name(&self) -> &str {
        self.function
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

/// Duty backed by a closure.
pub struct FnAdministration<F> {
    logic: F,
}

impl<F> FnAdministration<F>
where
    F: Fn(&[Arc<dyn Any + Send + Sync>], &mut AdministrationContext<'_>) -> Result<(), Fault>
        + Send
        + Sync,
{
    pub fn new(logic: F) -> Self {
        Self { logic }
    }
}

impl<F> fmt::Debug for FnAdministration<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnAdministration")
    }
}

impl<F> Administration for FnAdministration<F>
where
    F: Fn(&[Arc<dyn Any + Send + Sync>], &mut AdministrationContext<'_>) -> Result<(), Fault>
        + Send
        + Sync,
{
    fn administer(
        &self,
        extensions: &[Arc<dyn Any + Send + Sync>],
        context: &mut AdministrationContext<'_>,
    ) -> Result<(), Fault> {
        (self.logic)(extensions, context)
    }
}
