//! Threads of execution - chains of job nodes run by teams.
//!
//! A thread owns an ordered chain of job nodes. Each time its job is run by
//! a team, the thread executes nodes from the head of the chain until one
//! of the following happens:
//!
//! - the chain is empty (the thread completes)
//! - the next node belongs to another team (the thread is handed over)
//! - a node must wait on an asset (the thread parks on its monitor)
//! - the per-run budget is spent (the thread yields)
//!
//! A parked thread occupies no worker. Its monitor activation re-assigns
//! it to the team it was running on.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use super::administration::AdministrationContext;
use super::asset::{
    collect_activations, ActivatableJobNode, AssetMonitor, AssetRef, WaitDeadline, WaitOutcome,
};
use super::escalation::{EscalationLevel, EscalationScope};
use super::fault::{faults, Fault};
use super::function::{Argument, FlowRequest, Flows, FunctionContext};
use super::governance::{GovernanceContext, GovernanceManager};
use super::lock;
use super::managed_object::{Dependency, ManagedObjectContainer, Readiness};
use super::office::{FunctionIndex, OfficeInner};
use super::process_state::ProcessState;
use super::recovery::with_recovery;
use super::team::{Job, JobState, Team};
use crate::types::{FaultId, ManagedObjectScope, ThreadId};

// =============================================================================
// Job Nodes
// =============================================================================

/// Managed objects of one function invocation, shared by its nodes.
#[derive(Debug)]
struct Invocation {
    function: FunctionIndex,
    /// Set when this invocation handles an escalated fault.
    handled: Option<(FaultId, EscalationLevel)>,
    /// Containers in load order, keyed by office object index.
    objects: OnceLock<Vec<ResolvedObject>>,
}

#[derive(Debug)]
struct ResolvedObject {
    object: usize,
    scope: ManagedObjectScope,
    container: Arc<ManagedObjectContainer>,
}

impl Invocation {
    fn container(&self, object: usize) -> Option<&Arc<ManagedObjectContainer>> {
        self.objects
            .get()?
            .iter()
            .find(|r| r.object == object)
            .map(|r| &r.container)
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if let Some(objects) = self.objects.get() {
            objects
                .iter()
                .filter(|r| r.scope == ManagedObjectScope::Function)
                .for_each(|r| r.container.unload());
        }
    }
}

#[derive(Debug)]
enum NodeKind {
    Function { argument: Argument },
    Duty { index: usize, pre: bool },
    Govern { governance: usize },
    Enforce { governance: usize },
    Disregard { governance: usize },
    Join {
        thread: Arc<ThreadState>,
        timeout: Option<Duration>,
        deadline: Option<Instant>,
    },
}

#[derive(Debug)]
struct JobNode {
    kind: NodeKind,
    team: Arc<dyn Team>,
    invocation: Option<Arc<Invocation>>,
}

/// Nodes for invoking `function`: governance activation, pre duties, the
/// function itself.
fn function_chain(
    office: &OfficeInner,
    governance: &GovernanceManager,
    function: FunctionIndex,
    argument: Argument,
    handled: Option<(FaultId, EscalationLevel)>,
) -> Vec<JobNode> {
    let meta = &office.meta.functions[function];
    let invocation = Arc::new(Invocation {
        function,
        handled,
        objects: OnceLock::new(),
    });

    let mut nodes = Vec::with_capacity(1 + meta.pre_duties.len() + meta.governance.len());
    for &index in meta.governance.iter().filter(|&&g| !governance.is_active(g)) {
        nodes.push(JobNode {
            kind: NodeKind::Govern { governance: index },
            team: office.meta.governance[index]
                .team
                .clone()
                .unwrap_or_else(|| meta.team.clone()),
            invocation: Some(invocation.clone()),
        });
    }
    for (index, duty) in meta.pre_duties.iter().enumerate() {
        nodes.push(JobNode {
            kind: NodeKind::Duty { index, pre: true },
            team: duty.team.clone(),
            invocation: Some(invocation.clone()),
        });
    }
    nodes.push(JobNode {
        kind: NodeKind::Function { argument },
        team: meta.team.clone(),
        invocation: Some(invocation),
    });

    office
        .counters
        .job_nodes_created
        .fetch_add(nodes.len() as u64, Ordering::Relaxed);
    nodes
}

// =============================================================================
// Thread State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Queued,
    Running,
    Waiting,
    Complete,
}

#[derive(Debug)]
struct Schedule {
    status: Status,
    /// An activation arrived while the thread was not parked.
    activation_pending: bool,
    pending_failure: Option<Fault>,
    resume_team: Option<Arc<dyn Team>>,
}

#[derive(Debug, Default)]
struct Execution {
    chain: VecDeque<JobNode>,
    containers: HashMap<usize, Arc<ManagedObjectContainer>>,
    governance: GovernanceManager,
    failure: Option<Fault>,
}

/// Why a run of the thread stopped.
enum Step {
    Complete,
    Yield,
    HandOff(Arc<dyn Team>),
    Blocked(AssetRef),
}

enum NodeResult {
    Done,
    Blocked(AssetRef),
}

pub(crate) struct ThreadState {
    id: ThreadId,
    process: Arc<ProcessState>,
    monitor: Arc<AssetMonitor>,
    /// Team for governance activities with no team of their own.
    home_team: Arc<dyn Team>,
    execution: Mutex<Execution>,
    schedule: Mutex<Schedule>,
    self_ref: Weak<ThreadState>,
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("process", self.process.id())
            .finish()
    }
}

impl ThreadState {
    /// Create a thread for `function`. It does not run until [`Self::start`].
    pub fn new(process: Arc<ProcessState>, function: FunctionIndex, argument: Argument) -> Arc<Self> {
        let office = process.office().clone();
        process.thread_created();

        let id = ThreadId::next();
        let monitor = office.kernel.assets.create_monitor(format!("thread:{}", id), None);
        let governance = GovernanceManager::default();
        let chain = function_chain(&office, &governance, function, argument, None).into();
        let execution = Execution {
            chain,
            governance,
            ..Default::default()
        };
        let home_team = office.meta.functions[function].team.clone();

        Arc::new_cyclic(|weak| Self {
            id,
            process,
            monitor,
            home_team,
            execution: Mutex::new(execution),
            schedule: Mutex::new(Schedule {
                status: Status::Queued,
                activation_pending: false,
                pending_failure: None,
                resume_team: None,
            }),
            self_ref: weak.clone(),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.schedule).status == Status::Complete
    }

    /// Hand the thread to the team of its first job node.
    pub fn start(self: &Arc<Self>) {
        let team = lock(&self.execution)
            .chain
            .front()
            .map(|node| node.team.clone())
            .unwrap_or_else(|| self.home_team.clone());
        tracing::trace!("thread_started: thread={}, team={}", self.id, team.name());
        self.assign(team);
    }

    fn assign(self: &Arc<Self>, team: Arc<dyn Team>) {
        lock(&self.schedule).status = Status::Queued;
        team.clone().assign_job(Arc::new(ThreadJob {
            thread: self.clone(),
            team,
        }));
    }

    /// Complete a spawned thread that will never be started.
    fn abandon(&self) {
        lock(&self.execution).chain.clear();
        self.complete(None);
    }

    fn complete(&self, failure: Option<Fault>) {
        let containers: Vec<_> = lock(&self.execution)
            .containers
            .drain()
            .map(|(_, container)| container)
            .collect();
        for container in containers {
            container.unload();
        }
        for listener in &self.process.office().kernel.thread_listeners {
            listener.thread_complete(self.id);
        }

        lock(&self.schedule).status = Status::Complete;
        let ((), joiners) = collect_activations(|collector| {
            self.monitor.activate_job_nodes(collector, true);
        });
        joiners.activate();

        tracing::debug!(
            "thread_completed: thread={}, process={}, failed={}",
            self.id,
            self.process.id(),
            failure.is_some()
        );
        self.process.thread_completed(failure);
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn execute(
        self: &Arc<Self>,
        team: &Arc<dyn Team>,
        failure: Option<Fault>,
    ) -> (Step, Vec<Arc<ThreadState>>) {
        let office = self.process.office().clone();
        let budget = office.kernel.max_nodes_per_run.max(1);
        let mut spawned = Vec::new();
        let mut exec = lock(&self.execution);

        if let Some(fault) = failure {
            // Delivered by a monitor to the node at the head of the chain
            let origin = exec.chain.pop_front();
            self.escalate(&mut exec, &office, fault, origin.as_ref());
        }

        let mut executed = 0;
        loop {
            let Some(node_team) = exec.chain.front().map(|node| node.team.clone()) else {
                if exec.governance.is_empty() {
                    return (Step::Complete, spawned);
                }
                for governance in exec.governance.active_indices().into_iter().rev() {
                    let node = self.governance_node(&office, NodeKind::Enforce { governance }, governance);
                    exec.chain.push_front(node);
                }
                continue;
            };

            if node_team.name() != team.name() {
                return (Step::HandOff(node_team), spawned);
            }
            if executed >= budget {
                return (Step::Yield, spawned);
            }
            executed += 1;

            let Some(node) = exec.chain.pop_front() else {
                continue;
            };
            if let NodeResult::Blocked(asset) = self.run_node(&mut exec, &office, node, &mut spawned) {
                return (Step::Blocked(asset), spawned);
            }
        }
    }

    fn governance_node(&self, office: &OfficeInner, kind: NodeKind, governance: usize) -> JobNode {
        office
            .counters
            .job_nodes_created
            .fetch_add(1, Ordering::Relaxed);
        JobNode {
            kind,
            team: office.meta.governance[governance]
                .team
                .clone()
                .unwrap_or_else(|| self.home_team.clone()),
            invocation: None,
        }
    }

    fn run_node(
        self: &Arc<Self>,
        exec: &mut Execution,
        office: &OfficeInner,
        mut node: JobNode,
        spawned: &mut Vec<Arc<ThreadState>>,
    ) -> NodeResult {
        let result = match &mut node.kind {
            NodeKind::Function { argument } => {
                let argument = std::mem::take(argument);
                let Some(invocation) = node.invocation.clone() else {
                    return NodeResult::Done;
                };
                match self.ensure_objects(exec, office, &invocation) {
                    Readiness::Ready => {}
                    Readiness::Waiting(asset) => {
                        node.kind = NodeKind::Function { argument };
                        exec.chain.push_front(node);
                        return NodeResult::Blocked(asset);
                    }
                    Readiness::Failed(fault) => {
                        self.escalate(exec, office, fault, Some(&node));
                        return NodeResult::Done;
                    }
                }
                self.run_function(exec, office, &invocation, argument, spawned)
            }
            NodeKind::Duty { index, pre } => {
                let (index, pre) = (*index, *pre);
                let Some(invocation) = node.invocation.clone() else {
                    return NodeResult::Done;
                };
                match self.ensure_objects(exec, office, &invocation) {
                    Readiness::Ready => {}
                    Readiness::Waiting(asset) => {
                        exec.chain.push_front(node);
                        return NodeResult::Blocked(asset);
                    }
                    Readiness::Failed(fault) => {
                        self.escalate(exec, office, fault, Some(&node));
                        return NodeResult::Done;
                    }
                }
                self.run_duty(exec, office, &invocation, index, pre, spawned)
            }
            NodeKind::Govern { governance } => {
                let meta = &office.meta.governance[*governance];
                if exec.governance.activate(*governance, || meta.factory.create_governance()) {
                    tracing::debug!("governance_activated: thread={}, governance={}", self.id, meta.name);
                }
                Ok(())
            }
            NodeKind::Enforce { governance } => {
                let governance = *governance;
                self.run_governance(exec, office, governance, true, spawned)
            }
            NodeKind::Disregard { governance } => {
                let governance = *governance;
                self.run_governance(exec, office, governance, false, spawned)
            }
            NodeKind::Join {
                thread,
                timeout,
                deadline,
            } => {
                let at = match (*deadline, *timeout) {
                    (Some(at), _) => Some(at),
                    (None, Some(timeout)) => Some(Instant::now() + timeout),
                    (None, None) => None,
                };
                *deadline = at;
                let wait = at.map(|at| WaitDeadline {
                    at,
                    fault: Fault::new(
                        &faults::FLOW_JOIN_TIMED_OUT,
                        format!("thread {} not complete within {:?}", thread.id, timeout),
                    ),
                });
                let this: Arc<dyn ActivatableJobNode> = self.clone();
                match thread.monitor.wait_on_asset(this, wait) {
                    WaitOutcome::Proceed => Ok(()),
                    WaitOutcome::Fail(fault) => Err(fault),
                    WaitOutcome::Waiting => {
                        let asset = thread.monitor.asset_ref().clone();
                        exec.chain.push_front(node);
                        return NodeResult::Blocked(asset);
                    }
                }
            }
        };

        if let Err(fault) = result {
            self.escalate(exec, office, fault, Some(&node));
        }
        NodeResult::Done
    }

    /// Resolve and make ready the invocation's managed objects.
    fn ensure_objects(
        self: &Arc<Self>,
        exec: &mut Execution,
        office: &OfficeInner,
        invocation: &Invocation,
    ) -> Readiness {
        let objects = invocation
            .objects
            .get_or_init(|| self.resolve_objects(exec, office, invocation.function));
        let node: Arc<dyn ActivatableJobNode> = self.clone();
        for resolved in objects {
            match resolved.container.check_ready(&node) {
                Readiness::Ready => continue,
                other => return other,
            }
        }
        Readiness::Ready
    }

    fn resolve_objects(
        &self,
        exec: &mut Execution,
        office: &OfficeInner,
        function: FunctionIndex,
    ) -> Vec<ResolvedObject> {
        let meta = &office.meta.functions[function];
        let mut resolved: Vec<ResolvedObject> = Vec::with_capacity(meta.load_order.len());
        for &object in &meta.load_order {
            let object_meta = &office.meta.objects[object];
            let dependencies = object_meta
                .dependencies
                .iter()
                .filter_map(|d| {
                    resolved.iter().find(|r| r.object == d.object).map(|r| Dependency {
                        key: d.key.clone(),
                        object: d.name.clone(),
                        container: r.container.clone(),
                    })
                })
                .collect();
            let create = || {
                ManagedObjectContainer::new(
                    object_meta.name.clone(),
                    object_meta.binding.clone(),
                    dependencies,
                    &office.kernel.assets,
                )
            };
            let container = match object_meta.scope {
                ManagedObjectScope::Function => create(),
                ManagedObjectScope::Thread => exec.containers.entry(object).or_insert_with(create).clone(),
                ManagedObjectScope::Process => self.process.container(object, create),
            };
            resolved.push(ResolvedObject {
                object,
                scope: object_meta.scope,
                container,
            });
        }
        resolved
    }

    fn run_function(
        &self,
        exec: &mut Execution,
        office: &OfficeInner,
        invocation: &Arc<Invocation>,
        argument: Argument,
        spawned: &mut Vec<Arc<ThreadState>>,
    ) -> Result<(), Fault> {
        let meta = &office.meta.functions[invocation.function];
        let containers: Vec<_> = meta
            .objects
            .iter()
            .filter_map(|binding| invocation.container(binding.object).cloned())
            .collect();

        let mut requests = Vec::new();
        if let Err(fault) = self.govern_objects(exec, office, &containers, &mut requests) {
            abandon_spawned(requests);
            return Err(fault);
        }

        let mut context = FunctionContext::new(
            &meta.name,
            &self.process,
            argument,
            &meta.objects,
            containers,
            &meta.flows,
        );
        let result = with_recovery(|| meta.logic.execute(&mut context), &meta.name);
        let outcome = context.into_outcome();
        requests.extend(outcome.flows);

        if let Err(fault) = result {
            abandon_spawned(requests);
            return Err(fault);
        }

        let mut follow = Vec::new();
        for (thread, timeout) in outcome.joins {
            follow.push(JobNode {
                kind: NodeKind::Join {
                    thread,
                    timeout,
                    deadline: None,
                },
                team: meta.team.clone(),
                invocation: Some(invocation.clone()),
            });
        }
        for (index, duty) in meta.post_duties.iter().enumerate() {
            follow.push(JobNode {
                kind: NodeKind::Duty { index, pre: false },
                team: duty.team.clone(),
                invocation: Some(invocation.clone()),
            });
        }
        office
            .counters
            .job_nodes_created
            .fetch_add(follow.len() as u64, Ordering::Relaxed);
        self.schedule_requests(exec, office, requests, &mut follow, spawned);
        if let Some(next) = meta.next {
            let argument = outcome.next_argument.unwrap_or_default();
            follow.extend(function_chain(office, &exec.governance, next, argument, None));
        }
        splice(exec, follow);
        Ok(())
    }

    /// Hand newly used objects to active governance providing their extension.
    fn govern_objects(
        &self,
        exec: &mut Execution,
        office: &OfficeInner,
        containers: &[Arc<ManagedObjectContainer>],
        requests: &mut Vec<FlowRequest>,
    ) -> Result<(), Fault> {
        for governance in exec.governance.active_indices() {
            let meta = &office.meta.governance[governance];
            for container in containers {
                let (Some(extension), Some(instance)) =
                    (container.extension(&meta.extension), container.instance_id())
                else {
                    continue;
                };
                let Some(active) = exec.governance.ungoverned(governance, instance) else {
                    continue;
                };
                let mut context = GovernanceContext::new(&meta.name, Flows::new(&self.process, &meta.flows));
                let result = with_recovery(
                    || active.governance.govern_managed_object(extension, &mut context),
                    &meta.name,
                );
                // The caller abandons these if anything failed
                requests.extend(context.into_requests());
                result?;
                tracing::trace!(
                    "managed_object_governed: thread={}, governance={}, object={}",
                    self.id,
                    meta.name,
                    container.name()
                );
            }
        }
        Ok(())
    }

    fn run_duty(
        &self,
        exec: &mut Execution,
        office: &OfficeInner,
        invocation: &Invocation,
        index: usize,
        pre: bool,
        spawned: &mut Vec<Arc<ThreadState>>,
    ) -> Result<(), Fault> {
        let meta = &office.meta.functions[invocation.function];
        let duty = if pre {
            &meta.pre_duties[index]
        } else {
            &meta.post_duties[index]
        };
        let extensions: Vec<_> = duty
            .objects
            .iter()
            .filter_map(|&object| invocation.container(object))
            .filter_map(|container| container.extension(&duty.extension))
            .collect();

        let mut context =
            AdministrationContext::new(&duty.name, &meta.name, Flows::new(&self.process, &duty.flows));
        let result = with_recovery(
            || duty.administration.administer(&extensions, &mut context),
            &duty.name,
        );
        let requests = context.into_requests();
        if let Err(fault) = result {
            abandon_spawned(requests);
            return Err(fault);
        }

        let mut follow = Vec::new();
        self.schedule_requests(exec, office, requests, &mut follow, spawned);
        splice(exec, follow);
        Ok(())
    }

    fn run_governance(
        &self,
        exec: &mut Execution,
        office: &OfficeInner,
        governance: usize,
        enforce: bool,
        spawned: &mut Vec<Arc<ThreadState>>,
    ) -> Result<(), Fault> {
        let Some(mut active) = exec.governance.take(governance) else {
            return Ok(());
        };
        let meta = &office.meta.governance[governance];
        let mut context = GovernanceContext::new(&meta.name, Flows::new(&self.process, &meta.flows));
        let result = if enforce {
            with_recovery(|| active.governance.enforce_governance(&mut context), &meta.name)
        } else {
            with_recovery(|| active.governance.disregard_governance(&mut context), &meta.name)
        };
        tracing::debug!(
            "governance_deactivated: thread={}, governance={}, enforced={}",
            self.id,
            meta.name,
            enforce
        );
        let requests = context.into_requests();
        if let Err(fault) = result {
            abandon_spawned(requests);
            return Err(fault);
        }

        let mut follow = Vec::new();
        self.schedule_requests(exec, office, requests, &mut follow, spawned);
        splice(exec, follow);
        Ok(())
    }

    /// Turn flow requests into job nodes and threads to start.
    fn schedule_requests(
        &self,
        exec: &Execution,
        office: &OfficeInner,
        requests: Vec<FlowRequest>,
        follow: &mut Vec<JobNode>,
        spawned: &mut Vec<Arc<ThreadState>>,
    ) {
        for request in requests {
            match request {
                FlowRequest::Sequential { function, argument } => {
                    follow.extend(function_chain(office, &exec.governance, function, argument, None));
                }
                FlowRequest::Spawned(thread) => spawned.push(thread),
            }
        }
    }

    // =========================================================================
    // Escalation
    // =========================================================================

    /// Escalate `fault` raised by `origin`, replacing the rest of the chain.
    fn escalate(&self, exec: &mut Execution, office: &OfficeInner, fault: Fault, origin: Option<&JobNode>) {
        let invocation = origin.and_then(|node| node.invocation.as_deref());
        let function = invocation.map(|inv| &office.meta.functions[inv.function]);
        let hook = origin.and_then(|node| match &node.kind {
            NodeKind::Duty { index, pre } => function.map(|meta| {
                let duties = if *pre { &meta.pre_duties } else { &meta.post_duties };
                &duties[*index].escalation
            }),
            NodeKind::Govern { governance }
            | NodeKind::Enforce { governance }
            | NodeKind::Disregard { governance } => Some(&office.meta.governance[*governance].escalation),
            _ => None,
        });
        let scope = EscalationScope {
            hook,
            function: function.map(|meta| &meta.escalation),
            office: &office.meta.escalation,
        };

        // A handler re-raising its own fault continues outward
        let from = match invocation.and_then(|inv| inv.handled) {
            Some((id, level)) if id == fault.id() => level.outer(),
            _ => Some(EscalationLevel::Hook),
        };
        let handler = from.and_then(|from| scope.find(&fault, from));

        exec.chain.clear();
        let mut follow: Vec<JobNode> = exec
            .governance
            .active_indices()
            .into_iter()
            .map(|governance| self.governance_node(office, NodeKind::Disregard { governance }, governance))
            .collect();

        match handler {
            Some((handler, level)) => {
                tracing::debug!(
                    "fault_escalated: thread={}, fault={}, level={:?}, handler={}",
                    self.id,
                    fault.kind().name(),
                    level,
                    office.meta.functions[handler].name
                );
                // Governance is disregarded before the handler runs, so it
                // activates its own afresh
                let id = fault.id();
                follow.extend(function_chain(
                    office,
                    &GovernanceManager::default(),
                    handler,
                    Argument::Fault(fault),
                    Some((id, level)),
                ));
            }
            None => {
                office
                    .kernel
                    .escalation_handler
                    .handle_escalation(self.process.id(), &fault);
                exec.failure.get_or_insert(fault);
            }
        }
        splice(exec, follow);
    }
}

/// Complete spawned threads of a failed node; they never start.
fn abandon_spawned(requests: Vec<FlowRequest>) {
    for request in requests {
        if let FlowRequest::Spawned(child) = request {
            child.abandon();
        }
    }
}

/// Insert `nodes` at the head of the chain, keeping their order.
fn splice(exec: &mut Execution, nodes: Vec<JobNode>) {
    for node in nodes.into_iter().rev() {
        exec.chain.push_front(node);
    }
}

impl ActivatableJobNode for ThreadState {
    fn activate(&self, failure: Option<Fault>) {
        let resume = {
            let mut schedule = lock(&self.schedule);
            if let Some(fault) = failure {
                schedule.pending_failure.get_or_insert(fault);
            }
            match schedule.status {
                Status::Waiting => {
                    schedule.status = Status::Queued;
                    schedule.resume_team.take()
                }
                Status::Running | Status::Queued => {
                    schedule.activation_pending = true;
                    None
                }
                Status::Complete => None,
            }
        };
        if let (Some(team), Some(thread)) = (resume, self.self_ref.upgrade()) {
            tracing::trace!("thread_activated: thread={}, team={}", self.id, team.name());
            thread.assign(team);
        }
    }
}

// =============================================================================
// Thread Job
// =============================================================================

/// A thread's presence on one team.
struct ThreadJob {
    thread: Arc<ThreadState>,
    team: Arc<dyn Team>,
}

impl fmt::Debug for ThreadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadJob")
            .field("thread", &self.thread.id)
            .field("team", &self.team.name())
            .finish()
    }
}

impl Job for ThreadJob {
    fn run(&self) -> JobState {
        let thread = &self.thread;
        let failure = {
            let mut schedule = lock(&thread.schedule);
            if schedule.status == Status::Complete {
                return JobState::Complete;
            }
            schedule.status = Status::Running;
            schedule.activation_pending = false;
            schedule.pending_failure.take()
        };

        let (step, spawned) = thread.execute(&self.team, failure);
        for child in spawned {
            child.start();
        }

        match step {
            Step::Complete => {
                let failure = lock(&thread.execution).failure.take();
                thread.complete(failure);
                JobState::Complete
            }
            Step::Yield => {
                lock(&thread.schedule).status = Status::Queued;
                JobState::Pending
            }
            Step::HandOff(team) => {
                tracing::trace!(
                    "thread_handed_off: thread={}, from={}, to={}",
                    thread.id,
                    self.team.name(),
                    team.name()
                );
                thread.assign(team);
                JobState::Complete
            }
            Step::Blocked(asset) => {
                let mut schedule = lock(&thread.schedule);
                if schedule.activation_pending {
                    schedule.status = Status::Queued;
                    schedule.activation_pending = false;
                    JobState::Pending
                } else {
                    schedule.status = Status::Waiting;
                    schedule.resume_team = Some(self.team.clone());
                    JobState::Blocked(asset)
                }
            }
        }
    }
}
