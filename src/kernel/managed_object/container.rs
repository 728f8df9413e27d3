//! Per-use managed object container.
//!
//! Lock order is always container → asset monitor → pool. Job nodes are
//! registered on the monitor while the container lock is held, so a
//! sourcing callback racing with registration can never be missed; they
//! are activated only after both locks are released.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use super::{ManagedObjectInstance, ManagedObjectSourceBinding, ManagedObjectUser};
use crate::kernel::asset::{
    collect_activations, ActivatableJobNode, Asset, AssetManager, AssetMonitor, AssetRef,
    CheckAssetContext, WaitOutcome,
};
use crate::kernel::fault::{faults, Fault};
use crate::kernel::function::{downcast_object, Key};
use crate::kernel::lock;
use crate::kernel::recovery::with_recovery;
use crate::types::InstanceId;

/// Externally visible lifecycle phase of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerPhase {
    Unsourced,
    Sourcing,
    Ready,
    InUse,
    Returned,
    Lost,
    Failed,
}

enum State {
    Unsourced,
    Sourcing {
        started: Instant,
    },
    Available {
        instance: ManagedObjectInstance,
        loaded: bool,
        in_use: bool,
        operation: Option<Instant>,
    },
    Returned,
    Lost(Fault),
    Failed(Fault),
}

/// Readiness of a container for the job node asking.
#[derive(Debug)]
pub(crate) enum Readiness {
    Ready,
    /// The node is registered on the container's monitor.
    Waiting(AssetRef),
    Failed(Fault),
}

/// A dependency of a coordinating managed object.
#[derive(Debug, Clone)]
pub(crate) struct Dependency {
    pub key: Option<String>,
    pub object: String,
    pub container: Arc<ManagedObjectContainer>,
}

pub(crate) struct ManagedObjectContainer {
    name: String,
    binding: Arc<ManagedObjectSourceBinding>,
    monitor: Arc<AssetMonitor>,
    dependencies: Vec<Dependency>,
    state: Mutex<State>,
    self_ref: Weak<ManagedObjectContainer>,
}

impl fmt::Debug for ManagedObjectContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectContainer")
            .field("name", &self.name)
            .field("source", &self.binding.name)
            .field("phase", &self.phase())
            .finish()
    }
}

impl ManagedObjectContainer {
    pub fn new(
        name: impl Into<String>,
        binding: Arc<ManagedObjectSourceBinding>,
        dependencies: Vec<Dependency>,
        assets: &AssetManager,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let asset: Weak<dyn Asset> = weak.clone();
            let monitor = assets.create_monitor(format!("managed-object:{}", name), Some(asset));
            Self {
                name,
                binding,
                monitor,
                dependencies,
                state: Mutex::new(State::Unsourced),
                self_ref: weak.clone(),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> ContainerPhase {
        match &*lock(&self.state) {
            State::Unsourced => ContainerPhase::Unsourced,
            State::Sourcing { .. } => ContainerPhase::Sourcing,
            State::Available { in_use: false, .. } => ContainerPhase::Ready,
            State::Available { in_use: true, .. } => ContainerPhase::InUse,
            State::Returned => ContainerPhase::Returned,
            State::Lost(_) => ContainerPhase::Lost,
            State::Failed(_) => ContainerPhase::Failed,
        }
    }

    /// Begin sourcing if needed, and report whether `node` may proceed.
    ///
    /// When not ready, `node` is registered and will be activated (or failed)
    /// by the container's monitor.
    pub fn check_ready(&self, node: &Arc<dyn ActivatableJobNode>) -> Readiness {
        let trigger = {
            let mut state = lock(&self.state);
            if matches!(*state, State::Unsourced) {
                *state = State::Sourcing {
                    started: Instant::now(),
                };
                true
            } else {
                false
            }
        };

        if trigger {
            tracing::debug!(
                "managed_object_sourcing: object={}, source={}",
                self.name,
                self.binding.name
            );
            self.binding.source_managed_object(Arc::new(ContainerUser {
                container: self.self_ref.clone(),
                binding: self.binding.clone(),
            }));
        }

        let (readiness, activations) = collect_activations(|collector| {
            let mut state = lock(&self.state);
            match &mut *state {
                State::Unsourced | State::Sourcing { .. } | State::Available { operation: Some(_), .. } => {
                    self.register(node)
                }
                State::Available {
                    instance,
                    loaded,
                    ..
                } => {
                    if *loaded {
                        return Readiness::Ready;
                    }
                    let registry = ObjectRegistry {
                        dependencies: &self.dependencies,
                    };
                    let object = instance.managed_object().clone();
                    match with_recovery(|| object.load_objects(&registry), &self.name) {
                        Ok(()) => {
                            *loaded = true;
                            Readiness::Ready
                        }
                        Err(cause) => {
                            let fault = Fault::new(
                                &faults::FAILED_TO_SOURCE_MANAGED_OBJECT,
                                format!("managed object {} failed to load its dependencies", self.name),
                            )
                            .with_cause(cause);
                            let previous = std::mem::replace(&mut *state, State::Failed(fault.clone()));
                            if let State::Available { instance, .. } = previous {
                                // Still checked out of the pool; give it back
                                self.binding.return_managed_object(instance);
                            }
                            self.monitor.fail_job_nodes(fault.clone(), collector, true);
                            Readiness::Failed(fault)
                        }
                    }
                }
                State::Returned => Readiness::Failed(Fault::new(
                    &faults::FAILED_TO_SOURCE_MANAGED_OBJECT,
                    format!("managed object {} has been unloaded", self.name),
                )),
                State::Lost(fault) | State::Failed(fault) => Readiness::Failed(fault.clone()),
            }
        });
        activations.activate();
        readiness
    }

    fn register(&self, node: &Arc<dyn ActivatableJobNode>) -> Readiness {
        match self.monitor.wait_on_asset(node.clone(), None) {
            WaitOutcome::Waiting => Readiness::Waiting(self.monitor.asset_ref().clone()),
            WaitOutcome::Fail(fault) => Readiness::Failed(fault),
            WaitOutcome::Proceed => Readiness::Failed(Fault::new(
                &faults::FAILED_TO_SOURCE_MANAGED_OBJECT,
                format!("managed object {} is no longer available", self.name),
            )),
        }
    }

    fn sourced(&self, instance: ManagedObjectInstance) {
        let (late, activations) = collect_activations(|collector| {
            let mut state = lock(&self.state);
            match &*state {
                State::Unsourced | State::Sourcing { .. } => {
                    *state = State::Available {
                        instance: instance.clone(),
                        loaded: false,
                        in_use: false,
                        operation: None,
                    };
                    self.monitor.activate_job_nodes(collector, false);
                    None
                }
                _ => Some(instance.clone()),
            }
        });

        match late {
            Some(instance) => {
                tracing::warn!(
                    "managed_object_arrived_late: object={}, instance={}",
                    self.name,
                    instance.id()
                );
                self.binding.return_managed_object(instance);
            }
            None => {
                tracing::debug!(
                    "managed_object_sourced: object={}, instance={}",
                    self.name,
                    instance.id()
                );
                instance
                    .managed_object()
                    .register_asynchronous_listener(AsynchronousContext {
                        container: self.self_ref.clone(),
                    });
            }
        }
        activations.activate();
    }

    fn sourcing_failed(&self, cause: Fault) {
        let fault = if cause.is_a(&faults::MANAGED_OBJECT) {
            cause
        } else {
            Fault::new(
                &faults::FAILED_TO_SOURCE_MANAGED_OBJECT,
                format!("failed to source managed object {}", self.name),
            )
            .with_cause(cause)
        };

        let ((), activations) = collect_activations(|collector| {
            let mut state = lock(&self.state);
            if matches!(*state, State::Unsourced | State::Sourcing { .. }) {
                tracing::warn!("managed_object_sourcing_failed: object={}, fault={}", self.name, fault);
                *state = State::Failed(fault.clone());
                self.monitor.fail_job_nodes(fault, collector, true);
            } else {
                tracing::warn!("managed_object_late_failure_ignored: object={}, fault={}", self.name, fault);
            }
        });
        activations.activate();
    }

    /// The object for function use. Marks the container in use.
    pub fn object(&self) -> Result<Arc<dyn Any + Send + Sync>, Fault> {
        let mut state = lock(&self.state);
        match &mut *state {
            State::Available {
                instance, in_use, ..
            } => {
                *in_use = true;
                Ok(instance.managed_object().object())
            }
            State::Lost(fault) | State::Failed(fault) => Err(fault.clone()),
            _ => Err(Fault::new(
                &faults::FAILED_TO_SOURCE_MANAGED_OBJECT,
                format!("managed object {} is not ready", self.name),
            )),
        }
    }

    pub fn extension(&self, extension: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        match &*lock(&self.state) {
            State::Available { instance, .. } => instance.managed_object().extension(extension),
            _ => None,
        }
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        match &*lock(&self.state) {
            State::Available { instance, .. } => Some(instance.id()),
            _ => None,
        }
    }

    /// Declare the instance unusable. Waiters and later users receive the
    /// returned fault; the pool removes the instance from circulation.
    pub fn lost_managed_object(&self, cause: Fault) -> Fault {
        let fault = Fault::new(
            &faults::FAILED_TO_SOURCE_MANAGED_OBJECT,
            format!("managed object {} lost", self.name),
        )
        .with_cause(cause.clone());

        let (outcome, activations) = collect_activations(|collector| {
            let mut state = lock(&self.state);
            let previous = std::mem::replace(&mut *state, State::Lost(fault.clone()));
            match previous {
                State::Available { instance, .. } => {
                    self.monitor.fail_job_nodes(fault.clone(), collector, true);
                    Ok(Some(instance))
                }
                State::Unsourced | State::Sourcing { .. } => {
                    self.monitor.fail_job_nodes(fault.clone(), collector, true);
                    Ok(None)
                }
                State::Lost(existing) | State::Failed(existing) => {
                    *state = State::Failed(existing.clone());
                    Err(existing)
                }
                State::Returned => {
                    *state = State::Returned;
                    Ok(None)
                }
            }
        });
        activations.activate();

        match outcome {
            Ok(instance) => {
                tracing::warn!("managed_object_lost: object={}, cause={}", self.name, cause);
                if let Some(instance) = instance {
                    self.binding.lost_managed_object(instance, &cause);
                }
                fault
            }
            Err(existing) => existing,
        }
    }

    /// End of use: the instance goes back to its pool (or is released).
    pub fn unload(&self) {
        let (instance, activations) = collect_activations(|collector| {
            let mut state = lock(&self.state);
            let previous = std::mem::replace(&mut *state, State::Returned);
            match previous {
                State::Available { instance, .. } => Some(instance),
                State::Unsourced => None,
                State::Sourcing { .. } => {
                    let fault = Fault::new(
                        &faults::FAILED_TO_SOURCE_MANAGED_OBJECT,
                        format!("managed object {} unloaded before sourced", self.name),
                    );
                    self.monitor.fail_job_nodes(fault, collector, true);
                    None
                }
                terminal => {
                    *state = terminal;
                    None
                }
            }
        });
        activations.activate();

        if let Some(instance) = instance {
            tracing::debug!(
                "managed_object_unloaded: object={}, instance={}",
                self.name,
                instance.id()
            );
            self.binding.return_managed_object(instance);
        }
    }
}

impl Asset for ManagedObjectContainer {
    fn check_on_asset(&self, context: &mut CheckAssetContext<'_>) {
        let mut lost = None;
        {
            let mut state = lock(&self.state);
            match &*state {
                State::Sourcing { started }
                    if context.time().saturating_duration_since(*started) >= self.binding.timeout =>
                {
                    let fault = Fault::new(
                        &faults::SOURCE_MANAGED_OBJECT_TIMED_OUT,
                        format!(
                            "managed object {} not sourced within {:?}",
                            self.name, self.binding.timeout
                        ),
                    );
                    tracing::warn!("managed_object_source_timed_out: object={}", self.name);
                    *state = State::Failed(fault.clone());
                    context.fail_job_nodes(fault, true);
                }
                State::Available {
                    operation: Some(started),
                    ..
                } if context.time().saturating_duration_since(*started) >= self.binding.async_timeout => {
                    let fault = Fault::new(
                        &faults::ASYNCHRONOUS_OPERATION_TIMED_OUT,
                        format!(
                            "asynchronous operation on {} exceeded {:?}",
                            self.name, self.binding.async_timeout
                        ),
                    );
                    tracing::warn!("managed_object_operation_timed_out: object={}", self.name);
                    let previous = std::mem::replace(&mut *state, State::Failed(fault.clone()));
                    if let State::Available { instance, .. } = previous {
                        lost = Some((instance, fault.clone()));
                    }
                    context.fail_job_nodes(fault, true);
                }
                _ => {}
            }
        }

        if let Some((instance, fault)) = lost {
            self.binding.lost_managed_object(instance, &fault);
        }
    }
}

/// Routes sourcing callbacks to the container.
struct ContainerUser {
    container: Weak<ManagedObjectContainer>,
    binding: Arc<ManagedObjectSourceBinding>,
}

impl ManagedObjectUser for ContainerUser {
    fn set_managed_object(&self, instance: ManagedObjectInstance) {
        match self.container.upgrade() {
            Some(container) => container.sourced(instance),
            None => self.binding.return_managed_object(instance),
        }
    }

    fn set_failure(&self, fault: Fault) {
        if let Some(container) = self.container.upgrade() {
            container.sourcing_failed(fault);
        }
    }
}

// =============================================================================
// Asynchronous operations
// =============================================================================

/// Lets a managed object flag asynchronous operations in progress.
///
/// Job nodes needing the object wait until the operation completes; an
/// operation outliving the source's `async_timeout` fails them with
/// [`faults::ASYNCHRONOUS_OPERATION_TIMED_OUT`].
#[derive(Debug, Clone)]
pub struct AsynchronousContext {
    container: Weak<ManagedObjectContainer>,
}

impl AsynchronousContext {
    pub fn start_operation(&self) {
        if let Some(container) = self.container.upgrade() {
            if let State::Available { operation, .. } = &mut *lock(&container.state) {
                operation.get_or_insert_with(Instant::now);
            }
        }
    }

    pub fn complete_operation(&self) {
        let Some(container) = self.container.upgrade() else {
            return;
        };
        let ((), activations) = collect_activations(|collector| {
            if let State::Available { operation, .. } = &mut *lock(&container.state) {
                if operation.take().is_some() {
                    container.monitor.activate_job_nodes(collector, false);
                }
            }
        });
        activations.activate();
    }

    pub fn is_in_progress(&self) -> bool {
        self.container.upgrade().is_some_and(|container| {
            matches!(
                &*lock(&container.state),
                State::Available {
                    operation: Some(_),
                    ..
                }
            )
        })
    }
}

// =============================================================================
// Object Registry
// =============================================================================

/// Dependencies handed to a coordinating managed object.
#[derive(Debug)]
pub struct ObjectRegistry<'a> {
    dependencies: &'a [Dependency],
}

impl ObjectRegistry<'_> {
    pub fn object(&self, key: impl Into<Key>) -> Result<Arc<dyn Any + Send + Sync>, Fault> {
        let key = key.into();
        self.dependencies
            .iter()
            .enumerate()
            .find(|(position, d)| key.matches(*position, d.key.as_deref(), &d.object))
            .ok_or_else(|| Fault::new(&faults::UNKNOWN_KEY, format!("no dependency {}", key)))
            .and_then(|(_, d)| d.container.object())
    }

    pub fn object_as<T: Any + Send + Sync>(&self, key: impl Into<Key>) -> Result<Arc<T>, Fault> {
        let key = key.into();
        let object = self.object(key.clone())?;
        downcast_object(object, &key)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}
