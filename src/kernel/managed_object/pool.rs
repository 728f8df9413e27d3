//! Managed object pooling.
//!
//! Every instance a pool hands out is accounted for: it is checked out until
//! returned (back on the free list) or lost (out of circulation for good),
//! and `empty()` releases whatever is idle. Callbacks into users and
//! `release()` always run after the pool lock is dropped.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use super::{ManagedObjectInstance, ManagedObjectSource, ManagedObjectUser};
use crate::kernel::fault::{faults, Fault};
use crate::kernel::lock;
use crate::types::{property_usize, InstanceId, Result, ThreadId};

/// Recycles managed object instances across uses.
pub trait ManagedObjectPool: Send + Sync + fmt::Debug {
    /// Hand an idle instance to `user`, or source a new one.
    fn source_managed_object(&self, user: Arc<dyn ManagedObjectUser>);

    /// Return a used instance for reuse.
    fn return_managed_object(&self, instance: ManagedObjectInstance);

    /// Remove an unusable instance from circulation permanently.
    fn lost_managed_object(&self, instance: &ManagedObjectInstance, cause: &Fault);

    /// Release every idle instance. Idempotent.
    fn empty(&self);

    fn status(&self) -> PoolStatus;

    /// Listener to notify as threads of execution complete.
    fn thread_completion_listener(&self) -> Option<Arc<dyn ThreadCompletionListener>> {
        None
    }
}

/// Creates a pool in front of a source.
pub trait ManagedObjectPoolFactory: Send + Sync + fmt::Debug {
    fn create_pool(
        &self,
        name: &str,
        source: Arc<dyn ManagedObjectSource>,
        properties: &HashMap<String, String>,
    ) -> Result<Arc<dyn ManagedObjectPool>>;
}

/// Notified when a thread of execution completes.
pub trait ThreadCompletionListener: Send + Sync + fmt::Debug {
    fn thread_complete(&self, thread: ThreadId);
}

/// Management snapshot of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub name: String,
    pub free: usize,
    pub checked_out: usize,
    pub lost: usize,
    /// Instances newly obtained from the source.
    pub sourced: u64,
    /// Instances handed out again from the free list.
    pub reused: u64,
    /// Instances released by trimming or emptying.
    pub released: u64,
    pub emptied: bool,
}

// =============================================================================
// Free List Pool
// =============================================================================

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<ManagedObjectInstance>,
    checked_out: HashSet<InstanceId>,
    lost: usize,
    sourced: u64,
    reused: u64,
    released: u64,
    emptied: bool,
}

#[derive(Debug)]
struct PoolShared {
    name: String,
    max_idle: usize,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn release_all(&self, instances: Vec<ManagedObjectInstance>) {
        if instances.is_empty() {
            return;
        }
        lock(&self.state).released += instances.len() as u64;
        for instance in instances {
            instance.managed_object().release();
        }
    }
}

/// Pool keeping returned instances on a free list.
///
/// Idle instances above `max_idle` are released as threads of execution
/// complete, so a burst of work within a thread reuses instances freely.
#[derive(Debug)]
pub struct FreeListPool {
    shared: Arc<PoolShared>,
    source: Arc<dyn ManagedObjectSource>,
}

impl FreeListPool {
    pub fn new(name: impl Into<String>, source: Arc<dyn ManagedObjectSource>, max_idle: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                max_idle,
                state: Mutex::new(PoolState::default()),
            }),
            source,
        }
    }
}

/// Records newly sourced instances as checked out before forwarding them.
struct PoolUser {
    shared: Arc<PoolShared>,
    user: Arc<dyn ManagedObjectUser>,
}

impl ManagedObjectUser for PoolUser {
    fn set_managed_object(&self, instance: ManagedObjectInstance) {
        {
            let mut state = lock(&self.shared.state);
            state.checked_out.insert(instance.id());
            state.sourced += 1;
        }
        self.user.set_managed_object(instance);
    }

    fn set_failure(&self, fault: Fault) {
        self.user.set_failure(fault);
    }
}

impl ManagedObjectPool for FreeListPool {
    fn source_managed_object(&self, user: Arc<dyn ManagedObjectUser>) {
        let reused = {
            let mut state = lock(&self.shared.state);
            if state.emptied {
                drop(state);
                user.set_failure(Fault::new(
                    &faults::FAILED_TO_SOURCE_MANAGED_OBJECT,
                    format!("pool {} has been emptied", self.shared.name),
                ));
                return;
            }
            let instance = state.free.pop_front();
            if let Some(instance) = &instance {
                state.checked_out.insert(instance.id());
                state.reused += 1;
            }
            instance
        };

        match reused {
            Some(instance) => user.set_managed_object(instance),
            None => self.source.source_managed_object(Arc::new(PoolUser {
                shared: self.shared.clone(),
                user,
            })),
        }
    }

    fn return_managed_object(&self, instance: ManagedObjectInstance) {
        let release = {
            let mut state = lock(&self.shared.state);
            // Lost instances have already left checked_out
            if !state.checked_out.remove(&instance.id()) {
                tracing::warn!(
                    "pool_return_of_unknown_instance: pool={}, instance={}",
                    self.shared.name,
                    instance.id()
                );
                return;
            }
            if state.emptied {
                Some(instance)
            } else {
                state.free.push_back(instance);
                None
            }
        };

        if let Some(instance) = release {
            self.shared.release_all(vec![instance]);
        }
    }

    fn lost_managed_object(&self, instance: &ManagedObjectInstance, cause: &Fault) {
        let mut state = lock(&self.shared.state);
        let was_out = state.checked_out.remove(&instance.id());
        let free_before = state.free.len();
        state.free.retain(|free| free.id() != instance.id());
        if was_out || state.free.len() < free_before {
            state.lost += 1;
            tracing::warn!(
                "pool_instance_lost: pool={}, instance={}, cause={}",
                self.shared.name,
                instance.id(),
                cause
            );
        }
    }

    fn empty(&self) {
        let drained: Vec<_> = {
            let mut state = lock(&self.shared.state);
            if state.emptied {
                return;
            }
            state.emptied = true;
            state.free.drain(..).collect()
        };
        tracing::info!(
            "pool_emptied: pool={}, released={}",
            self.shared.name,
            drained.len()
        );
        self.shared.release_all(drained);
    }

    fn status(&self) -> PoolStatus {
        let state = lock(&self.shared.state);
        PoolStatus {
            name: self.shared.name.clone(),
            free: state.free.len(),
            checked_out: state.checked_out.len(),
            lost: state.lost,
            sourced: state.sourced,
            reused: state.reused,
            released: state.released,
            emptied: state.emptied,
        }
    }

    fn thread_completion_listener(&self) -> Option<Arc<dyn ThreadCompletionListener>> {
        Some(self.shared.clone())
    }
}

impl ThreadCompletionListener for PoolShared {
    fn thread_complete(&self, thread: ThreadId) {
        let trimmed: Vec<_> = {
            let mut state = lock(&self.state);
            let excess = state.free.len().saturating_sub(self.max_idle);
            state.free.drain(..excess).collect()
        };
        if !trimmed.is_empty() {
            tracing::debug!(
                "pool_trimmed: pool={}, thread={}, released={}",
                self.name,
                thread,
                trimmed.len()
            );
        }
        self.release_all(trimmed);
    }
}

/// Factory for [`FreeListPool`]; reads the `max_idle` property (default 8).
#[derive(Debug, Default)]
pub struct FreeListPoolFactory;

impl ManagedObjectPoolFactory for FreeListPoolFactory {
    fn create_pool(
        &self,
        name: &str,
        source: Arc<dyn ManagedObjectSource>,
        properties: &HashMap<String, String>,
    ) -> Result<Arc<dyn ManagedObjectPool>> {
        let max_idle = property_usize(properties, "max_idle", 8)?;
        Ok(Arc::new(FreeListPool::new(name, source, max_idle)))
    }
}
