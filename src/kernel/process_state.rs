//! Process state - the unit of work spanning one or more threads.
//!
//! A process completes when its last thread of execution completes. Its
//! process-scoped managed objects are then unloaded and the outcome is
//! published to every [`ProcessHandle`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use super::fault::Fault;
use super::lock;
use super::managed_object::ManagedObjectContainer;
use super::office::OfficeInner;
use crate::types::{Error, ProcessId, Result};

/// How a unit of work ended.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Completed,
    /// A fault no escalation procedure handled.
    Failed(Fault),
}

impl ProcessOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ProcessOutcome::Completed)
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            ProcessOutcome::Failed(fault) => Some(fault),
            ProcessOutcome::Completed => None,
        }
    }
}

#[derive(Debug)]
struct Completion {
    outcome: Mutex<Option<ProcessOutcome>>,
    done: Condvar,
    watch: watch::Sender<Option<ProcessOutcome>>,
}

impl Completion {
    fn publish(&self, outcome: ProcessOutcome) {
        *lock(&self.outcome) = Some(outcome.clone());
        self.done.notify_all();
        self.watch.send_replace(Some(outcome));
    }
}

/// Observes the completion of one unit of work.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: ProcessId,
    started_at: DateTime<Utc>,
    completion: Arc<Completion>,
}

impl ProcessHandle {
    pub fn process_id(&self) -> &ProcessId {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The outcome, if the process has completed.
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        lock(&self.completion.outcome).clone()
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.completion.outcome).is_some()
    }

    /// Block the calling thread until the process completes.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<ProcessOutcome> {
        let guard = lock(&self.completion.outcome);
        let (guard, _) = self
            .completion
            .done
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone().ok_or_else(|| {
            Error::timeout(format!(
                "process {} did not complete within {:?}",
                self.id, timeout
            ))
        })
    }

    /// Wait asynchronously for the process to complete.
    pub async fn completed(&self) -> ProcessOutcome {
        let mut receiver = self.completion.watch.subscribe();
        loop {
            let current = receiver.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            // The sender lives as long as this handle
            let _ = receiver.changed().await;
        }
    }
}

// =============================================================================
// Process State
// =============================================================================

#[derive(Debug, Default)]
struct ProcessInner {
    active_threads: usize,
    failure: Option<Fault>,
    containers: HashMap<usize, Arc<ManagedObjectContainer>>,
    complete: bool,
}

pub(crate) struct ProcessState {
    id: ProcessId,
    started_at: DateTime<Utc>,
    office: Arc<OfficeInner>,
    inner: Mutex<ProcessInner>,
    completion: Arc<Completion>,
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessState")
            .field("id", &self.id)
            .field("office", &self.office.meta.name)
            .finish()
    }
}

impl ProcessState {
    pub fn new(office: Arc<OfficeInner>) -> Arc<Self> {
        let (watch, _) = watch::channel(None);
        office
            .counters
            .processes_started
            .fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id: ProcessId::new(),
            started_at: Utc::now(),
            office,
            inner: Mutex::new(ProcessInner::default()),
            completion: Arc::new(Completion {
                outcome: Mutex::new(None),
                done: Condvar::new(),
                watch,
            }),
        })
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn office(&self) -> &Arc<OfficeInner> {
        &self.office
    }

    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            id: self.id.clone(),
            started_at: self.started_at,
            completion: self.completion.clone(),
        }
    }

    /// The process-scoped container for `object`, created on first use.
    pub fn container(
        &self,
        object: usize,
        create: impl FnOnce() -> Arc<ManagedObjectContainer>,
    ) -> Arc<ManagedObjectContainer> {
        lock(&self.inner)
            .containers
            .entry(object)
            .or_insert_with(create)
            .clone()
    }

    pub fn thread_created(&self) {
        lock(&self.inner).active_threads += 1;
        self.office
            .counters
            .threads_started
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a thread's completion; the last one completes the process.
    pub fn thread_completed(&self, failure: Option<Fault>) {
        let (containers, outcome) = {
            let mut inner = lock(&self.inner);
            if let Some(fault) = failure {
                inner.failure.get_or_insert(fault);
            }
            inner.active_threads = inner.active_threads.saturating_sub(1);
            if inner.active_threads > 0 || inner.complete {
                return;
            }
            inner.complete = true;
            let containers: Vec<_> = inner.containers.drain().map(|(_, c)| c).collect();
            let outcome = match inner.failure.take() {
                Some(fault) => ProcessOutcome::Failed(fault),
                None => ProcessOutcome::Completed,
            };
            (containers, outcome)
        };

        for container in containers {
            container.unload();
        }

        let counters = &self.office.counters;
        match &outcome {
            ProcessOutcome::Completed => {
                counters.processes_completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("process_completed: process={}", self.id);
            }
            ProcessOutcome::Failed(fault) => {
                counters.processes_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("process_failed: process={}, fault={}", self.id, fault);
            }
        }
        self.completion.publish(outcome);
    }
}
