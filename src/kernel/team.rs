//! Teams - pluggable worker pools executing jobs.
//!
//! A team repeatedly pulls a [`Job`] and runs it until the job stops
//! reporting [`JobState::Pending`]. Jobs never block a worker while waiting:
//! a job that cannot proceed registers itself on an asset monitor and returns
//! [`JobState::Blocked`], and is handed back to a team once the asset is ready.
//!
//! Implementations:
//! - [`PassiveTeam`]: runs the job on the calling thread.
//! - [`WorkerPoolTeam`]: fixed pool of dedicated OS threads (`one_person` is a
//!   pool of one).
//! - [`TokioTeam`]: jobs run on the blocking pool of an owned tokio runtime.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::asset::AssetRef;
use super::lock;
use super::recovery::guard_panics;
use crate::types::{property_usize, Error, Result};

/// Outcome of running a job once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// The job has finished on this team.
    Complete,
    /// The job yielded and wants to be run again.
    Pending,
    /// The job is parked on an asset and will be re-activated by its monitor.
    Blocked(AssetRef),
}

/// Unit of continuable work executed by a team.
pub trait Job: Send + Sync + fmt::Debug {
    /// Run the job until it completes, yields or blocks.
    fn run(&self) -> JobState;
}

/// Shared handle to a job.
pub type JobRef = Arc<dyn Job>;

/// Worker-pool abstraction.
pub trait Team: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Start the team's workers. Idempotent while running.
    fn start_working(&self) -> Result<()>;

    /// Hand a job to the team. Never blocks on the job's completion.
    fn assign_job(&self, job: JobRef);

    /// Stop the team: queued jobs are drained, then workers are released.
    fn stop_working(&self);

    /// Read-only snapshot for management tooling.
    fn status(&self) -> TeamStatus;
}

/// Management snapshot of a team.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamStatus {
    pub name: String,
    pub kind: String,
    pub workers: usize,
    pub queued: usize,
    pub executed: u64,
    pub running: bool,
}

/// Run a job on the current thread until it no longer reports pending.
fn run_until_yield(job: &JobRef, team: &str) -> Option<JobState> {
    loop {
        match guard_panics(|| job.run(), team) {
            Some(JobState::Pending) => continue,
            other => return other,
        }
    }
}

// =============================================================================
// Passive Team
// =============================================================================

/// Team that runs jobs on whichever thread assigns them.
#[derive(Debug)]
pub struct PassiveTeam {
    name: String,
    executed: AtomicU64,
}

impl PassiveTeam {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executed: AtomicU64::new(0),
        }
    }
}

impl Team for PassiveTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_working(&self) -> Result<()> {
        Ok(())
    }

    fn assign_job(&self, job: JobRef) {
        run_until_yield(&job, &self.name);
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn stop_working(&self) {}

    fn status(&self) -> TeamStatus {
        TeamStatus {
            name: self.name.clone(),
            kind: "passive".to_string(),
            workers: 0,
            queued: 0,
            executed: self.executed.load(Ordering::Relaxed),
            running: true,
        }
    }
}

// =============================================================================
// Worker Pool Team
// =============================================================================

#[derive(Debug)]
struct QueueState {
    jobs: VecDeque<JobRef>,
    accepting: bool,
    started: bool,
}

#[derive(Debug)]
struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    executed: AtomicU64,
}

/// Team backed by a fixed number of dedicated worker threads.
#[derive(Debug)]
pub struct WorkerPoolTeam {
    name: String,
    kind: &'static str,
    size: usize,
    queue: Arc<JobQueue>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPoolTeam {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self::with_kind(name.into(), size, "worker_pool")
    }

    /// Team with a single dedicated thread.
    pub fn one_person(name: impl Into<String>) -> Self {
        Self::with_kind(name.into(), 1, "one_person")
    }

    fn with_kind(name: String, size: usize, kind: &'static str) -> Self {
        Self {
            name,
            kind,
            size: size.max(1),
            queue: Arc::new(JobQueue {
                state: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    accepting: true,
                    started: false,
                }),
                available: Condvar::new(),
                executed: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn work(queue: Arc<JobQueue>, team: String) {
        loop {
            let next = {
                let mut state = lock(&queue.state);
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        break Some(job);
                    }
                    if !state.accepting {
                        break None;
                    }
                    state = queue
                        .available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            let Some(job) = next else {
                break;
            };

            if let Some(JobState::Pending) = guard_panics(|| job.run(), &team) {
                // Back of the queue so other jobs interleave
                lock(&queue.state).jobs.push_back(job);
                queue.available.notify_one();
                continue;
            }
            queue.executed.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!("team_worker_exited: team={}", team);
    }
}

impl Team for WorkerPoolTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_working(&self) -> Result<()> {
        {
            let mut state = lock(&self.queue.state);
            if !state.accepting {
                return Err(Error::state_transition(format!(
                    "team {} has been stopped and cannot restart",
                    self.name
                )));
            }
            if state.started {
                return Ok(());
            }
            state.started = true;
        }

        let mut workers = lock(&self.workers);
        for index in 0..self.size {
            let queue = self.queue.clone();
            let team = self.name.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, index))
                .spawn(move || Self::work(queue, team))?;
            workers.push(handle);
        }

        tracing::info!("team_started: team={}, workers={}", self.name, self.size);
        Ok(())
    }

    fn assign_job(&self, job: JobRef) {
        {
            let mut state = lock(&self.queue.state);
            if state.accepting {
                state.jobs.push_back(job);
                drop(state);
                self.queue.available.notify_one();
                return;
            }
        }

        tracing::warn!("team_stopped_running_inline: team={}", self.name);
        run_until_yield(&job, &self.name);
    }

    fn stop_working(&self) {
        {
            let mut state = lock(&self.queue.state);
            if !state.accepting {
                return;
            }
            state.accepting = false;
        }
        self.queue.available.notify_all();

        let current = thread::current().id();
        let handles: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                // Stopped from one of our own jobs; the worker exits once drained
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("team_worker_join_failed: team={}", self.name);
            }
        }

        tracing::info!("team_stopped: team={}", self.name);
    }

    fn status(&self) -> TeamStatus {
        let state = lock(&self.queue.state);
        TeamStatus {
            name: self.name.clone(),
            kind: self.kind.to_string(),
            workers: self.size,
            queued: state.jobs.len(),
            executed: self.queue.executed.load(Ordering::Relaxed),
            running: state.started && state.accepting,
        }
    }
}

// =============================================================================
// Tokio Team
// =============================================================================

/// How long `stop_working` waits for in-flight jobs before shutting down.
const TOKIO_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Count of spawned jobs not yet finished, signalled when it drains to zero.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlight {
    fn enter(&self) {
        *lock(&self.count) += 1;
    }

    fn leave(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn current(&self) -> usize {
        *lock(&self.count)
    }

    /// Block until nothing is in flight or `timeout` passes. Returns the
    /// number of jobs still running.
    fn wait_drained(&self, timeout: Duration) -> usize {
        let count = lock(&self.count);
        let (count, _) = self
            .drained
            .wait_timeout_while(count, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count
    }
}

/// Team running jobs on the blocking pool of its own tokio runtime.
#[derive(Debug)]
pub struct TokioTeam {
    name: String,
    workers: usize,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    stopped: AtomicBool,
    in_flight: Arc<InFlight>,
    executed: Arc<AtomicU64>,
}

impl TokioTeam {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers: workers.max(1),
            runtime: Mutex::new(None),
            stopped: AtomicBool::new(false),
            in_flight: Arc::new(InFlight::default()),
            executed: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Team for TokioTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_working(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::state_transition(format!(
                "team {} has been stopped and cannot restart",
                self.name
            )));
        }
        let mut runtime = lock(&self.runtime);
        if runtime.is_none() {
            *runtime = Some(
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .max_blocking_threads(self.workers)
                    .thread_name(format!("{}-worker", self.name))
                    .enable_time()
                    .build()?,
            );
            tracing::info!("team_started: team={}, workers={}", self.name, self.workers);
        }
        Ok(())
    }

    fn assign_job(&self, job: JobRef) {
        let handle = lock(&self.runtime).as_ref().map(|rt| rt.handle().clone());
        let Some(handle) = handle else {
            tracing::warn!("team_not_running_inline: team={}", self.name);
            run_until_yield(&job, &self.name);
            return;
        };

        self.in_flight.enter();
        let in_flight = self.in_flight.clone();
        let executed = self.executed.clone();
        let team = self.name.clone();
        handle.spawn_blocking(move || {
            run_until_yield(&job, &team);
            executed.fetch_add(1, Ordering::Relaxed);
            in_flight.leave();
        });
    }

    fn stop_working(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let remaining = self.in_flight.wait_drained(TOKIO_DRAIN_TIMEOUT);
        if remaining > 0 {
            tracing::warn!("team_drain_timed_out: team={}, in_flight={}", self.name, remaining);
        }
        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.shutdown_background();
        }
        tracing::info!("team_stopped: team={}", self.name);
    }

    fn status(&self) -> TeamStatus {
        TeamStatus {
            name: self.name.clone(),
            kind: "tokio".to_string(),
            workers: self.workers,
            queued: self.in_flight.current(),
            executed: self.executed.load(Ordering::Relaxed),
            running: lock(&self.runtime).is_some(),
        }
    }
}

// =============================================================================
// Team Sources
// =============================================================================

/// Factory creating a team from configuration.
pub trait TeamSource: Send + Sync + fmt::Debug {
    fn create_team(&self, name: &str, properties: &HashMap<String, String>) -> Result<Arc<dyn Team>>;
}

fn positive_property(properties: &HashMap<String, String>, key: &str, default: usize) -> Result<usize> {
    let value = property_usize(properties, key, default)?;
    if value == 0 {
        return Err(Error::configuration(format!("property {} must be positive", key)));
    }
    Ok(value)
}

fn default_parallelism() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Debug, Default)]
pub struct PassiveTeamSource;

impl TeamSource for PassiveTeamSource {
    fn create_team(&self, name: &str, _properties: &HashMap<String, String>) -> Result<Arc<dyn Team>> {
        Ok(Arc::new(PassiveTeam::new(name)))
    }
}

/// Property `size` (default: available parallelism).
#[derive(Debug, Default)]
pub struct WorkerPoolTeamSource;

impl TeamSource for WorkerPoolTeamSource {
    fn create_team(&self, name: &str, properties: &HashMap<String, String>) -> Result<Arc<dyn Team>> {
        let size = positive_property(properties, "size", default_parallelism())?;
        Ok(Arc::new(WorkerPoolTeam::new(name, size)))
    }
}

#[derive(Debug, Default)]
pub struct OnePersonTeamSource;

impl TeamSource for OnePersonTeamSource {
    fn create_team(&self, name: &str, _properties: &HashMap<String, String>) -> Result<Arc<dyn Team>> {
        Ok(Arc::new(WorkerPoolTeam::one_person(name)))
    }
}

/// Property `workers` (default: available parallelism).
#[derive(Debug, Default)]
pub struct TokioTeamSource;

impl TeamSource for TokioTeamSource {
    fn create_team(&self, name: &str, properties: &HashMap<String, String>) -> Result<Arc<dyn Team>> {
        let workers = positive_property(properties, "workers", default_parallelism())?;
        Ok(Arc::new(TokioTeam::new(name, workers)))
    }
}

/// Team sources registered on every builder.
pub fn builtin_team_sources() -> Vec<(&'static str, Arc<dyn TeamSource>)> {
    vec![
        ("passive", Arc::new(PassiveTeamSource)),
        ("worker_pool", Arc::new(WorkerPoolTeamSource)),
        ("one_person", Arc::new(OnePersonTeamSource)),
        ("tokio", Arc::new(TokioTeamSource)),
    ]
}
