//! Kernel - teams, offices and the managed resources they share.
//!
//! The kernel is built once from configuration by [`KernelBuilder`], opened,
//! used to invoke functions through its [`Office`]s, then closed. Work runs
//! on teams as chains of job nodes; waiting happens on asset monitors and
//! never occupies a worker.
//!
//! ```text
//!   Office::invoke_function ─→ ProcessState ─→ ThreadState ─→ Team
//!                                                   │  ▲
//!                            ManagedObjectContainer │  │ activate (outside locks)
//!                                                   ▼  │
//!                                               AssetMonitor ◀─ AssetMonitorService
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

mod administration;
mod asset;
mod builder;
mod escalation;
mod fault;
mod function;
mod governance;
mod managed_object;
mod monitor;
mod office;
mod process_state;
mod recovery;
mod team;
mod thread_state;

pub use administration::{Administration, AdministrationContext, FnAdministration};
pub use asset::{
    collect_activations, ActivatableJobNode, ActivationCollector, Asset, AssetCheckReport, AssetManager,
    AssetMonitor, AssetRef, CheckAssetContext, JobNodeActivateSet, WaitDeadline, WaitOutcome,
};
pub use builder::KernelBuilder;
pub use escalation::{
    EscalationFlow, EscalationHandler, EscalationLevel, EscalationProcedure, LoggingEscalationHandler,
};
pub use fault::{faults, Fault, FaultType, FaultTypeRegistry};
pub use function::{Argument, FlowHandle, FunctionContext, Key, ManagedFunction};
pub use governance::{Governance, GovernanceContext, GovernanceFactory};
pub use managed_object::{
    AsynchronousContext, ContainerPhase, FnManagedObjectSource, FreeListPool, FreeListPoolFactory,
    ManagedObject, ManagedObjectInstance, ManagedObjectPool, ManagedObjectPoolFactory, ManagedObjectSource,
    ManagedObjectUser, ObjectRegistry, PoolStatus, SourceContext, ThreadCompletionListener,
    ValueManagedObject,
};
pub use monitor::{AssetMonitorService, MonitorStats};
pub use office::{Office, OfficeStatus};
pub use process_state::{ProcessHandle, ProcessOutcome};
pub use recovery::with_recovery;
pub use team::{
    builtin_team_sources, Job, JobRef, JobState, OnePersonTeamSource, PassiveTeam, PassiveTeamSource, Team,
    TeamSource, TeamStatus, TokioTeam, TokioTeamSource, WorkerPoolTeam, WorkerPoolTeamSource,
};

use managed_object::ManagedObjectSourceBinding;
use crate::types::{AssetConfig, Error, Result};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kernel-wide services shared by every office.
#[derive(Debug)]
pub(crate) struct KernelContext {
    pub assets: Arc<AssetManager>,
    pub escalation_handler: Arc<dyn EscalationHandler>,
    pub max_nodes_per_run: usize,
    pub thread_listeners: Vec<Arc<dyn ThreadCompletionListener>>,
    open: AtomicBool,
}

impl KernelContext {
    pub fn new(
        assets: Arc<AssetManager>,
        escalation_handler: Arc<dyn EscalationHandler>,
        max_nodes_per_run: usize,
        thread_listeners: Vec<Arc<dyn ThreadCompletionListener>>,
    ) -> Self {
        Self {
            assets,
            escalation_handler,
            max_nodes_per_run,
            thread_listeners,
            open: AtomicBool::new(false),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// =============================================================================
// Kernel
// =============================================================================

/// Kernel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelState {
    Built,
    Open,
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    state: KernelState,
    opened_at: Option<DateTime<Utc>>,
    monitor: Option<AssetMonitorService>,
}

/// Read-only management snapshot of the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStatus {
    pub state: KernelState,
    pub opened_at: Option<DateTime<Utc>>,
    pub teams: Vec<TeamStatus>,
    pub offices: Vec<OfficeStatus>,
    pub pools: Vec<PoolStatus>,
    pub asset_monitors: usize,
    pub waiting_job_nodes: usize,
}

/// The execution kernel.
#[derive(Debug)]
pub struct Kernel {
    context: Arc<KernelContext>,
    teams: Vec<Arc<dyn Team>>,
    sources: Vec<Arc<ManagedObjectSourceBinding>>,
    offices: Vec<Office>,
    assets_config: AssetConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl Kernel {
    pub(crate) fn new(
        context: Arc<KernelContext>,
        teams: Vec<Arc<dyn Team>>,
        sources: Vec<Arc<ManagedObjectSourceBinding>>,
        offices: Vec<Office>,
        assets_config: AssetConfig,
    ) -> Self {
        Self {
            context,
            teams,
            sources,
            offices,
            assets_config,
            lifecycle: Mutex::new(Lifecycle {
                state: KernelState::Built,
                opened_at: None,
                monitor: None,
            }),
        }
    }

    pub fn state(&self) -> KernelState {
        lock(&self.lifecycle).state
    }

    /// Start teams, sources and the asset monitor service. The monitor runs
    /// on the ambient tokio runtime, or on a thread of its own without one.
    pub fn open_kernel(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state != KernelState::Built {
            return Err(Error::state_transition(format!(
                "cannot open kernel in state {:?}",
                lifecycle.state
            )));
        }

        for (index, team) in self.teams.iter().enumerate() {
            if let Err(e) = team.start_working() {
                tracing::error!("team_start_failed: team={}, error={}", team.name(), e);
                self.teams[..index].iter().for_each(|t| t.stop_working());
                return Err(e);
            }
        }
        for (index, source) in self.sources.iter().enumerate() {
            if let Err(e) = source.start() {
                tracing::error!("managed_object_source_start_failed: source={}, error={}", source.name, e);
                self.sources[..index].iter().for_each(|s| s.stop());
                self.teams.iter().for_each(|t| t.stop_working());
                return Err(e);
            }
        }

        if self.assets_config.monitor_on_open {
            let mut service = AssetMonitorService::new(self.context.assets.clone(), self.assets_config.check_interval);
            if tokio::runtime::Handle::try_current().is_ok() {
                // Detached; stopped through the service's oneshot on close
                drop(service.start());
            } else if let Err(e) = service.start_dedicated() {
                tracing::error!("asset_monitor_start_failed: error={}", e);
                self.sources.iter().for_each(|s| s.stop());
                self.teams.iter().for_each(|t| t.stop_working());
                return Err(e);
            }
            lifecycle.monitor = Some(service);
        }

        self.context.open.store(true, Ordering::Release);
        lifecycle.state = KernelState::Open;
        lifecycle.opened_at = Some(Utc::now());
        tracing::info!(
            "kernel_opened: teams={}, sources={}, offices={}, asset_monitor={}",
            self.teams.len(),
            self.sources.len(),
            self.offices.len(),
            lifecycle.monitor.is_some()
        );
        Ok(())
    }

    /// Stop the asset monitor, empty every pool, stop sources then teams.
    /// Closing an already closed kernel does nothing.
    pub fn close_kernel(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.state {
            KernelState::Closed => return,
            KernelState::Built => {
                lifecycle.state = KernelState::Closed;
                return;
            }
            KernelState::Open => {}
        }

        self.context.open.store(false, Ordering::Release);
        if let Some(mut monitor) = lifecycle.monitor.take() {
            monitor.stop();
        }
        for source in &self.sources {
            source.stop();
        }
        for team in &self.teams {
            team.stop_working();
        }
        lifecycle.state = KernelState::Closed;
        tracing::info!("kernel_closed");
    }

    pub fn office(&self, name: &str) -> Result<Office> {
        self.offices
            .iter()
            .find(|office| office.name() == name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("office {}", name)))
    }

    pub fn offices(&self) -> &[Office] {
        &self.offices
    }

    pub fn asset_manager(&self) -> &Arc<AssetManager> {
        &self.context.assets
    }

    /// Sweep every asset once on the calling thread.
    pub fn check_on_assets(&self) -> AssetCheckReport {
        self.context.assets.check_on_assets(std::time::Instant::now())
    }

    pub fn status(&self) -> KernelStatus {
        let (state, opened_at) = {
            let lifecycle = lock(&self.lifecycle);
            (lifecycle.state, lifecycle.opened_at)
        };
        KernelStatus {
            state,
            opened_at,
            teams: self.teams.iter().map(|team| team.status()).collect(),
            offices: self.offices.iter().map(Office::status).collect(),
            pools: self.sources.iter().filter_map(|source| source.pool_status()).collect(),
            asset_monitors: self.context.assets.monitor_count(),
            waiting_job_nodes: self.context.assets.waiting_count(),
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.close_kernel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KernelConfig;
    use tracing_test::traced_test;

    fn empty_kernel() -> Kernel {
        KernelBuilder::new(KernelConfig::default()).build().unwrap()
    }

    #[test]
    #[traced_test]
    fn test_open_and_close_are_logged() {
        let kernel = empty_kernel();
        kernel.open_kernel().unwrap();
        kernel.close_kernel();

        assert!(logs_contain("kernel_opened"));
        assert!(logs_contain("kernel_closed"));
    }

    #[test]
    fn test_monitor_runs_on_own_thread_outside_runtime() {
        let kernel = empty_kernel();
        kernel.open_kernel().unwrap();
        assert!(lock(&kernel.lifecycle)
            .monitor
            .as_ref()
            .is_some_and(|monitor| monitor.is_running() && monitor.is_dedicated()));
        assert!(kernel.context.is_open());

        kernel.close_kernel();
        assert!(lock(&kernel.lifecycle).monitor.is_none());
        assert!(!kernel.context.is_open());
    }

    #[test]
    fn test_monitor_disabled_by_config() {
        let mut config = KernelConfig::default();
        config.assets.monitor_on_open = false;
        let kernel = KernelBuilder::new(config).build().unwrap();
        kernel.open_kernel().unwrap();
        assert!(lock(&kernel.lifecycle).monitor.is_none());
        kernel.close_kernel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_started_inside_runtime() {
        let kernel = empty_kernel();
        kernel.open_kernel().unwrap();
        assert!(lock(&kernel.lifecycle)
            .monitor
            .as_ref()
            .is_some_and(|monitor| monitor.is_running() && !monitor.is_dedicated()));

        kernel.close_kernel();
        assert!(lock(&kernel.lifecycle).monitor.is_none());
    }

    #[test]
    fn test_close_without_open() {
        let kernel = empty_kernel();
        kernel.close_kernel();
        assert_eq!(kernel.state(), KernelState::Closed);
        assert!(kernel.open_kernel().is_err());
    }

    #[test]
    fn test_lock_recovers_poisoned_mutex() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        assert_eq!(*lock(&mutex), 1);
    }
}
