//! Background asset monitoring.
//!
//! AssetMonitorService periodically sweeps every live asset monitor so that
//! time-based failures surface without anyone polling:
//! - Managed objects that take too long to source
//! - Asynchronous operations that outlive their timeout
//! - Flow joins past their deadline
//!
//! Each sweep runs on the blocking pool since activation may run job nodes
//! inline on passive teams. Without an ambient tokio runtime the service
//! owns a current-thread runtime on a dedicated thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

use super::asset::{AssetCheckReport, AssetManager};
use crate::types::{Error, Result};

/// Statistics from one sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Number of live monitors checked
    pub monitors: usize,
    /// Number of job nodes activated (or failed)
    pub activated: usize,
    /// Number of registrations failed by their deadline
    pub expired: usize,
    /// When the sweep completed
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<AssetCheckReport> for MonitorStats {
    fn from(report: AssetCheckReport) -> Self {
        Self {
            monitors: report.monitors,
            activated: report.activated,
            expired: report.expired,
            completed_at: Some(Utc::now()),
        }
    }
}

/// AssetMonitorService drives [`AssetManager::check_on_assets`] on a ticker.
///
/// The ticker runs as a task on the current tokio runtime ([`Self::start`])
/// or on a dedicated thread owning a current-thread runtime
/// ([`Self::start_dedicated`]) when the caller has no runtime.
#[derive(Debug)]
pub struct AssetMonitorService {
    assets: Arc<AssetManager>,
    interval: Duration,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AssetMonitorService {
    pub fn new(assets: Arc<AssetManager>, interval: Duration) -> Self {
        Self {
            assets,
            interval,
            stop_tx: None,
            thread: None,
        }
    }

    /// Start the sweep loop in the background.
    /// Returns immediately; sweeps run in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);
        tokio::spawn(Self::sweep_loop(self.assets.clone(), self.period(), stop_rx))
    }

    /// Start the sweep loop on a thread of its own. [`Self::stop`] joins it.
    pub fn start_dedicated(&mut self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let sweep = Self::sweep_loop(self.assets.clone(), self.period(), stop_rx);
        let handle = thread::Builder::new()
            .name("floor-asset-monitor".to_string())
            .spawn(move || runtime.block_on(sweep))?;
        self.stop_tx = Some(stop_tx);
        self.thread = Some(handle);
        Ok(())
    }

    fn period(&self) -> Duration {
        self.interval.max(Duration::from_millis(1))
    }

    async fn sweep_loop(
        assets: Arc<AssetManager>,
        period: Duration,
        mut stop_rx: tokio::sync::oneshot::Receiver<()>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("asset_monitor_started: interval={:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match Self::run_sweep_async(&assets).await {
                        Ok(stats) if stats.activated > 0 => tracing::debug!(
                            "asset_sweep_completed: monitors={}, activated={}, expired={}",
                            stats.monitors,
                            stats.activated,
                            stats.expired
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!("asset_sweep_failed: {}", e),
                    }
                }
                _ = &mut stop_rx => {
                    tracing::info!("asset_monitor_stopped");
                    break;
                }
            }
        }
    }

    /// Stop the sweep loop, waiting for a dedicated thread to finish.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            // A job run by the sweep may itself close the kernel
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("asset_monitor_thread_panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    pub fn is_dedicated(&self) -> bool {
        self.thread.is_some()
    }

    async fn run_sweep_async(assets: &Arc<AssetManager>) -> Result<MonitorStats> {
        let assets = assets.clone();
        let report = tokio::task::spawn_blocking(move || assets.check_on_assets(Instant::now()))
            .await
            .map_err(|e| Error::internal(format!("asset sweep task failed: {}", e)))?;
        Ok(report.into())
    }

    /// Run a single sweep on the calling thread.
    pub fn run_sweep_sync(assets: &AssetManager) -> MonitorStats {
        assets.check_on_assets(Instant::now()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::asset::{
        ActivatableJobNode, Asset, CheckAssetContext, WaitDeadline, WaitOutcome,
    };
    use crate::kernel::fault::{faults, Fault};
    use crate::kernel::lock;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Node {
        failures: Mutex<Vec<Fault>>,
    }

    impl ActivatableJobNode for Node {
        fn activate(&self, failure: Option<Fault>) {
            if let Some(fault) = failure {
                lock(&self.failures).push(fault);
            }
        }
    }

    #[test]
    fn test_sync_sweep_expires_deadlines() {
        let assets = AssetManager::new();
        let monitor = assets.create_monitor("join", None);
        let node = Arc::new(Node::default());
        let outcome = monitor.wait_on_asset(
            node.clone(),
            Some(WaitDeadline {
                at: Instant::now(),
                fault: Fault::new(&faults::FLOW_JOIN_TIMED_OUT, "late"),
            }),
        );
        assert!(matches!(outcome, WaitOutcome::Waiting));

        let stats = AssetMonitorService::run_sweep_sync(&assets);

        assert_eq!(stats.expired, 1);
        assert_eq!(stats.activated, 1);
        assert!(stats.completed_at.is_some());
        assert!(lock(&node.failures)[0].is_a(&faults::FLOW_JOIN_TIMED_OUT));
    }

    struct Ready;

    impl Asset for Ready {
        fn check_on_asset(&self, context: &mut CheckAssetContext<'_>) {
            context.activate_job_nodes(false);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_service_sweeps_until_stopped() {
        let assets = Arc::new(AssetManager::new());
        let asset: Arc<dyn Asset> = Arc::new(Ready);
        let monitor = assets.create_monitor("ready", Some(Arc::downgrade(&asset)));
        let node = Arc::new(Node::default());
        monitor.wait_on_asset(node, None);

        let mut service = AssetMonitorService::new(assets.clone(), Duration::from_millis(10));
        let handle = service.start();
        assert!(service.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.waiting_count(), 0);
        assert!(assets.sweeps() > 0);

        service.stop();
        assert!(!service.is_running());
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("asset monitor should stop")
            .unwrap();
    }

    #[test]
    fn test_dedicated_service_expires_deadlines_without_runtime() {
        let assets = Arc::new(AssetManager::new());
        let monitor = assets.create_monitor("join", None);
        let node = Arc::new(Node::default());
        monitor.wait_on_asset(
            node.clone(),
            Some(WaitDeadline {
                at: Instant::now() + Duration::from_millis(20),
                fault: Fault::new(&faults::FLOW_JOIN_TIMED_OUT, "late"),
            }),
        );

        let mut service = AssetMonitorService::new(assets.clone(), Duration::from_millis(5));
        service.start_dedicated().unwrap();
        assert!(service.is_dedicated());

        let give_up = Instant::now() + Duration::from_secs(2);
        while lock(&node.failures).is_empty() && Instant::now() < give_up {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(lock(&node.failures)[0].is_a(&faults::FLOW_JOIN_TIMED_OUT));

        service.stop();
        assert!(!service.is_running());
        assert!(!service.is_dedicated());
        let sweeps = assets.sweeps();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(assets.sweeps(), sweeps);
    }
}
