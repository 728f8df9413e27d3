//! Asset monitoring - waiting on readiness without occupying a worker.
//!
//! An *asset* is anything a job node may need to wait on: a managed object
//! container still sourcing, a thread of execution being joined. Each asset
//! has an [`AssetMonitor`] holding the job nodes waiting on it.
//!
//! Activation is two-phase. Waiting job nodes are *collected* while locks are
//! held and *activated* only once every lock has been released:
//!
//! ```text
//!   collect_activations(|collector| {          // asset lock + monitor lock
//!       monitor.activate_job_nodes(collector)  //   registrations move into collector
//!   })                                         // all guards dropped here
//!   → JobNodeActivateSet::activate()           // nodes handed to their teams
//! ```
//!
//! [`ActivationCollector`] can only be filled, and [`JobNodeActivateSet`] can
//! only be obtained from [`collect_activations`] after its closure returns,
//! so activation can never run under a monitor's lock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use super::fault::Fault;
use super::lock;
use crate::types::AssetId;

/// Identity of an asset, reported by blocked jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetRef {
    pub id: AssetId,
    pub name: String,
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Something parked on an asset that can be resumed.
pub trait ActivatableJobNode: Send + Sync + fmt::Debug {
    /// Resume the job node; `failure` is delivered instead of readiness.
    fn activate(&self, failure: Option<Fault>);
}

/// An asset periodically polled for staleness.
pub trait Asset: Send + Sync {
    fn check_on_asset(&self, context: &mut CheckAssetContext<'_>);
}

// =============================================================================
// Collect / Activate
// =============================================================================

type Activation = (Arc<dyn ActivatableJobNode>, Option<Fault>);

/// Gathers job nodes to activate. Cannot activate anything itself.
#[derive(Debug)]
pub struct ActivationCollector {
    activations: Vec<Activation>,
}

impl ActivationCollector {
    fn push(&mut self, node: Arc<dyn ActivatableJobNode>, failure: Option<Fault>) {
        self.activations.push((node, failure));
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }
}

/// Job nodes ready to be activated, obtainable only after locks are released.
#[must_use = "collected job nodes stay parked until activated"]
#[derive(Debug)]
pub struct JobNodeActivateSet {
    activations: Vec<Activation>,
}

impl JobNodeActivateSet {
    /// Activate every collected job node, in collection order.
    pub fn activate(self) {
        for (node, failure) in self.activations {
            node.activate(failure);
        }
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }
}

/// Run `f` with a collector, returning the activate set once `f` has returned.
///
/// Every lock `f` takes must be released before it returns; the returned set
/// is then activated by the caller.
pub fn collect_activations<R>(f: impl FnOnce(&mut ActivationCollector) -> R) -> (R, JobNodeActivateSet) {
    let mut collector = ActivationCollector {
        activations: Vec::new(),
    };
    let result = f(&mut collector);
    (
        result,
        JobNodeActivateSet {
            activations: collector.activations,
        },
    )
}

// =============================================================================
// Asset Monitor
// =============================================================================

/// Deadline for a single registration.
#[derive(Debug, Clone)]
pub struct WaitDeadline {
    pub at: Instant,
    pub fault: Fault,
}

/// Result of registering on a monitor.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// Registered; the node will be activated later.
    Waiting,
    /// The asset will never block again; proceed immediately.
    Proceed,
    /// The asset has permanently failed with this fault.
    Fail(Fault),
}

#[derive(Debug)]
struct Registration {
    node: Arc<dyn ActivatableJobNode>,
    deadline: Option<WaitDeadline>,
}

#[derive(Debug)]
enum PermanentState {
    ActivateImmediately,
    FailImmediately(Fault),
}

#[derive(Debug, Default)]
struct MonitorState {
    waiting: Vec<Registration>,
    permanent: Option<PermanentState>,
}

/// Registry of job nodes waiting on one asset.
pub struct AssetMonitor {
    asset_ref: AssetRef,
    asset: Option<Weak<dyn Asset>>,
    state: Mutex<MonitorState>,
}

impl fmt::Debug for AssetMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetMonitor")
            .field("asset", &self.asset_ref)
            .field("waiting", &self.waiting_count())
            .finish()
    }
}

impl AssetMonitor {
    pub fn asset_ref(&self) -> &AssetRef {
        &self.asset_ref
    }

    /// Register `node` to be activated when the asset is ready.
    pub fn wait_on_asset(
        &self,
        node: Arc<dyn ActivatableJobNode>,
        deadline: Option<WaitDeadline>,
    ) -> WaitOutcome {
        let mut state = lock(&self.state);
        match &state.permanent {
            Some(PermanentState::ActivateImmediately) => WaitOutcome::Proceed,
            Some(PermanentState::FailImmediately(fault)) => WaitOutcome::Fail(fault.clone()),
            None => {
                state.waiting.push(Registration { node, deadline });
                WaitOutcome::Waiting
            }
        }
    }

    /// Move all waiting job nodes into `collector` for activation.
    ///
    /// When `permanent`, later registrants proceed immediately.
    pub fn activate_job_nodes(&self, collector: &mut ActivationCollector, permanent: bool) {
        let mut state = lock(&self.state);
        for registration in state.waiting.drain(..) {
            collector.push(registration.node, None);
        }
        if permanent {
            state.permanent = Some(PermanentState::ActivateImmediately);
        }
    }

    /// Move all waiting job nodes into `collector`, failing each with `fault`.
    ///
    /// When `permanent`, later registrants fail immediately with `fault`.
    pub fn fail_job_nodes(&self, fault: Fault, collector: &mut ActivationCollector, permanent: bool) {
        let mut state = lock(&self.state);
        for registration in state.waiting.drain(..) {
            collector.push(registration.node, Some(fault.clone()));
        }
        if permanent {
            state.permanent = Some(PermanentState::FailImmediately(fault));
        }
    }

    /// Fail registrations whose deadline has passed. Returns the number expired.
    fn expire_registrations(&self, now: Instant, collector: &mut ActivationCollector) -> usize {
        let mut state = lock(&self.state);
        let mut expired = 0;
        let mut index = 0;
        while index < state.waiting.len() {
            let is_expired = matches!(&state.waiting[index].deadline, Some(d) if d.at <= now);
            if is_expired {
                let registration = state.waiting.swap_remove(index);
                let fault = registration.deadline.map(|d| d.fault);
                collector.push(registration.node, fault);
                expired += 1;
            } else {
                index += 1;
            }
        }
        expired
    }

    pub fn waiting_count(&self) -> usize {
        lock(&self.state).waiting.len()
    }

    /// Whether the monitor lock is currently held (by anyone).
    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        matches!(self.state.try_lock(), Err(std::sync::TryLockError::WouldBlock))
    }
}

// =============================================================================
// Check Asset Context
// =============================================================================

/// Context handed to an asset while it is checked.
///
/// `time()` is sampled once per sweep so many assets can be checked against
/// the same instant.
pub struct CheckAssetContext<'a> {
    time: Instant,
    monitor: &'a AssetMonitor,
    collector: &'a mut ActivationCollector,
}

impl fmt::Debug for CheckAssetContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckAssetContext")
            .field("asset", self.monitor.asset_ref())
            .finish()
    }
}

impl CheckAssetContext<'_> {
    pub fn time(&self) -> Instant {
        self.time
    }

    pub fn activate_job_nodes(&mut self, permanent: bool) {
        self.monitor.activate_job_nodes(self.collector, permanent);
    }

    pub fn fail_job_nodes(&mut self, fault: Fault, permanent: bool) {
        self.monitor.fail_job_nodes(fault, self.collector, permanent);
    }
}

// =============================================================================
// Asset Manager
// =============================================================================

/// Result of one sweep over the monitored assets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetCheckReport {
    /// Live monitors checked.
    pub monitors: usize,
    /// Job nodes activated or failed by the sweep.
    pub activated: usize,
    /// Registrations failed because their own deadline passed.
    pub expired: usize,
}

/// Owns the set of monitors polled for timeouts.
#[derive(Debug, Default)]
pub struct AssetManager {
    monitors: Mutex<Vec<Weak<AssetMonitor>>>,
    sweeps: AtomicU64,
}

impl AssetManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a monitor, optionally bound to an asset checked on each sweep.
    pub fn create_monitor(
        &self,
        name: impl Into<String>,
        asset: Option<Weak<dyn Asset>>,
    ) -> Arc<AssetMonitor> {
        let monitor = Arc::new(AssetMonitor {
            asset_ref: AssetRef {
                id: AssetId::next(),
                name: name.into(),
            },
            asset,
            state: Mutex::new(MonitorState::default()),
        });
        let mut registered = lock(&self.monitors);
        registered.retain(|m| m.strong_count() > 0);
        registered.push(Arc::downgrade(&monitor));
        monitor
    }

    /// Check every live asset against `now`, then activate outside all locks.
    pub fn check_on_assets(&self, now: Instant) -> AssetCheckReport {
        let monitors: Vec<Arc<AssetMonitor>> = {
            let mut registered = lock(&self.monitors);
            registered.retain(|m| m.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };

        let (expired, activations) = collect_activations(|collector| {
            let mut expired = 0;
            for monitor in &monitors {
                if let Some(asset) = monitor.asset.as_ref().and_then(Weak::upgrade) {
                    let mut context = CheckAssetContext {
                        time: now,
                        monitor,
                        collector: &mut *collector,
                    };
                    asset.check_on_asset(&mut context);
                }
                expired += monitor.expire_registrations(now, collector);
            }
            expired
        });

        let report = AssetCheckReport {
            monitors: monitors.len(),
            activated: activations.len(),
            expired,
        };
        drop(monitors);
        activations.activate();

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        if report.activated > 0 {
            tracing::debug!(
                "asset_check_completed: monitors={}, activated={}, expired={}",
                report.monitors,
                report.activated,
                report.expired
            );
        }
        report
    }

    /// Number of live monitors.
    pub fn monitor_count(&self) -> usize {
        lock(&self.monitors)
            .iter()
            .filter(|m| m.strong_count() > 0)
            .count()
    }

    /// Total job nodes currently waiting across all monitors.
    pub fn waiting_count(&self) -> usize {
        lock(&self.monitors)
            .iter()
            .filter_map(Weak::upgrade)
            .map(|m| m.waiting_count())
            .sum()
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }
}
