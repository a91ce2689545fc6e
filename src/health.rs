//! Server-side health monitor.
//!
//! Probes the assistant backend on demand and on a fixed interval, keeping
//! the latest [`HealthReport`] available without blocking request handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::models::health::HealthReport;

/// Minimum spacing of on-demand re-probes triggered by `/health`.
pub const RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Advisory liveness and capability monitor.
#[derive(Clone)]
pub struct HealthMonitor {
    backend: Arc<dyn Backend>,
    latest: Arc<watch::Sender<HealthReport>>,
    /// When the backend was last probed; held for the duration of a probe
    /// so concurrent callers share one.
    last_probe: Arc<Mutex<Option<Instant>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("latest", &*self.latest.borrow())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor; the backend is reported unavailable until probed.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (latest, _) = watch::channel(HealthReport::unavailable());
        Self {
            backend,
            latest: Arc::new(latest),
            last_probe: Arc::new(Mutex::new(None)),
        }
    }

    /// Probe the backend now and record the result.
    pub async fn check(&self) -> HealthReport {
        let mut last_probe = self.last_probe.lock().await;
        self.probe(&mut last_probe).await
    }

    /// Probe the backend unless it was probed within `min_interval`, in
    /// which case the recorded report is returned.
    pub async fn refresh(&self, min_interval: Duration) -> HealthReport {
        let mut last_probe = self.last_probe.lock().await;
        if last_probe.is_some_and(|at| at.elapsed() < min_interval) {
            return self.latest();
        }
        self.probe(&mut last_probe).await
    }

    async fn probe(&self, last_probe: &mut Option<Instant>) -> HealthReport {
        let probe = self.backend.probe().await;
        *last_probe = Some(Instant::now());
        let report = if probe.available {
            HealthReport::available(probe.version)
        } else {
            HealthReport::unavailable()
        };

        let previous = self.latest.send_replace(report.clone());
        if previous.backend_available != report.backend_available {
            if report.backend_available {
                info!(version = ?report.backend_version, "backend became available");
            } else {
                warn!("backend became unavailable");
            }
        }
        report
    }

    /// Most recently recorded report.
    #[must_use]
    pub fn latest(&self) -> HealthReport {
        self.latest.borrow().clone()
    }

    /// Subscribe to report changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<HealthReport> {
        self.latest.subscribe()
    }

    /// Spawn the periodic probe task.
    #[must_use]
    pub fn spawn_periodic(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("health monitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = monitor.check().await;
                        debug!(status = %report.status, "periodic health probe");
                    }
                }
            }
        })
    }
}
