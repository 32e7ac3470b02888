use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;

/// Health classification for a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Error rate within the sliding window is below `error_threshold / 2`.
    Healthy,
    /// Error rate is at least half of `error_threshold` but below it.
    Degraded,
    /// Error rate reached `error_threshold`; a restart has been scheduled.
    Unhealthy,
}

/// Sliding-window thresholds governing when a service is restarted.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct SupervisorConfig {
    /// Width of the sliding error-count window.
    pub time_window: Duration,
    /// Errors within `time_window` that mark a service unhealthy.
    pub error_threshold: usize,
    /// Delay before invoking the restart callback.
    pub restart_delay: Duration,
    /// Restarts allowed before the supervisor gives up on a service.
    pub max_restarts: u32,
}

/// A service's registered restart action.
pub type RestartFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ()>> + Send + Sync>;

struct ServiceEntry {
    status: ServiceStatus,
    error_history: VecDeque<Instant>,
    restart_count: Arc<AtomicU32>,
    restart: RestartFn,
}

/// Tracks per-service error rates and restarts services that cross the
/// unhealthy threshold, mirroring the DashMap-keyed tracking shape used
/// elsewhere in this codebase for per-entity concurrent state.
pub struct Supervisor {
    config: SupervisorConfig,
    services: Arc<DashMap<String, ServiceEntry>>,
}

impl Supervisor {
    /// Build a supervisor with the given thresholds; no services registered yet.
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config, services: Arc::new(DashMap::new()) }
    }

    /// Register a service under `name` with its restart action. Starts healthy.
    pub fn register(&self, name: impl Into<String>, restart: RestartFn) {
        self.services.insert(
            name.into(),
            ServiceEntry {
                status: ServiceStatus::Healthy,
                error_history: VecDeque::new(),
                restart_count: Arc::new(AtomicU32::new(0)),
                restart,
            },
        );
    }

    /// Current status of `name`, if registered.
    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.services.get(name).map(|e| e.status)
    }

    /// Restarts attempted for `name` so far, if registered.
    pub fn restart_count(&self, name: &str) -> Option<u32> {
        self.services.get(name).map(|e| e.restart_count.load(Ordering::SeqCst))
    }

    /// Record an error for `name`: appends to the sliding window, prunes
    /// entries outside `time_window`, recomputes status, and schedules a
    /// restart if the service just became unhealthy and restarts remain.
    pub async fn report_error(&self, name: &str) {
        let now = Instant::now();
        let scheduled = {
            let mut entry = match self.services.get_mut(name) {
                Some(e) => e,
                None => return,
            };
            entry.error_history.push_back(now);
            let window = self.config.time_window;
            while let Some(front) = entry.error_history.front() {
                if now.duration_since(*front) > window {
                    entry.error_history.pop_front();
                } else {
                    break;
                }
            }

            let count = entry.error_history.len();
            let previous = entry.status;
            entry.status = if count >= self.config.error_threshold {
                ServiceStatus::Unhealthy
            } else if count * 2 >= self.config.error_threshold {
                ServiceStatus::Degraded
            } else {
                ServiceStatus::Healthy
            };

            let became_unhealthy = previous != ServiceStatus::Unhealthy && entry.status == ServiceStatus::Unhealthy;
            let restarts_remaining =
                entry.restart_count.load(Ordering::SeqCst) < self.config.max_restarts;

            if became_unhealthy && restarts_remaining {
                Some((Arc::clone(&entry.restart), Arc::clone(&entry.restart_count)))
            } else {
                None
            }
        };

        if let Some((restart, restart_count)) = scheduled {
            tracing::warn!(service = name, "supervisor scheduling restart");
            self.schedule_restart(name.to_string(), restart, restart_count);
        }
    }

    fn schedule_restart(&self, name: String, restart: RestartFn, restart_count: Arc<AtomicU32>) {
        let delay = self.config.restart_delay;
        let services = Arc::clone(&self.services);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            restart_count.fetch_add(1, Ordering::SeqCst);
            if restart().await.is_ok() {
                if let Some(mut entry) = services.get_mut(&name) {
                    entry.status = ServiceStatus::Healthy;
                    entry.error_history.clear();
                }
                tracing::info!(service = %name, "supervisor restart succeeded");
            } else {
                tracing::warn!(service = %name, "supervisor restart failed");
            }
        });
    }
}
