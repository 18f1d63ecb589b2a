//! Health Monitor
//!
//! One periodic task covering both broker liveness and per-stream byte flow.
//! A tick first probes the broker API; after enough consecutive failures it
//! restarts the broker (rate limited). With a healthy API it walks the enabled
//! streams, reloading the ones that keep failing or stopped moving bytes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nvr_core::config::HealthConfig;
use nvr_core::models::StreamPatch;
use nvr_core::StreamStateTable;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::api::{BrokerClient, ByteCounters};
use crate::control::BrokerControl;
use crate::registry::StreamRegistry;

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Tells live recorders to reopen their upstream RTSP session.
pub trait RecorderReconnect: Send + Sync {
    /// Returns how many recorders were signalled.
    fn signal_reconnect_all(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct HealthOptions {
    pub interval: Duration,
    pub stream_max_consecutive_failures: u32,
    pub stream_reregistration_cooldown: Duration,
    pub process_max_api_failures: u32,
    pub min_streams_for_consensus: usize,
    pub process_restart_cooldown: Duration,
    pub max_restarts_per_window: usize,
    pub restart_window: Duration,
    pub stuck_stream_max_stalled_checks: u32,
    /// Pause between stop and start, and between re-registration and the reconnect signal.
    pub restart_settle: Duration,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
}

impl From<&HealthConfig> for HealthOptions {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: config.interval(),
            stream_max_consecutive_failures: config.stream_max_consecutive_failures,
            stream_reregistration_cooldown: Duration::from_secs(config.stream_reregistration_cooldown_secs),
            process_max_api_failures: config.process_max_api_failures,
            min_streams_for_consensus: config.min_streams_for_consensus,
            process_restart_cooldown: Duration::from_secs(config.process_restart_cooldown_secs),
            max_restarts_per_window: config.max_restarts_per_window,
            restart_window: Duration::from_secs(config.restart_window_secs),
            stuck_stream_max_stalled_checks: config.stuck_stream_max_stalled_checks,
            restart_settle: Duration::from_secs(2),
            ready_attempts: 10,
            ready_interval: Duration::from_secs(2),
        }
    }
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

/// Result of comparing a stream's byte counters with the previous tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Baseline,
    Flowing,
    Stalled(u32),
    Stuck,
}

/// Per-stream byte counters from the previous tick; `-1` until the first sample.
#[derive(Debug, Clone, Copy)]
pub struct ByteTracker {
    pub last_bytes_recv: i64,
    pub last_bytes_send: i64,
    pub stalled_checks: u32,
    pub last_check: Option<Instant>,
}

impl Default for ByteTracker {
    fn default() -> Self {
        Self {
            last_bytes_recv: -1,
            last_bytes_send: -1,
            stalled_checks: 0,
            last_check: None,
        }
    }
}

impl ByteTracker {
    pub fn observe(&mut self, counters: ByteCounters, max_stalled: u32, now: Instant) -> FlowStatus {
        let recv = i64::try_from(counters.bytes_recv).unwrap_or(i64::MAX);
        let send = i64::try_from(counters.bytes_send).unwrap_or(i64::MAX);
        let first = self.last_bytes_recv < 0 && self.last_bytes_send < 0;
        let flowing = recv > self.last_bytes_recv || send > self.last_bytes_send;

        self.last_bytes_recv = recv;
        self.last_bytes_send = send;
        self.last_check = Some(now);

        if first {
            self.stalled_checks = 0;
            FlowStatus::Baseline
        } else if flowing {
            self.stalled_checks = 0;
            FlowStatus::Flowing
        } else {
            self.stalled_checks += 1;
            if self.stalled_checks >= max_stalled {
                FlowStatus::Stuck
            } else {
                FlowStatus::Stalled(self.stalled_checks)
            }
        }
    }
}

/// Bounded record of broker restarts.
#[derive(Debug, Default)]
pub struct RestartHistory {
    restarts: VecDeque<Instant>,
    consecutive_failures: u32,
    last_restart: Option<Instant>,
    total: u64,
}

impl RestartHistory {
    /// Cooldown since the last restart elapsed and the trailing window has budget left.
    #[must_use]
    pub fn can_restart(&self, now: Instant, options: &HealthOptions) -> bool {
        if self
            .last_restart
            .is_some_and(|last| now.saturating_duration_since(last) < options.process_restart_cooldown)
        {
            return false;
        }
        let recent = self
            .restarts
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < options.restart_window)
            .count();
        recent < options.max_restarts_per_window
    }

    pub fn record(&mut self, at: Instant, capacity: usize) {
        if self.restarts.len() >= capacity.max(1) {
            self.restarts.pop_front();
        }
        self.restarts.push_back(at);
        self.last_restart = Some(at);
        self.total += 1;
        self.consecutive_failures = 0;
    }

    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// What a single tick did; mostly of interest to tests and `check_now` callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy { reloaded: Vec<String> },
    ApiUnhealthy { failures: u32 },
    Restarted,
    RestartFailed,
    RestartSuppressed,
}

struct MonitorInner {
    options: HealthOptions,
    client: Arc<BrokerClient>,
    control: Arc<dyn BrokerControl>,
    registry: Arc<StreamRegistry>,
    states: StreamStateTable,
    recorders: Arc<dyn RecorderReconnect>,
    trackers: Mutex<HashMap<String, ByteTracker>>,
    history: Mutex<RestartHistory>,
    /// One tick at a time, whether from the loop or `check_now`.
    tick_lock: tokio::sync::Mutex<()>,
}

pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        options: HealthOptions,
        registry: Arc<StreamRegistry>,
        states: StreamStateTable,
        recorders: Arc<dyn RecorderReconnect>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                options,
                client: registry.client().clone(),
                control: registry.control().clone(),
                registry,
                states,
                recorders,
                trackers: Mutex::new(HashMap::new()),
                history: Mutex::new(RestartHistory::default()),
                tick_lock: tokio::sync::Mutex::new(()),
            }),
            cancel_token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the periodic loop. The first tick runs one interval from now.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let inner = self.inner.clone();
        let cancel_token = self.cancel_token.clone();
        let period = inner.options.interval;
        info!(interval_secs = period.as_secs(), "Starting health monitor");

        *handle = Some(tokio::spawn(
            async move {
                let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = cancel_token.cancelled() => {
                            info!("Health monitor shutting down");
                            return;
                        }
                        _ = timer.tick() => {
                            let outcome = inner.tick(&cancel_token).await;
                            debug!(?outcome, "Health check complete");
                        }
                    }
                }
            }
            .instrument(info_span!("health_monitor")),
        ));
    }

    /// Cancel the loop and wait (bounded) for it to finish.
    pub async fn stop(&self) {
        self.cancel_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Health monitor did not stop within {JOIN_TIMEOUT:?}");
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Run one tick immediately.
    pub async fn check_now(&self) -> TickOutcome {
        self.inner.tick(&self.cancel_token).await
    }

    #[must_use]
    pub fn restart_count(&self) -> u64 {
        self.inner.history.lock().total
    }

    #[must_use]
    pub fn last_restart_time(&self) -> Option<Instant> {
        self.inner.history.lock().last_restart
    }

    #[must_use]
    pub fn tracker(&self, name: &str) -> Option<ByteTracker> {
        self.inner.trackers.lock().get(name).copied()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl MonitorInner {
    async fn tick(&self, cancel: &CancellationToken) -> TickOutcome {
        let _tick = self.tick_lock.lock().await;

        self.control.invalidate_ready_cache();
        if !self.control.is_ready().await {
            return self.on_api_failure(cancel).await;
        }
        self.history.lock().consecutive_failures = 0;

        let mut reloaded = Vec::new();
        for desc in self.registry.enabled_streams() {
            if cancel.is_cancelled() {
                break;
            }
            let name = desc.name.as_str();

            if self.needs_reregistration(name) {
                warn!(stream = name, "Stream keeps failing, re-registering");
                self.states.mark_reregistered(name, Instant::now());
                match self.registry.reload(name, &StreamPatch::default()).await {
                    Ok(()) => {
                        self.trackers.lock().remove(name);
                        self.states.clear_reconnect(name);
                        reloaded.push(name.to_string());
                    }
                    Err(e) => error!(stream = name, error = %e, "Re-registration failed"),
                }
                continue;
            }

            match self.client.get_stream(name).await {
                Ok(Some(info)) => {
                    let status = self.trackers.lock().entry(name.to_string()).or_default().observe(
                        ByteCounters::from(&info),
                        self.options.stuck_stream_max_stalled_checks,
                        Instant::now(),
                    );
                    match status {
                        FlowStatus::Stalled(checks) => debug!(stream = name, checks, "No byte flow"),
                        FlowStatus::Stuck => {
                            warn!(stream = name, "Stream stuck without byte flow, reloading");
                            self.states.mark_reregistered(name, Instant::now());
                            match self.registry.reload(name, &StreamPatch::default()).await {
                                Ok(()) => reloaded.push(name.to_string()),
                                Err(e) => error!(stream = name, error = %e, "Reload of stuck stream failed"),
                            }
                            self.trackers.lock().remove(name);
                        }
                        FlowStatus::Baseline | FlowStatus::Flowing => {}
                    }
                }
                Ok(None) => {
                    warn!(stream = name, "Stream missing from broker, registering");
                    if let Err(e) = self.registry.register(desc.clone()).await {
                        error!(stream = name, error = %e, "Registration failed");
                    }
                    self.trackers.lock().remove(name);
                }
                Err(e) => debug!(stream = name, error = %e, "Could not read stream counters"),
            }
        }

        TickOutcome::Healthy { reloaded }
    }

    fn needs_reregistration(&self, name: &str) -> bool {
        let Some(status) = self.states.get(name) else {
            return false;
        };
        status.state.is_failing()
            && status.reconnect_attempts >= self.options.stream_max_consecutive_failures
            && status
                .last_reregistration
                .map_or(true, |at| at.elapsed() >= self.options.stream_reregistration_cooldown)
    }

    /// Every enabled stream failing at once points at the broker, not the cameras.
    fn stream_consensus(&self) -> bool {
        let enabled = self.registry.enabled_streams();
        enabled.len() >= self.options.min_streams_for_consensus
            && enabled.iter().all(|d| self.states.state(&d.name).is_failing())
    }

    async fn on_api_failure(&self, cancel: &CancellationToken) -> TickOutcome {
        let (failures, allowed) = {
            let mut history = self.history.lock();
            history.consecutive_failures += 1;
            (history.consecutive_failures, history.can_restart(Instant::now(), &self.options))
        };
        warn!(failures, max = self.options.process_max_api_failures, "Broker API probe failed");

        if failures < self.options.process_max_api_failures {
            return TickOutcome::ApiUnhealthy { failures };
        }

        if self.stream_consensus() {
            warn!("All streams failing, broker fault confirmed");
        } else {
            info!("Streams do not agree on a broker fault; restarting on API failures alone");
        }

        if !allowed {
            warn!(failures, "Broker restart suppressed by rate limit");
            return TickOutcome::RestartSuppressed;
        }

        if self.restart(cancel).await {
            TickOutcome::Restarted
        } else {
            TickOutcome::RestartFailed
        }
    }

    async fn restart(&self, cancel: &CancellationToken) -> bool {
        error!("Restarting broker");
        if let Err(e) = self.control.stop_service().await {
            warn!(error = %e, "Broker stop before restart failed");
        }
        self.control.invalidate_ready_cache();
        self.client.invalidate_cache();
        self.history
            .lock()
            .record(Instant::now(), self.options.max_restarts_per_window);
        tokio::time::sleep(self.options.restart_settle).await;

        if let Err(e) = self.control.start_service().await {
            error!(error = %e, "Broker restart failed");
            return false;
        }

        let mut ready = false;
        for _ in 0..self.options.ready_attempts {
            if cancel.is_cancelled() {
                return false;
            }
            if self.control.is_ready().await {
                ready = true;
                break;
            }
            tokio::time::sleep(self.options.ready_interval).await;
        }
        if !ready {
            error!("Broker did not become ready after restart");
            return false;
        }

        let report = self.registry.register_all().await;
        info!(
            synced = report.synced,
            failed = report.failed,
            "Streams re-registered after broker restart"
        );
        tokio::time::sleep(self.options.restart_settle).await;

        let signalled = self.recorders.signal_reconnect_all();
        info!(recorders = signalled, "Broker restarted");
        self.trackers.lock().clear();
        true
    }
}
