//! Degraded delivery when the persistent channel can not be sustained.
//!
//! The fallback manager keeps an availability estimate of the persistent channel,
//! runs at most one degraded delivery mode at a time and can synthesize a progress
//! narrative from static analysis data. It shares no state with the connection manager.

mod availability;
mod hooks;
mod simulate;
mod status;

pub use availability::{Availability, AvailabilityProbe, ProbeError, TcpProbe};
pub use hooks::FallbackHooks;
pub use simulate::{AnalysisSnapshot, ResultItem};
pub use status::{AnalysisStatus, BoxError, StatusError, StatusProvider, StatusReport};
pub(crate) use status::error as status_error;

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Weak},
    time::Duration,
};

use futures_util::Stream;
use serde::Serialize;
use tokio::{
    sync::{oneshot, Mutex, RwLock},
    task::JoinHandle,
};

use crate::{
    config::{FallbackConfig, FallbackMode},
    event::Event,
    session::now_millis,
};

/// Snapshot of the fallback manager state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackStatus {
    /// active degraded mode
    pub active_mode: Option<FallbackMode>,
    /// why the active mode was entered
    pub reason: Option<String>,
    /// when the active mode was entered, ms since unix epoch
    pub active_since: Option<i64>,
    /// availability estimate
    pub availability: Availability,
    /// time of the last availability check, ms since unix epoch
    pub last_check: Option<i64>,
    /// how many times a mode was activated
    pub activations: u64,
    /// how many times an active mode was left
    pub successful_reconnections: u64,
    /// polling checks performed
    pub polls: u64,
    /// whether the background task of the active mode still runs
    pub worker_running: bool,
    /// analyses polled by the polling loop
    pub tracked_analyses: usize,
}

/// Progress of an analysis obtained without the persistent channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackProgress {
    /// analysis id
    pub analysis_id: String,
    /// mode which produced this answer
    pub mode: FallbackMode,
    /// job state, `Unknown` when the mode can not tell
    pub status: AnalysisStatus,
    /// whether the analysis is done
    pub completed: bool,
    /// 0 - 100
    pub progress: Option<f64>,
    /// result payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// last completed batch, batch mode only
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
    /// notice for the user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FallbackProgress {
    fn new(analysis_id: &str, mode: FallbackMode) -> Self {
        Self {
            analysis_id: analysis_id.to_string(),
            mode,
            status: AnalysisStatus::Unknown,
            completed: false,
            progress: None,
            result: None,
            events: Vec::new(),
            message: None,
        }
    }
}

#[derive(Debug)]
struct ActiveMode {
    mode: FallbackMode,
    reason: String,
    since: i64,
}

#[derive(Debug)]
struct Worker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Batches {
    pending: Vec<Event>,
    completed: Option<Vec<Event>>,
}

#[derive(Debug)]
struct State {
    availability: Availability,
    last_check: Option<i64>,
    active: Option<ActiveMode>,
    activations: u64,
    successful_reconnections: u64,
    polls: u64,
    worker: Option<Worker>,
    batches: Batches,
    tracked: HashMap<String, Option<StatusReport>>,
}

struct Shared {
    config: FallbackConfig,
    provider: Arc<dyn StatusProvider>,
    probe: Arc<dyn AvailabilityProbe>,
    state: Mutex<State>,
    hooks: RwLock<Vec<Arc<dyn FallbackHooks>>>,
}

/// Fallback manager, cheap to clone, clones share the same state.
#[derive(Clone)]
pub struct FallbackManager {
    inner: Arc<Shared>,
}

impl Debug for FallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackManager")
            .field("config", &self.inner.config)
            .field("provider", &self.inner.provider)
            .field("probe", &self.inner.probe)
            .finish_non_exhaustive()
    }
}

impl FallbackManager {
    /// Create a manager probing availability over TCP.
    ///
    /// `config` is taken as is, out of range durations are clamped. Use
    /// [`FallbackConfig::validate`] to reject them instead.
    pub fn new(config: FallbackConfig, provider: Arc<dyn StatusProvider>) -> Self {
        Self::with_probe(config, provider, Arc::new(TcpProbe))
    }

    /// Create a manager with a custom availability probe
    pub fn with_probe(
        config: FallbackConfig,
        provider: Arc<dyn StatusProvider>,
        probe: Arc<dyn AvailabilityProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                provider,
                probe,
                state: Mutex::new(State {
                    availability: Availability::Unknown,
                    last_check: None,
                    active: None,
                    activations: 0,
                    successful_reconnections: 0,
                    polls: 0,
                    worker: None,
                    batches: Batches::default(),
                    tracked: HashMap::new(),
                }),
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// manager config
    pub fn config(&self) -> &FallbackConfig {
        &self.inner.config
    }

    /// Register a transition observer
    pub async fn add_hooks(&self, hooks: Arc<dyn FallbackHooks>) {
        self.inner.hooks.write().await.push(hooks);
    }

    async fn hooks(&self) -> Vec<Arc<dyn FallbackHooks>> {
        self.inner.hooks.read().await.clone()
    }

    /// Probe the persistent channel and update the availability estimate.
    ///
    /// `target` overrides the configured probe target. Without any target the
    /// estimate becomes `Unknown`. Probe failures degrade the estimate, they never error.
    pub async fn check_availability(&self, target: Option<&str>) -> Availability {
        let config = &self.inner.config;
        let target = target
            .map(str::to_string)
            .or_else(|| config.probe_target.clone());

        let estimate = match target {
            None => {
                log::debug!("No probe target, availability unknown");
                Availability::Unknown
            }
            Some(target) => match self
                .inner
                .probe
                .probe(&target, config.connection_timeout())
                .await
            {
                Ok(latency) => {
                    log::debug!("Probe {} answered in {:?}", target, latency);
                    Availability::from_latency(latency, config.slow_connection_threshold())
                }
                Err(err) => {
                    log::warn!("Availability probe failed: {}", err);
                    Availability::Unavailable
                }
            },
        };

        let previous = {
            let mut state = self.inner.state.lock().await;
            state.last_check = Some(now_millis());
            std::mem::replace(&mut state.availability, estimate)
        };

        if previous != estimate {
            log::info!("Availability changed from {:?} to {:?}", previous, estimate);
            for hook in self.hooks().await {
                hook.on_availability_change(previous, estimate).await;
            }
        }

        estimate
    }

    /// Current availability estimate, as of the last check
    pub async fn availability(&self) -> Availability {
        self.inner.state.lock().await.availability
    }

    /// Active degraded mode
    pub async fn active_mode(&self) -> Option<FallbackMode> {
        self.inner
            .state
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.mode)
    }

    /// Enter a degraded mode, `mode` defaults to the configured primary mode.
    ///
    /// No-op if a mode is already active. Always returns true.
    pub async fn activate_fallback(&self, reason: &str, mode: Option<FallbackMode>) -> bool {
        let mode = mode.unwrap_or(self.inner.config.primary_mode);

        {
            let mut state = self.inner.state.lock().await;

            if let Some(active) = &state.active {
                log::debug!(
                    "Fallback {} already active, ignore activation of {}",
                    active.mode,
                    mode
                );
                return true;
            }

            state.worker = self.spawn_worker(mode);
            state.active = Some(ActiveMode {
                mode,
                reason: reason.to_string(),
                since: now_millis(),
            });
            state.activations += 1;
        }

        log::info!("Fallback {} activated: {}", mode, reason);

        for hook in self.hooks().await {
            hook.on_activate(mode, reason).await;
        }

        true
    }

    fn spawn_worker(&self, mode: FallbackMode) -> Option<Worker> {
        let config = &self.inner.config;
        let shared = Arc::downgrade(&self.inner);
        let (stop, stop_rx) = oneshot::channel();

        let handle = match mode {
            FallbackMode::Polling => tokio::spawn(poll(
                shared,
                config.polling_interval(),
                config.max_polling_duration(),
                stop_rx,
            )),
            FallbackMode::BatchUpdates => {
                tokio::spawn(flush_batches(shared, config.batch_interval(), stop_rx))
            }
            FallbackMode::CompletionOnly | FallbackMode::Offline => return None,
        };

        Some(Worker { stop, handle })
    }

    /// Leave the active degraded mode, stopping its background task.
    ///
    /// Returns false if no mode is active.
    pub async fn deactivate_fallback(&self, reason: &str) -> bool {
        let (active, worker) = {
            let mut state = self.inner.state.lock().await;

            let active = match state.active.take() {
                Some(active) => active,
                None => {
                    log::trace!("No fallback active, skip deactivation");
                    return false;
                }
            };

            state.successful_reconnections += 1;
            state.batches = Batches::default();
            (active, state.worker.take())
        };

        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            // a hook driven by the worker itself, it stops at its next suspension point
            if tokio::task::try_id() == Some(worker.handle.id()) {
                log::debug!("Fallback {} left from its own worker", active.mode);
            } else if let Err(err) = worker.handle.await {
                log::warn!("Fallback {} worker ended abnormally: {}", active.mode, err);
            }
        }

        log::info!(
            "Fallback {} deactivated after {}ms: {}",
            active.mode,
            now_millis() - active.since,
            reason
        );

        for hook in self.hooks().await {
            hook.on_deactivate(active.mode, reason).await;
        }

        true
    }

    /// Register an analysis for the polling loop
    pub async fn track_analysis<S: Into<String>>(&self, analysis_id: S) {
        self.inner
            .state
            .lock()
            .await
            .tracked
            .entry(analysis_id.into())
            .or_insert(None);
    }

    /// Last status the polling loop saw for a tracked analysis
    pub async fn latest_status(&self, analysis_id: &str) -> Option<StatusReport> {
        self.inner
            .state
            .lock()
            .await
            .tracked
            .get(analysis_id)
            .cloned()
            .flatten()
    }

    async fn polling_check(&self) {
        let tracked: Vec<String> = {
            let mut state = self.inner.state.lock().await;
            state.polls += 1;
            state.tracked.keys().cloned().collect()
        };

        self.check_availability(None).await;

        for analysis_id in tracked {
            match self.inner.provider.get_status(&analysis_id).await {
                Ok(report) => {
                    log::trace!("Polled analysis {}: {:?}", analysis_id, report.status);
                    let mut state = self.inner.state.lock().await;
                    if let Some(slot) = state.tracked.get_mut(&analysis_id) {
                        *slot = Some(report);
                    }
                }
                Err(err) => log::warn!("Polling check failed: {}", err),
            }
        }
    }

    /// Add an event to the pending batch, batch mode only.
    ///
    /// A batch completes when it holds `batch_size` events.
    pub async fn push_batch_event(&self, event: Event) -> bool {
        let mut state = self.inner.state.lock().await;

        if !matches!(
            state.active,
            Some(ActiveMode {
                mode: FallbackMode::BatchUpdates,
                ..
            })
        ) {
            return false;
        }

        state.batches.pending.push(event);
        if state.batches.pending.len() >= self.inner.config.batch_size {
            let batch = std::mem::take(&mut state.batches.pending);
            log::debug!("Batch of {} events complete", batch.len());
            state.batches.completed = Some(batch);
        }

        true
    }

    /// Complete the pending batch early, returns its size
    pub async fn flush_batch(&self) -> usize {
        let mut state = self.inner.state.lock().await;

        if state.batches.pending.is_empty() {
            return 0;
        }

        let batch = std::mem::take(&mut state.batches.pending);
        let size = batch.len();
        state.batches.completed = Some(batch);

        log::debug!("Flushed batch of {} events", size);

        size
    }

    /// Progress of an analysis through the active mode (or the primary mode if none is active)
    pub async fn get_analysis_progress_fallback(
        &self,
        analysis_id: &str,
    ) -> Result<FallbackProgress, StatusError> {
        let mode = self
            .active_mode()
            .await
            .unwrap_or(self.inner.config.primary_mode);
        let mut progress = FallbackProgress::new(analysis_id, mode);

        match mode {
            FallbackMode::CompletionOnly => {
                progress.completed = self.inner.provider.is_complete(analysis_id).await?;
                if progress.completed {
                    progress.status = AnalysisStatus::Completed;
                    progress.progress = Some(100.0);
                }
            }
            FallbackMode::Polling => {
                let report = self.inner.provider.get_status(analysis_id).await?;

                progress.status = report.status;
                progress.completed = report.status == AnalysisStatus::Completed;
                progress.progress = report.progress;
                progress.result = report.result.clone();

                let mut state = self.inner.state.lock().await;
                if let Some(slot) = state.tracked.get_mut(analysis_id) {
                    *slot = Some(report);
                }
            }
            FallbackMode::BatchUpdates => {
                let events = self
                    .inner
                    .state
                    .lock()
                    .await
                    .batches
                    .completed
                    .clone()
                    .unwrap_or_default();

                progress.status = batch_status(&events);
                progress.completed = progress.status == AnalysisStatus::Completed;
                progress.progress = events
                    .iter()
                    .filter_map(Event::progress_percent)
                    .fold(None, |max: Option<f64>, p| Some(max.map_or(p, |m| m.max(p))));
                progress.events = events;
            }
            FallbackMode::Offline => {}
        }

        progress.message = self.get_user_feedback_message().await;

        Ok(progress)
    }

    /// Notice explaining the degraded mode, `None` when no mode is active or notices are off
    pub async fn get_user_feedback_message(&self) -> Option<String> {
        if !self.inner.config.show_fallback_notice {
            return None;
        }

        let state = self.inner.state.lock().await;
        state
            .active
            .as_ref()
            .map(|_| self.inner.config.fallback_message.clone())
    }

    /// State snapshot
    pub async fn fallback_status(&self) -> FallbackStatus {
        let state = self.inner.state.lock().await;

        FallbackStatus {
            active_mode: state.active.as_ref().map(|active| active.mode),
            reason: state.active.as_ref().map(|active| active.reason.clone()),
            active_since: state.active.as_ref().map(|active| active.since),
            availability: state.availability,
            last_check: state.last_check,
            activations: state.activations,
            successful_reconnections: state.successful_reconnections,
            polls: state.polls,
            worker_running: matches!(&state.worker, Some(worker) if !worker.handle.is_finished()),
            tracked_analyses: state.tracked.len(),
        }
    }

    /// Try to get back to the persistent channel.
    ///
    /// Each attempt re-checks availability. When the channel is available the
    /// active mode is left and true is returned, otherwise the attempt backs off
    /// `retry_delay * retry_backoff ^ attempt`. `max_attempts` defaults to the configured count.
    pub async fn attempt_graceful_reconnection(&self, max_attempts: Option<u32>) -> bool {
        let attempts = max_attempts.unwrap_or(self.inner.config.max_retry_attempts);

        for attempt in 0..attempts {
            log::debug!("Reconnection attempt {}/{}", attempt + 1, attempts);

            if self.check_availability(None).await == Availability::Available {
                self.deactivate_fallback("persistent channel available again")
                    .await;
                log::info!("Reconnection succeeded after {} attempts", attempt + 1);
                return true;
            }

            let delay = self.inner.config.retry_delay(attempt);
            log::debug!("Persistent channel still unavailable, retry in {:?}", delay);
            tokio::time::sleep(delay).await;
        }

        log::warn!("Reconnection failed after {} attempts", attempts);
        false
    }

    /// Synthesized progress narrative of `snapshot`, spaced by the configured delay
    pub fn simulate_streaming_events(
        &self,
        snapshot: AnalysisSnapshot,
    ) -> impl Stream<Item = Event> + Send {
        simulate::simulate(snapshot, self.inner.config.simulated_event_delay())
    }
}

fn batch_status(events: &[Event]) -> AnalysisStatus {
    if events.iter().any(|e| e.as_analysis_completed().is_some()) {
        AnalysisStatus::Completed
    } else if events.iter().any(|e| e.as_analysis_error().is_some()) {
        AnalysisStatus::Failed
    } else if events.is_empty() {
        AnalysisStatus::Unknown
    } else {
        AnalysisStatus::Running
    }
}

async fn poll(
    shared: Weak<Shared>,
    interval: Duration,
    max_duration: Duration,
    stop: oneshot::Receiver<()>,
) {
    log::debug!(
        "Polling loop start, every {:?} for at most {:?}",
        interval,
        max_duration
    );

    let run = async {
        loop {
            match shared.upgrade() {
                Some(inner) => FallbackManager { inner }.polling_check().await,
                None => return,
            }
            tokio::time::sleep(interval).await;
        }
    };

    tokio::select! {
        biased;

        _ = stop => log::debug!("Polling loop stopped"),
        result = tokio::time::timeout(max_duration, run) => match result {
            Ok(()) => log::debug!("Fallback manager dropped, polling loop exit"),
            Err(_) => log::info!("Polling loop reached max duration {:?}", max_duration),
        },
    }
}

async fn flush_batches(
    shared: Weak<Shared>,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = &mut stop => break,
            _ = ticker.tick() => match shared.upgrade() {
                Some(inner) => {
                    FallbackManager { inner }.flush_batch().await;
                }
                None => break,
            },
        }
    }

    log::debug!("Batch flush timer stopped");
}
