//! Scheduler driver: the once-per-minute tick that feeds evaluator output into
//! the pipeline.
//!
//! ```text
//!  start ──▶ 2 s delay ──▶ tick every 60 s ──▶ check_schedules(now)
//!                                                  │
//!                      same minute as last tick? ──┴── yes ──▶ skip
//!                                                  │
//!                                                  no
//!                                                  ▼
//!                            evaluate(preset, sensors, devices) ──▶ submit each
//! ```
//!
//! There is one driver per process. It is built once in `main` and handed
//! around by cheap clones of the same handle.
//!
//! Stopping is cooperative: the loop only listens for the stop signal while it
//! waits for the next tick, so a cycle that has started always runs to the end
//! (gateway reply, action record, reversal) before the loop exits.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::{hhmm, minute_of_day};
use crate::device::{Action, Source};
use crate::evaluator::{self, Trigger};
use crate::gateway::SensorSource;
use crate::pipeline::{Outcome, Pipeline};
use crate::preset::DeviceConfig;
use crate::state::SharedState;

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Lets the first sensor poll land before the first evaluation.
const STARTUP_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TickResult {
    pub action: Action,
    pub trigger: Trigger,
    /// Error text when the action could not be carried out.
    pub outcome: Result<Outcome, String>,
}

/// Everything one non-duplicate tick attempted.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub minute: u16,
    pub results: Vec<TickResult>,
}

/// Result of switching presets.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub preset: String,
    /// What the immediate fan check asked for, if anything.
    pub fan: Option<Action>,
    pub outcome: Option<Result<Outcome, String>>,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    pipeline: Arc<Pipeline>,
    sensors: Arc<dyn SensorSource>,
    config: RwLock<Option<DeviceConfig>>,
    tick: Mutex<Option<TickTask>>,
    cancel_reversals_on_activate: bool,
}

struct TickTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl TickTask {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Driver {
    pub fn new(
        pipeline: Arc<Pipeline>,
        sensors: Arc<dyn SensorSource>,
        cancel_reversals_on_activate: bool,
    ) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                pipeline,
                sensors,
                config: RwLock::new(None),
                tick: Mutex::new(None),
                cancel_reversals_on_activate,
            }),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }

    fn state(&self) -> &SharedState {
        self.inner.pipeline.state()
    }

    pub async fn active_config(&self) -> Option<DeviceConfig> {
        self.inner.config.read().await.clone()
    }

    /// Start the tick loop. Returns `false`, leaving the running loop alone,
    /// if one is already going.
    pub async fn start(&self) -> bool {
        let mut tick = self.inner.tick.lock().await;
        if tick.as_ref().is_some_and(TickTask::is_live) {
            debug!("driver already running");
            return false;
        }

        let (stop, stopped) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_loop(stopped).await });
        *tick = Some(TickTask { handle, stop });
        drop(tick);

        self.state().update_scheduler(|s| s.running = true).await;
        info!(tick_sec = TICK_INTERVAL.as_secs(), "driver started");
        true
    }

    /// Stop the tick loop, waiting for a cycle already in progress to
    /// finish. Armed reversals are left alone.
    pub async fn stop(&self) {
        let task = self.inner.tick.lock().await.take();
        if let Some(task) = task {
            task.stop.send_replace(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "tick loop ended abnormally");
            }
            info!("driver stopped");
        }
        self.state().update_scheduler(|s| s.running = false).await;
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .tick
            .lock()
            .await
            .as_ref()
            .is_some_and(TickTask::is_live)
    }

    /// One evaluation cycle. Returns `None` when this minute was already
    /// processed or no preset is active.
    pub async fn check_schedules(&self, now: OffsetDateTime) -> Option<TickReport> {
        self.inner.check_schedules(now).await
    }

    /// Switch presets: stop the tick, run the fan threshold check right away
    /// (ignoring the check interval), then start the tick again.
    pub async fn activate(&self, config: DeviceConfig) -> Activation {
        self.stop().await;
        if self.inner.cancel_reversals_on_activate {
            self.inner.pipeline.cancel_reversals().await;
        }

        let name = config.name.clone();
        *self.inner.config.write().await = Some(config.clone());
        let state = self.state();
        state
            .update_scheduler(|s| {
                s.active_preset = Some(name.clone());
                s.cover_overheat = false;
            })
            .await;
        state.record_scheduler(format!("preset '{name}' activated")).await;
        info!(preset = %name, "preset activated");

        let activation = self.inner.immediate_fan_check(&config).await;
        self.start().await;
        activation
    }
}

impl DriverInner {
    async fn run_loop(self: Arc<Self>, mut stopped: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(STARTUP_DELAY) => {}
            _ = stopped.changed() => return,
        }

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped.changed() => break,
            }
            let now = self.pipeline.state().now();
            self.check_schedules(now).await;
        }
        debug!("tick loop exited");
    }

    async fn check_schedules(&self, now: OffsetDateTime) -> Option<TickReport> {
        let Some(config) = self.config.read().await.clone() else {
            debug!("tick skipped: no active preset");
            return None;
        };

        let state = self.pipeline.state();
        let minute = minute_of_day(now);
        let mut fresh = false;
        let mut was_hot = false;
        state
            .update_scheduler(|s| {
                if s.last_minute != Some(minute) {
                    s.last_minute = Some(minute);
                    fresh = true;
                }
                was_hot = s.cover_overheat;
            })
            .await;
        if !fresh {
            debug!(minute = %hhmm(minute), "tick skipped: minute already processed");
            return None;
        }

        let sensors = state.sensors().await;
        let devices = state.devices().await;
        let candidates = evaluator::evaluate(now, &config, &sensors, &devices, was_hot);
        let hot = evaluator::cover_overheated(&config.cover, &sensors, was_hot);
        if hot != was_hot {
            info!(hot, temperature = ?sensors.temperature, "cover override changed");
            state.update_scheduler(|s| s.cover_overheat = hot).await;
        }
        if !candidates.is_empty() {
            state
                .record_scheduler(format!(
                    "{}: {} candidate action(s)",
                    hhmm(minute),
                    candidates.len()
                ))
                .await;
        }

        let mut results = Vec::with_capacity(candidates.len());
        for c in candidates {
            let action = c.action;
            let trigger = c.trigger.clone();
            let outcome = self
                .pipeline
                .submit(c, Source::Scheduler)
                .await
                .map_err(|e| e.to_string());
            results.push(TickResult {
                action,
                trigger,
                outcome,
            });
        }
        Some(TickReport { minute, results })
    }

    async fn immediate_fan_check(&self, config: &DeviceConfig) -> Activation {
        let state = self.pipeline.state();
        match self.sensors.latest().await {
            Ok(update) => state.update_sensors(update).await,
            Err(e) => warn!(error = %e, "sensor refresh failed; using last known values"),
        }

        let sensors = state.sensors().await;
        let devices = state.devices().await;
        let Some(candidate) = evaluator::fan_candidate(&config.fan, &sensors, &devices) else {
            return Activation {
                preset: config.name.clone(),
                fan: None,
                outcome: None,
            };
        };

        let fan = candidate.action;
        let outcome = self
            .pipeline
            .submit(candidate, Source::Scheduler)
            .await
            .map_err(|e| e.to_string());
        Activation {
            preset: config.name.clone(),
            fan: Some(fan),
            outcome: Some(outcome),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
