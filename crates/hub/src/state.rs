//! The single in-memory record of what the hub knows: sensor values, device
//! statuses, scheduler metadata and conflicts.
//!
//! Each section sits behind its own lock, so a sensor refresh never waits on a
//! conflict write. Read-modify-write within a section happens under that
//! section's write guard.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::conflict::ResolutionPolicy;
use crate::device::{Action, CoverPosition, Device, Source};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<StateStore>;

// ---------------------------------------------------------------------------
// Section types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub light_intensity: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
}

/// Partial sensor update; `None` leaves a channel untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorUpdate {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub light_intensity: Option<f64>,
}

impl SensorUpdate {
    pub fn is_empty(&self) -> bool {
        *self == SensorUpdate::default()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceStatus {
    pub pump: bool,
    pub fan: bool,
    pub cover: CoverPosition,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
}

impl DeviceStatus {
    /// What the device currently reports, expressed as an action.
    pub fn current(&self, device: Device) -> Action {
        match device {
            Device::Pump => Action::Pump { on: self.pump },
            Device::Fan => Action::Fan { on: self.fan },
            Device::Cover => Action::Cover {
                position: self.cover,
            },
        }
    }
}

/// Partial device update; `None` leaves a device untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub pump: Option<bool>,
    pub fan: Option<bool>,
    pub cover: Option<CoverPosition>,
}

impl DeviceUpdate {
    pub fn is_empty(&self) -> bool {
        *self == DeviceUpdate::default()
    }
}

impl From<Action> for DeviceUpdate {
    fn from(action: Action) -> Self {
        let mut u = DeviceUpdate::default();
        match action {
            Action::Pump { on } => u.pump = Some(on),
            Action::Fan { on } => u.fan = Some(on),
            Action::Cover { position } => u.cover = Some(position),
        }
        u
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub device: Device,
    pub action: Action,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source: Source,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_preset: Option<String>,
    /// Most recent executed action per device.
    pub last_actions: HashMap<Device, ActionRecord>,
    /// Most recent executed action across all devices.
    pub last_action: Option<ActionRecord>,
    pub last_minute: Option<u16>,
    pub pending_reversals: usize,
    /// The cover is held closed because it got too hot.
    pub cover_overheat: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictAlert {
    pub id: String,
    pub device: Device,
    pub scheduled_action: Action,
    /// Who wanted `scheduled_action`.
    pub source: Source,
    /// Reversal to arm if `scheduled_action` is eventually executed.
    pub revert_after_min: Option<u32>,
    pub current_status: Action,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Everything needed to raise an alert; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct ConflictDraft {
    pub scheduled_action: Action,
    pub source: Source,
    pub revert_after_min: Option<u32>,
    pub current_status: Action,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictResolution {
    pub conflict_id: String,
    pub device: Device,
    pub resolution: Source,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictBook {
    pub policy: ResolutionPolicy,
    pub alerts: Vec<ConflictAlert>,
    pub resolutions: VecDeque<ConflictResolution>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
    #[serde(skip)]
    next_id: u64,
    #[serde(skip)]
    log_size: usize,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Action,
    Conflict,
    Scheduler,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct Snapshot {
    pub uptime_secs: u64,
    pub sensors: SensorSnapshot,
    pub devices: DeviceStatus,
    pub scheduler: SchedulerStatus,
    pub conflicts: ConflictBook,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct StateStore {
    clock: Arc<dyn Clock>,
    started_at: Instant,
    sensors: RwLock<SensorSnapshot>,
    devices: RwLock<DeviceStatus>,
    scheduler: RwLock<SchedulerStatus>,
    conflicts: RwLock<ConflictBook>,
    events: RwLock<VecDeque<SystemEvent>>,
}

impl StateStore {
    pub fn new(clock: Arc<dyn Clock>, policy: ResolutionPolicy, resolution_log_size: usize) -> Self {
        Self {
            clock,
            started_at: Instant::now(),
            sensors: RwLock::new(SensorSnapshot::default()),
            devices: RwLock::new(DeviceStatus::default()),
            scheduler: RwLock::new(SchedulerStatus::default()),
            conflicts: RwLock::new(ConflictBook {
                policy,
                alerts: Vec::new(),
                resolutions: VecDeque::with_capacity(resolution_log_size),
                last_update: None,
                next_id: 1,
                log_size: resolution_log_size.max(1),
            }),
            events: RwLock::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    // ── Reads ───────────────────────────────────────────────────

    pub async fn sensors(&self) -> SensorSnapshot {
        self.sensors.read().await.clone()
    }

    pub async fn devices(&self) -> DeviceStatus {
        self.devices.read().await.clone()
    }

    pub async fn scheduler(&self) -> SchedulerStatus {
        self.scheduler.read().await.clone()
    }

    pub async fn last_action(&self, device: Device) -> Option<ActionRecord> {
        self.scheduler.read().await.last_actions.get(&device).cloned()
    }

    pub async fn policy(&self) -> ResolutionPolicy {
        self.conflicts.read().await.policy
    }

    pub async fn conflict(&self, id: &str) -> Option<ConflictAlert> {
        self.conflicts
            .read()
            .await
            .alerts
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    pub async fn conflicts(&self) -> Vec<ConflictAlert> {
        self.conflicts.read().await.alerts.clone()
    }

    pub async fn resolutions(&self) -> Vec<ConflictResolution> {
        self.conflicts.read().await.resolutions.iter().cloned().collect()
    }

    /// Build the JSON-serialisable snapshot, one section at a time.
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            sensors: self.sensors().await,
            devices: self.devices().await,
            scheduler: self.scheduler().await,
            conflicts: self.conflicts.read().await.clone(),
            events: self.events.read().await.iter().rev().cloned().collect(),
        }
    }

    // ── Updates ─────────────────────────────────────────────────

    pub async fn update_sensors(&self, update: SensorUpdate) {
        let now = self.now();
        let mut s = self.sensors.write().await;
        if let Some(v) = update.temperature {
            s.temperature = Some(v);
        }
        if let Some(v) = update.humidity {
            s.humidity = Some(v);
        }
        if let Some(v) = update.soil_moisture {
            s.soil_moisture = Some(v);
        }
        if let Some(v) = update.light_intensity {
            s.light_intensity = Some(v);
        }
        s.last_update = Some(now);
    }

    pub async fn update_devices(&self, update: DeviceUpdate) {
        let now = self.now();
        let mut d = self.devices.write().await;
        if let Some(on) = update.pump {
            d.pump = on;
        }
        if let Some(on) = update.fan {
            d.fan = on;
        }
        if let Some(p) = update.cover {
            d.cover = p;
        }
        d.last_update = Some(now);
    }

    /// Apply `f` to the scheduler section under its write lock.
    pub async fn update_scheduler<F>(&self, f: F)
    where
        F: FnOnce(&mut SchedulerStatus),
    {
        let now = self.now();
        let mut s = self.scheduler.write().await;
        f(&mut s);
        s.last_update = Some(now);
    }

    /// Replace the device's last action record.
    pub async fn record_action(&self, record: ActionRecord) {
        let detail = format!("{} by {}", record.action, record.source);
        {
            let now = self.now();
            let mut s = self.scheduler.write().await;
            s.last_actions.insert(record.device, record.clone());
            s.last_action = Some(record);
            s.last_update = Some(now);
        }
        self.push_event(EventKind::Action, detail).await;
    }

    pub async fn set_policy(&self, policy: ResolutionPolicy) {
        let now = self.now();
        {
            let mut book = self.conflicts.write().await;
            book.policy = policy;
            book.last_update = Some(now);
        }
        self.push_event(EventKind::System, format!("resolution policy set to {policy}"))
            .await;
    }

    /// Raise an alert for the draft's device, replacing any unresolved one.
    pub async fn add_conflict(&self, draft: ConflictDraft) -> ConflictAlert {
        let now = self.now();
        let device = draft.scheduled_action.device();
        let alert = {
            let mut book = self.conflicts.write().await;
            let id = format!("conflict-{}", book.next_id);
            book.next_id += 1;
            let alert = ConflictAlert {
                id,
                device,
                scheduled_action: draft.scheduled_action,
                source: draft.source,
                revert_after_min: draft.revert_after_min,
                current_status: draft.current_status,
                message: draft.message,
                timestamp: now,
            };
            book.alerts.retain(|a| a.device != device);
            book.alerts.push(alert.clone());
            book.last_update = Some(now);
            alert
        };
        self.push_event(EventKind::Conflict, format!("{}: {}", alert.id, alert.message))
            .await;
        alert
    }

    /// Remove an alert and append its resolution to the trailing log.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        resolution: Source,
    ) -> Option<(ConflictAlert, ConflictResolution)> {
        let now = self.now();
        let resolved = {
            let mut book = self.conflicts.write().await;
            let idx = book.alerts.iter().position(|a| a.id == id)?;
            let alert = book.alerts.remove(idx);
            let record = ConflictResolution {
                conflict_id: alert.id.clone(),
                device: alert.device,
                resolution,
                timestamp: now,
            };
            if book.resolutions.len() >= book.log_size {
                book.resolutions.pop_front();
            }
            book.resolutions.push_back(record.clone());
            book.last_update = Some(now);
            (alert, record)
        };
        self.push_event(
            EventKind::Conflict,
            format!("{id} resolved in favour of {resolution}"),
        )
        .await;
        Some(resolved)
    }

    // ── Events ──────────────────────────────────────────────────

    pub async fn record_error(&self, detail: String) {
        self.push_event(EventKind::Error, detail).await;
    }

    pub async fn record_scheduler(&self, detail: String) {
        self.push_event(EventKind::Scheduler, detail).await;
    }

    pub async fn record_system(&self, detail: String) {
        self.push_event(EventKind::System, detail).await;
    }

    async fn push_event(&self, kind: EventKind, detail: String) {
        let ts = self.now();
        let mut events = self.events.write().await;
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(SystemEvent { ts, kind, detail });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
