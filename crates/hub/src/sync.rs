//! Periodic refresh of sensor values and device statuses from the gateway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::gateway::{ActuatorGateway, SensorSource};
use crate::state::SharedState;

pub struct StateSync {
    sensors: Arc<dyn SensorSource>,
    gateway: Arc<dyn ActuatorGateway>,
    state: SharedState,
    healthy: AtomicBool,
}

impl StateSync {
    pub fn new(
        sensors: Arc<dyn SensorSource>,
        gateway: Arc<dyn ActuatorGateway>,
        state: SharedState,
    ) -> Self {
        Self {
            sensors,
            gateway,
            state,
            healthy: AtomicBool::new(true),
        }
    }

    /// One poll of both endpoints. A failed endpoint leaves its section at
    /// the last known values. Returns whether both calls succeeded.
    pub async fn refresh(&self) -> bool {
        let mut problems = Vec::new();

        match self.sensors.latest().await {
            Ok(u) if u.is_empty() => debug!("sensor poll returned no known channels"),
            Ok(u) => self.state.update_sensors(u).await,
            Err(e) => problems.push(format!("sensor poll failed: {e}")),
        }
        match self.gateway.device_statuses().await {
            Ok(u) if u.is_empty() => debug!("device poll returned no known devices"),
            Ok(u) => self.state.update_devices(u).await,
            Err(e) => problems.push(format!("device poll failed: {e}")),
        }

        let ok = problems.is_empty();
        let was_ok = self.healthy.swap(ok, Ordering::Relaxed);
        match (was_ok, ok) {
            (true, false) => {
                for p in problems {
                    warn!("{p}");
                    self.state.record_error(p).await;
                }
            }
            (false, true) => {
                info!("gateway polling recovered");
                self.state
                    .record_system("gateway polling recovered".to_string())
                    .await;
            }
            (false, false) => {
                for p in &problems {
                    debug!("{p}");
                }
            }
            (true, true) => {}
        }
        ok
    }

    pub async fn run(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(poll_sec = every.as_secs(), "state sync started");
        loop {
            ticker.tick().await;
            self.refresh().await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
