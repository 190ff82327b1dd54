//! Turns an approved action into a gateway command and writes the outcome
//! back into the state store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::db::{ActionEvent, Db};
use crate::device::{Action, Source};
use crate::error::{ActionError, GatewayError};
use crate::gateway::ActuatorGateway;
use crate::state::{ActionRecord, SharedState};

pub struct Executor {
    gateway: Arc<dyn ActuatorGateway>,
    state: SharedState,
    journal: Option<Db>,
    timeout: Duration,
}

impl Executor {
    pub fn new(gateway: Arc<dyn ActuatorGateway>, state: SharedState, timeout: Duration) -> Self {
        Self {
            gateway,
            state,
            journal: None,
            timeout,
        }
    }

    pub fn with_journal(mut self, db: Db) -> Self {
        self.journal = Some(db);
        self
    }

    /// Send one command. Device status and the last-action record change only
    /// when the gateway confirms; failures are not retried.
    pub async fn execute(&self, action: Action, source: Source) -> Result<(), ActionError> {
        let device = action.device();
        let sent = match tokio::time::timeout(self.timeout, self.gateway.send(action)).await {
            Ok(r) => r,
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
        };

        match sent {
            Ok(()) => {
                self.state.update_devices(action.into()).await;
                self.state
                    .record_action(ActionRecord {
                        device,
                        action,
                        timestamp: self.state.now(),
                        source,
                    })
                    .await;
                info!(device = %device, action = %action, source = %source, "action executed");
                self.journal(action, source, "ok").await;
                Ok(())
            }
            Err(cause) => {
                warn!(device = %device, action = %action, source = %source, error = %cause, "action failed");
                self.state
                    .record_error(format!("{action} by {source} failed: {cause}"))
                    .await;
                self.journal(action, source, &format!("error: {cause}")).await;
                Err(ActionError::Gateway { device, cause })
            }
        }
    }

    async fn journal(&self, action: Action, source: Source, result: &str) {
        let Some(db) = &self.journal else { return };
        let event = ActionEvent {
            ts: self.state.now().unix_timestamp(),
            device: action.device().to_string(),
            action: action.to_string(),
            source: source.to_string(),
            result: result.to_string(),
        };
        if let Err(e) = db.insert_action_event(&event).await {
            warn!(error = %e, "failed to journal action");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
