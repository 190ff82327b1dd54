//! Detect → execute, shared by scheduler ticks, operator commands and
//! reversal timers.
//!
//! Every candidate goes through conflict detection first. A collision either
//! parks the candidate as a pending alert (`always_ask`) or is settled on the
//! spot for the policy's winner. Successful actions with a run time arm a
//! reversal that later re-enters [`Pipeline::submit`] as `scheduler`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::conflict;
use crate::device::{Action, Device, Source};
use crate::error::ActionError;
use crate::evaluator::Candidate;
use crate::executor::Executor;
use crate::reversal::ReversalQueue;
use crate::state::SharedState;

/// What happened to a submitted candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Executed,
    /// Parked until an operator resolves the alert.
    Pending { conflict_id: String },
    /// The alert was settled; `executed` tells whether the action ran.
    Resolved {
        conflict_id: String,
        resolution: Source,
        executed: bool,
    },
}

pub struct Pipeline {
    state: SharedState,
    executor: Executor,
    reversals: ReversalQueue,
    window: Duration,
}

impl Pipeline {
    pub fn new(state: SharedState, executor: Executor, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            state,
            executor,
            reversals: ReversalQueue::default(),
            window,
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub async fn submit(
        self: &Arc<Self>,
        candidate: Candidate,
        source: Source,
    ) -> Result<Outcome, ActionError> {
        let Some(alert) = conflict::detect(&self.state, &candidate, source, self.window).await else {
            self.run(candidate.action, candidate.revert_after_min, source)
                .await?;
            return Ok(Outcome::Executed);
        };

        let Some(winner) = self.state.policy().await.winner() else {
            info!(conflict_id = %alert.id, device = %alert.device, "conflict awaiting operator");
            return Ok(Outcome::Pending {
                conflict_id: alert.id,
            });
        };

        self.state.resolve_conflict(&alert.id, winner).await;
        let executed = winner == source;
        info!(
            conflict_id = %alert.id,
            resolution = %winner,
            executed,
            "conflict auto-resolved"
        );
        if executed {
            self.run(candidate.action, candidate.revert_after_min, source)
                .await?;
        }
        Ok(Outcome::Resolved {
            conflict_id: alert.id,
            resolution: winner,
            executed,
        })
    }

    /// Settle a pending alert. Choosing the alert's own source executes its
    /// parked action; choosing the other side executes nothing. If execution
    /// fails the alert stays pending.
    pub async fn resolve_conflict(
        self: &Arc<Self>,
        id: &str,
        choice: Source,
    ) -> Result<Outcome, ActionError> {
        let alert = self
            .state
            .conflict(id)
            .await
            .ok_or_else(|| ActionError::UnknownConflict(id.to_string()))?;

        let executed = choice == alert.source;
        if executed {
            self.run(alert.scheduled_action, alert.revert_after_min, alert.source)
                .await?;
        }

        if self.state.resolve_conflict(id, choice).await.is_none() {
            // Replaced by a newer collision while the command was in flight.
            return Err(ActionError::UnknownConflict(id.to_string()));
        }
        info!(conflict_id = %id, resolution = %choice, executed, "conflict resolved");
        Ok(Outcome::Resolved {
            conflict_id: alert.id,
            resolution: choice,
            executed,
        })
    }

    /// Drop every armed reversal.
    pub async fn cancel_reversals(&self) -> usize {
        let dropped = self.reversals.cancel_all();
        self.sync_pending().await;
        if dropped > 0 {
            info!(dropped, "pending reversals cancelled");
        }
        dropped
    }

    async fn run(
        self: &Arc<Self>,
        action: Action,
        revert_after_min: Option<u32>,
        source: Source,
    ) -> Result<(), ActionError> {
        self.executor.execute(action, source).await?;
        if let Some(minutes) = revert_after_min {
            self.schedule_reversal(action.device(), minutes);
            self.sync_pending().await;
        }
        Ok(())
    }

    // Sync so that the spawned future does not become part of submit's own
    // future type.
    fn schedule_reversal(self: &Arc<Self>, device: Device, minutes: u32) {
        let Some(candidate) = Candidate::reversal(device) else {
            return;
        };
        debug!(device = %device, minutes, "reversal armed");

        let this = Arc::clone(self);
        let after = Duration::from_secs(u64::from(minutes) * 60);
        self.reversals.schedule(device, after, async move {
            this.sync_pending().await;
            match this.submit(candidate, Source::Scheduler).await {
                Ok(outcome) => debug!(device = %device, ?outcome, "reversal fired"),
                Err(e) => warn!(device = %device, error = %e, "reversal failed"),
            }
        });
    }

    async fn sync_pending(&self) {
        let pending = self.reversals.pending();
        self.state
            .update_scheduler(|s| s.pending_reversals = pending)
            .await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::conflict::{ResolutionPolicy, RECENCY_WINDOW};
    use crate::evaluator::Trigger;
    use crate::gateway::tests::FakeGateway;
    use crate::state::tests::test_store;
    use time::macros::datetime;

    pub(crate) struct Rig {
        pub(crate) clock: Arc<ManualClock>,
        pub(crate) gateway: Arc<FakeGateway>,
        pub(crate) pipeline: Arc<Pipeline>,
    }

    pub(crate) fn rig() -> Rig {
        let clock = Arc::new(ManualClock::at(datetime!(2024-06-01 05:00 UTC)));
        let state = test_store(clock.clone());
        let gateway = Arc::new(FakeGateway::default());
        let executor = Executor::new(gateway.clone(), state.clone(), Duration::from_secs(5));
        let pipeline = Pipeline::new(state, executor, RECENCY_WINDOW);
        Rig {
            clock,
            gateway,
            pipeline,
        }
    }

    fn scheduled(action: Action, revert_after_min: Option<u32>) -> Candidate {
        Candidate {
            action,
            revert_after_min,
            trigger: Trigger::PumpSchedule {
                time: "05:00".into(),
            },
        }
    }

    /// Manual fan ON, then 30 s later the scheduler wants it OFF.
    async fn collide(r: &Rig) -> Result<Outcome, ActionError> {
        r.pipeline
            .submit(Candidate::manual(Action::Fan { on: true }), Source::Manual)
            .await
            .unwrap();
        r.clock.advance(time::Duration::seconds(30));
        r.pipeline
            .submit(Candidate::reversal(Device::Fan).unwrap(), Source::Scheduler)
            .await
    }

    // -- Reversals ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn pump_reversal_fires_exactly_after_duration() {
        let r = rig();
        let started = tokio::time::Instant::now();

        let outcome = r
            .pipeline
            .submit(scheduled(Action::Pump { on: true }, Some(5)), Source::Scheduler)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Executed);
        assert_eq!(r.pipeline.state().scheduler().await.pending_reversals, 1);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(r.gateway.actions().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let sent = r.gateway.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, Action::Pump { on: false });
        assert_eq!(sent[1].1 - started, Duration::from_secs(300));

        let state = r.pipeline.state();
        let rec = state.last_action(Device::Pump).await.unwrap();
        assert_eq!(rec.source, Source::Scheduler);
        assert_eq!(rec.action, Action::Pump { on: false });
        assert!(!state.devices().await.pump);
        assert_eq!(state.scheduler().await.pending_reversals, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_command_does_not_cancel_reversal() {
        let r = rig();
        r.pipeline
            .submit(scheduled(Action::Pump { on: true }, Some(5)), Source::Scheduler)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(290)).await;
        r.clock.set(datetime!(2024-06-01 05:04:50 UTC));
        r.pipeline
            .submit(Candidate::manual(Action::Pump { on: true }), Source::Manual)
            .await
            .unwrap();
        r.clock.set(datetime!(2024-06-01 05:05:00 UTC));

        tokio::time::sleep(Duration::from_secs(20)).await;

        // The reversal fired, collided with the manual command and is parked.
        assert_eq!(
            r.gateway.actions(),
            vec![Action::Pump { on: true }, Action::Pump { on: true }]
        );
        let alerts = r.pipeline.state().conflicts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].scheduled_action, Action::Pump { on: false });
        assert_eq!(alerts[0].source, Source::Scheduler);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_action_arms_no_reversal() {
        let r = rig();
        r.gateway.set_failing(true);

        let err = r
            .pipeline
            .submit(scheduled(Action::Pump { on: true }, Some(5)), Source::Scheduler)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Gateway { .. }));
        assert_eq!(r.pipeline.state().scheduler().await.pending_reversals, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reversals_never_fire() {
        let r = rig();
        r.pipeline
            .submit(scheduled(Action::Pump { on: true }, Some(5)), Source::Scheduler)
            .await
            .unwrap();

        assert_eq!(r.pipeline.cancel_reversals().await, 1);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(r.gateway.actions(), vec![Action::Pump { on: true }]);
    }

    // -- Policies -------------------------------------------------------

    #[tokio::test]
    async fn always_ask_parks_until_resolved() {
        let r = rig();
        let outcome = collide(&r).await.unwrap();

        let Outcome::Pending { conflict_id } = outcome else {
            panic!("expected pending, got {outcome:?}");
        };
        assert_eq!(r.gateway.actions(), vec![Action::Fan { on: true }]);
        assert!(r.pipeline.state().resolutions().await.is_empty());

        let resolved = r
            .pipeline
            .resolve_conflict(&conflict_id, Source::Scheduler)
            .await
            .unwrap();
        assert_eq!(
            resolved,
            Outcome::Resolved {
                conflict_id,
                resolution: Source::Scheduler,
                executed: true
            }
        );
        assert_eq!(
            r.gateway.actions(),
            vec![Action::Fan { on: true }, Action::Fan { on: false }]
        );
        let state = r.pipeline.state();
        assert!(state.conflicts().await.is_empty());
        assert_eq!(state.resolutions().await[0].resolution, Source::Scheduler);
        assert_eq!(
            state.last_action(Device::Fan).await.unwrap().source,
            Source::Scheduler
        );
    }

    #[tokio::test]
    async fn resolving_for_manual_executes_nothing() {
        let r = rig();
        let Outcome::Pending { conflict_id } = collide(&r).await.unwrap() else {
            panic!("expected pending");
        };

        r.pipeline
            .resolve_conflict(&conflict_id, Source::Manual)
            .await
            .unwrap();
        assert_eq!(r.gateway.actions(), vec![Action::Fan { on: true }]);
        assert!(r.pipeline.state().devices().await.fan);
        assert_eq!(
            r.pipeline.state().resolutions().await[0].resolution,
            Source::Manual
        );
    }

    /// Scheduler fan ON, then 20 s later an operator wants it OFF.
    async fn manual_collides(r: &Rig) -> String {
        r.pipeline
            .submit(scheduled(Action::Fan { on: true }, None), Source::Scheduler)
            .await
            .unwrap();
        r.clock.advance(time::Duration::seconds(20));
        let outcome = r
            .pipeline
            .submit(Candidate::manual(Action::Fan { on: false }), Source::Manual)
            .await
            .unwrap();
        let Outcome::Pending { conflict_id } = outcome else {
            panic!("expected pending, got {outcome:?}");
        };
        conflict_id
    }

    #[tokio::test]
    async fn manual_alert_runs_only_when_manual_is_chosen() {
        let r = rig();
        let id = manual_collides(&r).await;
        assert_eq!(r.pipeline.state().conflict(&id).await.unwrap().source, Source::Manual);
        let resolved = r.pipeline.resolve_conflict(&id, Source::Manual).await.unwrap();
        assert_eq!(
            resolved,
            Outcome::Resolved {
                conflict_id: id,
                resolution: Source::Manual,
                executed: true
            }
        );
        assert_eq!(
            r.gateway.actions(),
            vec![Action::Fan { on: true }, Action::Fan { on: false }]
        );
        assert!(!r.pipeline.state().devices().await.fan);

        let r = rig();
        let id = manual_collides(&r).await;
        let resolved = r.pipeline.resolve_conflict(&id, Source::Scheduler).await.unwrap();
        assert!(matches!(resolved, Outcome::Resolved { executed: false, .. }));
        assert_eq!(r.gateway.actions(), vec![Action::Fan { on: true }]);
        assert!(r.pipeline.state().devices().await.fan);
    }

    #[tokio::test]
    async fn scheduler_priority_executes_and_logs() {
        let r = rig();
        r.pipeline
            .state()
            .set_policy(ResolutionPolicy::SchedulerPriority)
            .await;

        let outcome = collide(&r).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Resolved {
                resolution: Source::Scheduler,
                executed: true,
                ..
            }
        ));
        assert_eq!(
            r.gateway.actions(),
            vec![Action::Fan { on: true }, Action::Fan { on: false }]
        );
        let state = r.pipeline.state();
        assert!(state.conflicts().await.is_empty());
        assert_eq!(state.resolutions().await[0].resolution, Source::Scheduler);
    }

    #[tokio::test]
    async fn manual_priority_executes_nothing_and_logs() {
        let r = rig();
        r.pipeline
            .state()
            .set_policy(ResolutionPolicy::ManualPriority)
            .await;

        let outcome = collide(&r).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Resolved {
                resolution: Source::Manual,
                executed: false,
                ..
            }
        ));
        assert_eq!(r.gateway.actions(), vec![Action::Fan { on: true }]);
        let state = r.pipeline.state();
        assert!(state.conflicts().await.is_empty());
        assert_eq!(state.resolutions().await[0].resolution, Source::Manual);
    }

    #[tokio::test]
    async fn collisions_ninety_seconds_apart_execute() {
        let r = rig();
        r.pipeline
            .submit(Candidate::manual(Action::Fan { on: true }), Source::Manual)
            .await
            .unwrap();
        r.clock.advance(time::Duration::seconds(90));

        let outcome = r
            .pipeline
            .submit(Candidate::reversal(Device::Fan).unwrap(), Source::Scheduler)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Executed);
        assert!(r.pipeline.state().conflicts().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_scheduler_action_arms_its_reversal() {
        let r = rig();
        r.pipeline
            .submit(Candidate::manual(Action::Fan { on: false }), Source::Manual)
            .await
            .unwrap();
        r.clock.advance(time::Duration::seconds(10));
        let Outcome::Pending { conflict_id } = r
            .pipeline
            .submit(scheduled(Action::Fan { on: true }, Some(10)), Source::Scheduler)
            .await
            .unwrap()
        else {
            panic!("expected pending");
        };

        r.pipeline
            .resolve_conflict(&conflict_id, Source::Scheduler)
            .await
            .unwrap();
        assert_eq!(r.pipeline.state().scheduler().await.pending_reversals, 1);

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(
            r.gateway.actions().last(),
            Some(&Action::Fan { on: false })
        );
    }

    #[tokio::test]
    async fn failed_resolution_keeps_alert() {
        let r = rig();
        let Outcome::Pending { conflict_id } = collide(&r).await.unwrap() else {
            panic!("expected pending");
        };
        r.gateway.set_failing(true);

        assert!(r
            .pipeline
            .resolve_conflict(&conflict_id, Source::Scheduler)
            .await
            .is_err());
        assert!(r.pipeline.state().conflict(&conflict_id).await.is_some());
    }

    #[tokio::test]
    async fn unknown_conflict_is_an_error() {
        let r = rig();
        let err = r
            .pipeline
            .resolve_conflict("conflict-99", Source::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::UnknownConflict(ref id) if id == "conflict-99"));
    }
}
