//! Conflict detection between scheduler and manual intent.
//!
//! ```text
//!               ┌─ no record / same source / older than window ─▶ Clear
//! (action, src) ┤
//!               └─ different source within window ─▶ alert raised
//!                      │
//!                      ├─ always_ask ─────────▶ pending until resolve_conflict
//!                      └─ *_priority ─────────▶ resolved at once for the winner
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::device::Source;
use crate::evaluator::Candidate;
use crate::state::{ConflictAlert, ConflictDraft, StateStore};

/// Default span within which different-source actions on a device collide.
pub const RECENCY_WINDOW: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    #[default]
    AlwaysAsk,
    SchedulerPriority,
    ManualPriority,
}

impl ResolutionPolicy {
    /// The source that wins a collision without asking, if any.
    pub fn winner(self) -> Option<Source> {
        match self {
            ResolutionPolicy::AlwaysAsk => None,
            ResolutionPolicy::SchedulerPriority => Some(Source::Scheduler),
            ResolutionPolicy::ManualPriority => Some(Source::Manual),
        }
    }
}

impl fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolutionPolicy::AlwaysAsk => "always_ask",
            ResolutionPolicy::SchedulerPriority => "scheduler_priority",
            ResolutionPolicy::ManualPriority => "manual_priority",
        })
    }
}

impl FromStr for ResolutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "always_ask" => Ok(ResolutionPolicy::AlwaysAsk),
            "scheduler_priority" => Ok(ResolutionPolicy::SchedulerPriority),
            "manual_priority" => Ok(ResolutionPolicy::ManualPriority),
            other => Err(format!(
                "unknown resolution policy '{other}' (use always_ask, scheduler_priority or manual_priority)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Check `candidate` against the device's last record. On a collision the
/// device's alert is raised (or replaced) and returned; the caller decides
/// what to execute.
pub async fn detect(
    state: &StateStore,
    candidate: &Candidate,
    source: Source,
    window: Duration,
) -> Option<ConflictAlert> {
    let device = candidate.action.device();
    let last = state.last_action(device).await?;
    if last.source == source {
        return None;
    }

    let age = state.now() - last.timestamp;
    if age >= window {
        return None;
    }

    tracing::warn!(
        device = %device,
        new_source = %source,
        last_source = %last.source,
        age_ms = age.whole_milliseconds() as i64,
        "conflict detected"
    );

    let current_status = state.devices().await.current(device);
    let alert = state
        .add_conflict(ConflictDraft {
            scheduled_action: candidate.action,
            source,
            revert_after_min: candidate.revert_after_min,
            current_status,
            message: format!(
                "{source} action {} conflicts with recent {} action {}",
                candidate.action, last.source, last.action
            ),
        })
        .await;
    Some(alert)
}

// ===========================================================================
// Tests
// ===========================================================================
