//! Time-driven journey status transitions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::storage::{AlarmDb, JourneysConfig};

/// How long journeys linger in each late stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Time after departure before a live journey counts as completed.
    pub completion_grace: Duration,
    /// Time a completed journey is kept.
    pub retention: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::from(&JourneysConfig::default())
    }
}

impl From<&JourneysConfig> for LifecyclePolicy {
    fn from(config: &JourneysConfig) -> Self {
        Self {
            completion_grace: Duration::minutes(i64::from(config.completion_grace_minutes)),
            retention: Duration::days(i64::from(config.retain_completed_days)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub started: usize,
    pub completed: usize,
    pub purged: usize,
    /// Ended one-off alarm instances removed by the retention window.
    #[serde(default)]
    pub purged_instances: usize,
}

/// Advance journey statuses as of `now`.
///
/// UPCOMING with a fired alarm → IN_PROGRESS; live journeys past departure plus
/// grace → COMPLETED once no alarm is left to ring; COMPLETED journeys and
/// ended alarm instances older than the retention window are deleted.
///
/// # Errors
/// Returns an error if any of the updates fails.
pub fn sweep(
    db: &AlarmDb,
    policy: &LifecyclePolicy,
    now: DateTime<Utc>,
) -> Result<SweepReport, CoreError> {
    let report = SweepReport {
        started: db.promote_started_journeys(now)?,
        completed: db.complete_departed_journeys(now - policy.completion_grace, now)?,
        purged: db.purge_completed_journeys(now - policy.retention)?,
        purged_instances: db.purge_inactive_instances(now - policy.retention)?,
    };
    if report != SweepReport::default() {
        tracing::info!(
            started = report.started,
            completed = report.completed,
            purged = report.purged,
            purged_instances = report.purged_instances,
            "journey sweep"
        );
    }
    Ok(report)
}
