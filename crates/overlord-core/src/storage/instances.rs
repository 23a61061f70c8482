//! Ad-hoc alarm instance persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::database::{fmt_ts, parse_opt_ts, parse_ts, AlarmDb};
use crate::alarm::{AlarmInstance, AlarmType, NewInstance, Outcome};
use crate::error::CoreError;
use crate::profile::DismissalPolicy;

const INSTANCE_COLUMNS: &str = "id, journey_id, scheduled_time, alarm_type, profile_id, label,
    requires_user_dismiss, auto_stop_after_minutes, is_active, acknowledged_at, cancelled_at,
    resolution, fired_at";

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<AlarmInstance> {
    let alarm_type: String = row.get(3)?;
    let resolution: Option<String> = row.get(11)?;
    Ok(AlarmInstance {
        id: row.get(0)?,
        journey_id: row.get(1)?,
        scheduled_time: parse_ts(2, &row.get::<_, String>(2)?)?,
        alarm_type: AlarmType::parse(&alarm_type),
        profile_id: row.get(4)?,
        label: row.get(5)?,
        dismissal: DismissalPolicy {
            requires_user_dismiss: row.get(6)?,
            auto_stop_after_minutes: row.get(7)?,
        },
        is_active: row.get(8)?,
        fired_at: parse_opt_ts(12, row.get(12)?)?,
        acknowledged_at: parse_opt_ts(9, row.get(9)?)?,
        cancelled_at: parse_opt_ts(10, row.get(10)?)?,
        resolution: resolution.as_deref().and_then(Outcome::parse),
    })
}

impl AlarmDb {
    pub fn insert_instance(&self, new: &NewInstance) -> Result<AlarmInstance, CoreError> {
        self.conn.execute(
            "INSERT INTO alarm_instances (journey_id, scheduled_time, alarm_type, profile_id,
                label, requires_user_dismiss, auto_stop_after_minutes, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            params![
                new.journey_id,
                fmt_ts(new.scheduled_time),
                new.alarm_type.as_str(),
                new.profile_id,
                new.label,
                new.dismissal.requires_user_dismiss,
                new.dismissal.auto_stop_after_minutes,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_instance(id)?
            .ok_or_else(|| CoreError::not_found("alarm instance", id))
    }

    pub fn get_instance(&self, id: i64) -> Result<Option<AlarmInstance>, CoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM alarm_instances WHERE id = ?1"),
                [id],
                row_to_instance,
            )
            .optional()?)
    }

    pub fn list_instances(&self, active_only: bool) -> Result<Vec<AlarmInstance>, CoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM alarm_instances
             WHERE ?1 = 0 OR is_active = 1
             ORDER BY scheduled_time ASC, id ASC"
        ))?;
        let rows = stmt.query_map([active_only], row_to_instance)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Active, unresolved, unfired instances scheduled at or after `since`.
    pub fn pending_instances(&self, since: DateTime<Utc>) -> Result<Vec<AlarmInstance>, CoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM alarm_instances
             WHERE is_active = 1 AND acknowledged_at IS NULL AND cancelled_at IS NULL
               AND resolution IS NULL AND fired_at IS NULL AND scheduled_time >= ?1
             ORDER BY scheduled_time ASC, id ASC"
        ))?;
        let rows = stmt.query_map([fmt_ts(since)], row_to_instance)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Instances that started ringing but never got an outcome.
    pub fn interrupted_instances(&self) -> Result<Vec<AlarmInstance>, CoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM alarm_instances
             WHERE is_active = 1 AND resolution IS NULL AND fired_at IS NOT NULL
             ORDER BY scheduled_time ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_instance)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Stamp `fired_at`. Returns false if it already fired or ended.
    pub fn mark_instance_fired(&self, id: i64, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let changed = self.conn.execute(
            "UPDATE alarm_instances SET fired_at = ?1
             WHERE id = ?2 AND fired_at IS NULL AND resolution IS NULL",
            params![fmt_ts(at), id],
        )?;
        Ok(changed > 0)
    }

    /// Delete inactive instances that ended before `cutoff`.
    pub fn purge_inactive_instances(&self, cutoff: DateTime<Utc>) -> Result<usize, CoreError> {
        Ok(self.conn.execute(
            "DELETE FROM alarm_instances
             WHERE is_active = 0 AND COALESCE(acknowledged_at, cancelled_at) < ?1",
            [fmt_ts(cutoff)],
        )?)
    }

    /// Record how an instance ended. Terminal instances are left untouched.
    ///
    /// A cancellation sets `cancelled_at`; any other outcome sets
    /// `acknowledged_at`. Both deactivate the instance.
    pub fn resolve_instance(
        &self,
        id: i64,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let column = match outcome {
            Outcome::Cancelled => "cancelled_at",
            Outcome::Dismissed | Outcome::AutoStopped => "acknowledged_at",
        };
        let changed = self.conn.execute(
            &format!(
                "UPDATE alarm_instances SET is_active = 0, {column} = ?1, resolution = ?2
                 WHERE id = ?3 AND acknowledged_at IS NULL AND cancelled_at IS NULL
                   AND resolution IS NULL"
            ),
            params![fmt_ts(at), outcome.as_str(), id],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_instance(at: DateTime<Utc>) -> NewInstance {
        NewInstance {
            journey_id: None,
            scheduled_time: at,
            alarm_type: AlarmType::Test,
            profile_id: None,
            label: "Test Alarm".into(),
            dismissal: DismissalPolicy {
                requires_user_dismiss: false,
                auto_stop_after_minutes: None,
            },
        }
    }

    #[test]
    fn insert_and_get() {
        let db = AlarmDb::open_memory().unwrap();
        let at = Utc::now() + Duration::minutes(1);
        let instance = db.insert_instance(&new_instance(at)).unwrap();

        let loaded = db.get_instance(instance.id).unwrap().unwrap();
        assert_eq!(loaded, instance);
        assert!(loaded.is_active);
        assert_eq!(loaded.alarm_type, AlarmType::Test);
        assert!(!loaded.dismissal.requires_user_dismiss);
    }

    #[test]
    fn acknowledged_and_cancelled_are_exclusive() {
        let db = AlarmDb::open_memory().unwrap();
        let now = Utc::now();
        let instance = db.insert_instance(&new_instance(now)).unwrap();

        assert!(db.resolve_instance(instance.id, Outcome::Cancelled, now).unwrap());
        assert!(!db.resolve_instance(instance.id, Outcome::Dismissed, now).unwrap());

        let stored = db.get_instance(instance.id).unwrap().unwrap();
        assert!(stored.cancelled_at.is_some());
        assert!(stored.acknowledged_at.is_none());
        assert!(!stored.is_active);
        assert!(stored.is_terminal());
    }

    #[test]
    fn pending_skips_terminal_and_past() {
        let db = AlarmDb::open_memory().unwrap();
        let now = Utc::now();
        let past = db.insert_instance(&new_instance(now - Duration::minutes(5))).unwrap();
        let future = db.insert_instance(&new_instance(now + Duration::minutes(5))).unwrap();
        let done = db.insert_instance(&new_instance(now + Duration::minutes(6))).unwrap();
        db.resolve_instance(done.id, Outcome::AutoStopped, now).unwrap();

        let pending: Vec<i64> = db
            .pending_instances(now)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(pending, vec![future.id]);

        assert_eq!(db.list_instances(false).unwrap().len(), 3);
        let active: Vec<i64> = db
            .list_instances(true)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(active, vec![past.id, future.id]);
    }

    #[test]
    fn fired_instances_leave_pending_until_resolved() {
        let db = AlarmDb::open_memory().unwrap();
        let now = Utc::now();
        let instance = db.insert_instance(&new_instance(now + Duration::minutes(1))).unwrap();

        assert!(db.mark_instance_fired(instance.id, now).unwrap());
        assert!(!db.mark_instance_fired(instance.id, now).unwrap());
        assert!(db.pending_instances(now).unwrap().is_empty());

        let interrupted = db.interrupted_instances().unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].id, instance.id);
        assert!(interrupted[0].fired_at.is_some());

        db.resolve_instance(instance.id, Outcome::Dismissed, now).unwrap();
        assert!(db.interrupted_instances().unwrap().is_empty());
    }

    #[test]
    fn purge_removes_only_old_inactive_instances() {
        let db = AlarmDb::open_memory().unwrap();
        let now = Utc::now();
        let old = db.insert_instance(&new_instance(now - Duration::days(40))).unwrap();
        let recent = db.insert_instance(&new_instance(now - Duration::days(1))).unwrap();
        let live = db.insert_instance(&new_instance(now - Duration::days(40))).unwrap();
        db.resolve_instance(old.id, Outcome::Dismissed, now - Duration::days(40))
            .unwrap();
        db.resolve_instance(recent.id, Outcome::Cancelled, now - Duration::days(1))
            .unwrap();

        assert_eq!(db.purge_inactive_instances(now - Duration::days(30)).unwrap(), 1);
        assert!(db.get_instance(old.id).unwrap().is_none());
        assert!(db.get_instance(recent.id).unwrap().is_some());
        assert!(db.get_instance(live.id).unwrap().is_some());
    }
}
