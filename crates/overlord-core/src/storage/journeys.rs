//! Journey and scheduled alarm persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::database::{fmt_ts, opt_ts, parse_opt_ts, parse_ts, AlarmDb};
use crate::alarm::Outcome;
use crate::error::CoreError;
use crate::journey::{
    JourneyStatus, JourneyWithAlarms, Place, RouteSelection, ScheduledAlarm, ScheduledJourney,
};
use crate::profile::{AlarmProfile, DismissalPolicy, SoundDescriptor, SoundSource};

const JOURNEY_COLUMNS: &str = "id, origin_name, origin_address, origin_lat, origin_lng,
    destination_name, destination_address, destination_lat, destination_lng,
    route_id, route_summary, transport_modes, departure_time, arrival_time,
    duration_minutes, status, profile_id, profile_name, created_at, updated_at";

const ALARM_COLUMNS: &str = "id, journey_id, template_id, label, scheduled_time,
    original_offset_minutes, sort_order, sound_source, sound_uri, sound_name,
    requires_user_dismiss, auto_stop_after_minutes, auto_stop_after_secs,
    vibration_enabled, is_enabled, is_fired, fired_at, dismissed_at, snoozed_until,
    resolution";

fn row_to_journey(row: &Row<'_>) -> rusqlite::Result<ScheduledJourney> {
    let modes: String = row.get(11)?;
    let transport_modes = serde_json::from_str(&modes).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "unreadable transport_modes, treating as empty");
        Vec::new()
    });
    let status: String = row.get(15)?;
    Ok(ScheduledJourney {
        id: row.get(0)?,
        origin: Place {
            name: row.get(1)?,
            address: row.get(2)?,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
        },
        destination: Place {
            name: row.get(5)?,
            address: row.get(6)?,
            latitude: row.get(7)?,
            longitude: row.get(8)?,
        },
        route_id: row.get(9)?,
        route_summary: row.get(10)?,
        transport_modes,
        departure_time: parse_ts(12, &row.get::<_, String>(12)?)?,
        arrival_time: parse_ts(13, &row.get::<_, String>(13)?)?,
        duration_minutes: row.get(14)?,
        status: JourneyStatus::parse(&status),
        profile_id: row.get(16)?,
        profile_name: row.get(17)?,
        created_at: parse_ts(18, &row.get::<_, String>(18)?)?,
        updated_at: parse_ts(19, &row.get::<_, String>(19)?)?,
    })
}

fn row_to_alarm(row: &Row<'_>) -> rusqlite::Result<ScheduledAlarm> {
    let source: String = row.get(7)?;
    let resolution: Option<String> = row.get(19)?;
    Ok(ScheduledAlarm {
        id: row.get(0)?,
        journey_id: row.get(1)?,
        template_id: row.get(2)?,
        label: row.get(3)?,
        scheduled_time: parse_ts(4, &row.get::<_, String>(4)?)?,
        original_offset_minutes: row.get(5)?,
        sort_order: row.get(6)?,
        sound: SoundDescriptor {
            source: SoundSource::parse(&source),
            uri: row.get(8)?,
            name: row.get(9)?,
        },
        dismissal: DismissalPolicy {
            requires_user_dismiss: row.get(10)?,
            auto_stop_after_minutes: row.get(11)?,
        },
        auto_stop_after_secs: row.get(12)?,
        vibration_enabled: row.get(13)?,
        is_enabled: row.get(14)?,
        is_fired: row.get(15)?,
        fired_at: parse_opt_ts(16, row.get(16)?)?,
        dismissed_at: parse_opt_ts(17, row.get(17)?)?,
        snoozed_until: parse_opt_ts(18, row.get(18)?)?,
        resolution: resolution.as_deref().and_then(Outcome::parse),
    })
}

impl AlarmDb {
    /// Persist a journey and its materialized alarms in one transaction.
    ///
    /// The ids of `alarms` are ignored; the stored rows are returned.
    pub fn insert_journey(
        &mut self,
        route: &RouteSelection,
        profile: &AlarmProfile,
        alarms: &[ScheduledAlarm],
        at: DateTime<Utc>,
    ) -> Result<JourneyWithAlarms, CoreError> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO scheduled_journeys (origin_name, origin_address, origin_lat, origin_lng,
                destination_name, destination_address, destination_lat, destination_lng,
                route_id, route_summary, transport_modes, departure_time, arrival_time,
                duration_minutes, status, profile_id, profile_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)",
            params![
                route.origin.name,
                route.origin.address,
                route.origin.latitude,
                route.origin.longitude,
                route.destination.name,
                route.destination.address,
                route.destination.latitude,
                route.destination.longitude,
                route.route_id,
                route.route_summary,
                serde_json::to_string(&route.transport_modes)?,
                fmt_ts(route.departure_time),
                fmt_ts(route.arrival_time),
                route.duration_minutes,
                JourneyStatus::Upcoming.as_str(),
                profile.id,
                profile.name,
                fmt_ts(at),
            ],
        )?;
        let journey_id = tx.last_insert_rowid();

        let mut stored = Vec::with_capacity(alarms.len());
        for alarm in alarms {
            tx.execute(
                "INSERT INTO scheduled_alarms (journey_id, template_id, label, scheduled_time,
                    original_offset_minutes, sort_order, sound_source, sound_uri, sound_name,
                    requires_user_dismiss, auto_stop_after_minutes, auto_stop_after_secs,
                    vibration_enabled, is_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    journey_id,
                    alarm.template_id,
                    alarm.label,
                    fmt_ts(alarm.scheduled_time),
                    alarm.original_offset_minutes,
                    alarm.sort_order,
                    alarm.sound.source.as_str(),
                    alarm.sound.uri,
                    alarm.sound.name,
                    alarm.dismissal.requires_user_dismiss,
                    alarm.dismissal.auto_stop_after_minutes,
                    alarm.auto_stop_after_secs,
                    alarm.vibration_enabled,
                    alarm.is_enabled,
                ],
            )?;
            stored.push(ScheduledAlarm {
                id: tx.last_insert_rowid(),
                journey_id,
                ..alarm.clone()
            });
        }

        tx.commit()?;

        let journey = self
            .get_journey(journey_id)?
            .ok_or_else(|| CoreError::not_found("journey", journey_id))?;
        Ok(JourneyWithAlarms {
            journey,
            alarms: stored,
        })
    }

    pub fn get_journey(&self, id: i64) -> Result<Option<ScheduledJourney>, CoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {JOURNEY_COLUMNS} FROM scheduled_journeys WHERE id = ?1"),
                [id],
                row_to_journey,
            )
            .optional()?)
    }

    /// Journeys ordered by departure, optionally filtered by status.
    pub fn list_journeys(
        &self,
        status: Option<JourneyStatus>,
    ) -> Result<Vec<ScheduledJourney>, CoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOURNEY_COLUMNS} FROM scheduled_journeys
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY departure_time ASC, id ASC"
        ))?;
        let rows = stmt.query_map([status.map(JourneyStatus::as_str)], row_to_journey)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn load_journey(&self, id: i64) -> Result<Option<JourneyWithAlarms>, CoreError> {
        let Some(journey) = self.get_journey(id)? else {
            return Ok(None);
        };
        let alarms = self.alarms_for_journey(id)?;
        Ok(Some(JourneyWithAlarms { journey, alarms }))
    }

    pub fn set_journey_status(
        &self,
        id: i64,
        status: JourneyStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let changed = self.conn.execute(
            "UPDATE scheduled_journeys SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), fmt_ts(at), id],
        )?;
        Ok(changed > 0)
    }

    /// Move an UPCOMING journey to IN_PROGRESS. No-op in any other status.
    pub fn mark_journey_started(&self, id: i64, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let changed = self.conn.execute(
            "UPDATE scheduled_journeys SET status = 'IN_PROGRESS', updated_at = ?1
             WHERE id = ?2 AND status = 'UPCOMING'",
            params![fmt_ts(at), id],
        )?;
        Ok(changed > 0)
    }

    /// UPCOMING journeys that already have a fired alarm become IN_PROGRESS.
    pub fn promote_started_journeys(&self, at: DateTime<Utc>) -> Result<usize, CoreError> {
        Ok(self.conn.execute(
            "UPDATE scheduled_journeys SET status = 'IN_PROGRESS', updated_at = ?1
             WHERE status = 'UPCOMING'
               AND EXISTS (SELECT 1 FROM scheduled_alarms a
                           WHERE a.journey_id = scheduled_journeys.id AND a.is_fired = 1)",
            [fmt_ts(at)],
        )?)
    }

    /// Live journeys that departed before `cutoff` become COMPLETED, unless an
    /// alarm still waiting to ring is due at or after `cutoff`.
    ///
    /// Alarms may sit after departure, so a journey only completes once its last
    /// pending alarm is as far in the past as its departure must be.
    pub fn complete_departed_journeys(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize, CoreError> {
        Ok(self.conn.execute(
            "UPDATE scheduled_journeys SET status = 'COMPLETED', updated_at = ?1
             WHERE status IN ('UPCOMING', 'IN_PROGRESS') AND departure_time < ?2
               AND NOT EXISTS (
                   SELECT 1 FROM scheduled_alarms a
                   WHERE a.journey_id = scheduled_journeys.id
                     AND a.is_enabled = 1 AND a.is_fired = 0 AND a.resolution IS NULL
                     AND a.scheduled_time >= ?2)",
            params![fmt_ts(at), fmt_ts(cutoff)],
        )?)
    }

    /// Delete COMPLETED journeys last touched before `cutoff`, with their alarms.
    pub fn purge_completed_journeys(&self, cutoff: DateTime<Utc>) -> Result<usize, CoreError> {
        Ok(self.conn.execute(
            "DELETE FROM scheduled_journeys WHERE status = 'COMPLETED' AND updated_at < ?1",
            [fmt_ts(cutoff)],
        )?)
    }

    pub fn delete_journey(&self, id: i64) -> Result<bool, CoreError> {
        Ok(self
            .conn
            .execute("DELETE FROM scheduled_journeys WHERE id = ?1", [id])?
            > 0)
    }

    pub fn alarms_for_journey(&self, journey_id: i64) -> Result<Vec<ScheduledAlarm>, CoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALARM_COLUMNS} FROM scheduled_alarms
             WHERE journey_id = ?1 ORDER BY sort_order ASC, id ASC"
        ))?;
        let rows = stmt.query_map([journey_id], row_to_alarm)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_scheduled_alarm(&self, id: i64) -> Result<Option<ScheduledAlarm>, CoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {ALARM_COLUMNS} FROM scheduled_alarms WHERE id = ?1"),
                [id],
                row_to_alarm,
            )
            .optional()?)
    }

    fn alarms_joined(
        &self,
        filter: &str,
        param: Option<String>,
    ) -> Result<Vec<ScheduledAlarm>, CoreError> {
        let columns = ALARM_COLUMNS
            .split(',')
            .map(|c| format!("a.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {columns} FROM scheduled_alarms a
             JOIN scheduled_journeys j ON j.id = a.journey_id
             WHERE {filter}
             ORDER BY a.scheduled_time ASC, a.id ASC"
        ))?;
        let rows = match param {
            Some(param) => stmt.query_map([param], row_to_alarm)?,
            None => stmt.query_map([], row_to_alarm)?,
        };
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Alarms that should hold a wake registration: enabled, unfired,
    /// unresolved, scheduled at or after `since`, and belonging to a live journey.
    pub fn pending_scheduled_alarms(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScheduledAlarm>, CoreError> {
        self.alarms_joined(
            "a.is_enabled = 1 AND a.is_fired = 0 AND a.resolution IS NULL
               AND a.scheduled_time >= ?1
               AND j.status IN ('UPCOMING', 'IN_PROGRESS')",
            Some(fmt_ts(since)),
        )
    }

    /// Alarms that started ringing but never got an outcome.
    pub fn interrupted_scheduled_alarms(&self) -> Result<Vec<ScheduledAlarm>, CoreError> {
        self.alarms_joined(
            "a.is_enabled = 1 AND a.is_fired = 1 AND a.resolution IS NULL",
            None,
        )
    }

    /// Every alarm across journeys, newest departure last.
    pub fn list_scheduled_alarms(&self) -> Result<Vec<ScheduledAlarm>, CoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALARM_COLUMNS} FROM scheduled_alarms ORDER BY scheduled_time ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_alarm)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Stamp `fired_at`. Returns false if the alarm already fired or is resolved.
    pub fn mark_alarm_fired(&self, id: i64, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let changed = self.conn.execute(
            "UPDATE scheduled_alarms SET is_fired = 1, fired_at = ?1
             WHERE id = ?2 AND is_fired = 0 AND resolution IS NULL",
            params![fmt_ts(at), id],
        )?;
        Ok(changed > 0)
    }

    /// Record how the alarm ended. Only the first outcome sticks.
    ///
    /// Dismissed and auto-stopped alarms get `dismissed_at`; cancelled ones are
    /// also disabled so nothing re-arms them.
    pub fn resolve_scheduled_alarm(
        &self,
        id: i64,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let changed = match outcome {
            Outcome::Cancelled => self.conn.execute(
                "UPDATE scheduled_alarms SET is_enabled = 0, resolution = ?1
                 WHERE id = ?2 AND resolution IS NULL",
                params![outcome.as_str(), id],
            )?,
            Outcome::Dismissed | Outcome::AutoStopped => self.conn.execute(
                "UPDATE scheduled_alarms SET dismissed_at = ?1, resolution = ?2
                 WHERE id = ?3 AND resolution IS NULL",
                params![fmt_ts(at), outcome.as_str(), id],
            )?,
        };
        Ok(changed > 0)
    }

    /// Persist user adjustments (time, label, enabled flag, sound).
    pub fn update_scheduled_alarm(&self, alarm: &ScheduledAlarm) -> Result<bool, CoreError> {
        let changed = self.conn.execute(
            "UPDATE scheduled_alarms SET label = ?1, scheduled_time = ?2, is_enabled = ?3,
                sound_source = ?4, sound_uri = ?5, sound_name = ?6, vibration_enabled = ?7,
                snoozed_until = ?8
             WHERE id = ?9",
            params![
                alarm.label,
                fmt_ts(alarm.scheduled_time),
                alarm.is_enabled,
                alarm.sound.source.as_str(),
                alarm.sound.uri,
                alarm.sound.name,
                alarm.vibration_enabled,
                opt_ts(alarm.snoozed_until),
                alarm.id,
            ],
        )?;
        Ok(changed > 0)
    }
}
