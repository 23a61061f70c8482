//! Re-arming after anything that may have wiped pending wakes.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::gateway::SchedulingGateway;
use super::types::{AlarmKey, AlarmPayload, Outcome};
use crate::clock::Clock;
use crate::error::{CoreError, ValidationError};
use crate::events::{Event, EventBus};
use crate::journey::lifecycle::{self, LifecyclePolicy, SweepReport};
use crate::storage::SharedDb;

/// Why recovery runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    Boot,
    ClockChanged,
    TimezoneChanged,
    /// Periodic re-read of the store by the daemon.
    Resync,
}

impl RecoveryTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryTrigger::Boot => "boot",
            RecoveryTrigger::ClockChanged => "clock_changed",
            RecoveryTrigger::TimezoneChanged => "timezone_changed",
            RecoveryTrigger::Resync => "resync",
        }
    }
}

impl fmt::Display for RecoveryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryTrigger {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "boot" => Ok(RecoveryTrigger::Boot),
            "clock_changed" | "clock" => Ok(RecoveryTrigger::ClockChanged),
            "timezone_changed" | "timezone" => Ok(RecoveryTrigger::TimezoneChanged),
            "resync" => Ok(RecoveryTrigger::Resync),
            other => Err(ValidationError::InvalidValue {
                field: "trigger".into(),
                message: format!("unknown recovery trigger '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub trigger: RecoveryTrigger,
    /// Rows that were eligible for a wake.
    pub examined: usize,
    /// Registrations made by this run.
    pub armed: usize,
    pub failed: usize,
    /// Rows that came due since the previous resync and ring on arrival.
    #[serde(default)]
    pub overdue: usize,
    /// Alarms cut off mid-ring that were armed to ring again.
    #[serde(default)]
    pub resumed: usize,
    /// Alarms cut off mid-ring whose countdown had run out; stamped auto-stopped.
    #[serde(default)]
    pub expired: usize,
    pub sweep: SweepReport,
}

/// A row that fired but never recorded an outcome.
struct Interrupted {
    payload: AlarmPayload,
    fired_at: DateTime<Utc>,
}

pub struct RecoveryCoordinator {
    db: SharedDb,
    gateway: Arc<SchedulingGateway>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    lifecycle: LifecyclePolicy,
    fallback_auto_stop_secs: u32,
    /// When the store was last read. Rows due after this are still owed a ring.
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl RecoveryCoordinator {
    pub fn new(
        db: SharedDb,
        gateway: Arc<SchedulingGateway>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        lifecycle: LifecyclePolicy,
        fallback_auto_stop_secs: u32,
    ) -> Self {
        Self {
            db,
            gateway,
            clock,
            events,
            lifecycle,
            fallback_auto_stop_secs,
            last_sync: Mutex::new(None),
        }
    }

    /// Advance journey statuses, then re-arm every alarm that is still due.
    ///
    /// Rows that are enabled/active, unfired, unresolved and scheduled at or
    /// after now are armed; arming is idempotent per key so redundant runs are
    /// safe. A [`RecoveryTrigger::Resync`] also arms rows that came due since the
    /// previous run: another process wrote them and exited before they rang, so
    /// they ring immediately. It leaves registrations that already match the
    /// store in place; every other trigger re-arms unconditionally because the
    /// backend's notion of "when" may be stale.
    ///
    /// On [`RecoveryTrigger::Boot`], alarms that were ringing when the process
    /// died either ring again or, once their countdown (or the completion grace,
    /// for alarms that wait for a dismissal) has run out, are stamped
    /// auto-stopped.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read. Individual arm failures are
    /// counted in the report instead.
    pub fn recover(&self, trigger: RecoveryTrigger) -> Result<RecoveryReport, CoreError> {
        let now = self.clock.now();
        let since = match trigger {
            RecoveryTrigger::Resync => self.since(now),
            _ => now,
        };
        let boot = trigger == RecoveryTrigger::Boot;
        let (sweep, alarms, instances, interrupted) = self.db.with(|db| {
            let sweep = lifecycle::sweep(db, &self.lifecycle, now)?;
            let mut interrupted = Vec::new();
            if boot {
                for alarm in db.interrupted_scheduled_alarms()? {
                    let fired_at = alarm.fired_at.unwrap_or(alarm.scheduled_time);
                    interrupted.push(Interrupted {
                        payload: alarm.payload(),
                        fired_at,
                    });
                }
                for instance in db.interrupted_instances()? {
                    let fired_at = instance.fired_at.unwrap_or(instance.scheduled_time);
                    interrupted.push(Interrupted {
                        payload: instance.payload(self.fallback_auto_stop_secs),
                        fired_at,
                    });
                }
            }
            Ok((
                sweep,
                db.pending_scheduled_alarms(since)?,
                db.pending_instances(since)?,
                interrupted,
            ))
        })?;
        self.mark_synced(now);

        let payloads: Vec<_> = alarms
            .iter()
            .map(|a| a.payload())
            .chain(
                instances
                    .iter()
                    .map(|i| i.payload(self.fallback_auto_stop_secs)),
            )
            .collect();

        let examined = payloads.len();
        let overdue = payloads.iter().filter(|p| p.scheduled_time < now).count();
        let mut armed = 0;
        let mut failed = 0;
        for payload in payloads {
            let key = payload.key;
            if trigger == RecoveryTrigger::Resync
                && self.gateway.armed_at(key) == Some(payload.scheduled_time)
            {
                continue;
            }
            match self.gateway.arm(payload) {
                Ok(_) => armed += 1,
                Err(e) => {
                    tracing::error!(%key, error = %e, "re-arm failed");
                    failed += 1;
                }
            }
        }

        let mut resumed = 0;
        let mut expired = 0;
        for row in interrupted {
            let key = row.payload.key;
            if now >= self.ring_deadline(&row) {
                match self.expire(key, now) {
                    Ok(true) => expired += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(%key, error = %e, "could not expire interrupted alarm");
                        failed += 1;
                    }
                }
                continue;
            }
            match self.gateway.arm(row.payload) {
                Ok(_) => resumed += 1,
                Err(e) => {
                    tracing::error!(%key, error = %e, "could not resume interrupted alarm");
                    failed += 1;
                }
            }
        }

        tracing::info!(
            trigger = trigger.as_str(),
            examined,
            armed,
            failed,
            overdue,
            resumed,
            expired,
            "recovery complete"
        );
        self.events.emit(Event::RecoveryCompleted {
            trigger,
            examined,
            armed,
            failed,
            at: now,
        });

        Ok(RecoveryReport {
            trigger,
            examined,
            armed,
            failed,
            overdue,
            resumed,
            expired,
            sweep,
        })
    }

    fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let last = *self.last_sync.lock().unwrap_or_else(|e| e.into_inner());
        // A clock that moved backwards must not reach into the future.
        last.map_or(now, |t| t.min(now))
    }

    fn mark_synced(&self, now: DateTime<Utc>) {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
    }

    /// When an interrupted alarm would have stopped ringing on its own.
    fn ring_deadline(&self, row: &Interrupted) -> DateTime<Utc> {
        match row.payload.auto_stop_after_secs {
            Some(secs) => row.fired_at + Duration::seconds(i64::from(secs)),
            None => row.fired_at + self.lifecycle.completion_grace,
        }
    }

    fn expire(&self, key: AlarmKey, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let stamped = self.db.with(|db| match key {
            AlarmKey::Scheduled(id) => db.resolve_scheduled_alarm(id, Outcome::AutoStopped, now),
            AlarmKey::Instance(id) => db.resolve_instance(id, Outcome::AutoStopped, now),
        })?;
        if stamped {
            tracing::info!(%key, "interrupted alarm expired while down");
            self.events.emit(Event::AlarmResolved {
                key,
                outcome: Outcome::AutoStopped,
                at: now,
            });
        }
        Ok(stamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::gateway::{ManualWakeScheduler, WakeHandler};
    use crate::alarm::{AlarmInstance, AlarmType, NewInstance};
    use crate::clock::ManualClock;
    use crate::journey::{materialize, Place, RouteSelection};
    use crate::profile::{DismissalPolicy, ProfileCatalog};
    use crate::storage::AlarmDb;
    use chrono::TimeZone;

    #[derive(Default)]
    struct Noop(Mutex<Vec<AlarmKey>>);

    impl WakeHandler for Noop {
        fn on_wake(&self, payload: AlarmPayload) {
            self.0.lock().unwrap().push(payload.key);
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap()
    }

    #[test]
    fn trigger_parses_cli_spellings() {
        assert_eq!("boot".parse::<RecoveryTrigger>().unwrap(), RecoveryTrigger::Boot);
        assert_eq!(
            "clock-changed".parse::<RecoveryTrigger>().unwrap(),
            RecoveryTrigger::ClockChanged
        );
        assert_eq!(
            "timezone".parse::<RecoveryTrigger>().unwrap(),
            RecoveryTrigger::TimezoneChanged
        );
        assert!("reboot".parse::<RecoveryTrigger>().is_err());
    }

    struct Rig {
        db: SharedDb,
        clock: Arc<ManualClock>,
        backend: Arc<ManualWakeScheduler>,
        handler: Arc<Noop>,
        gateway: Arc<SchedulingGateway>,
        coordinator: RecoveryCoordinator,
    }

    fn rig() -> Rig {
        let clock = Arc::new(ManualClock::new(start()));
        let db = SharedDb::new(AlarmDb::open_memory().unwrap());
        let backend = Arc::new(ManualWakeScheduler::new());
        let handler = Arc::new(Noop::default());
        let gateway = Arc::new(SchedulingGateway::new(
            backend.clone(),
            handler.clone(),
            clock.clone(),
            EventBus::new(),
        ));
        let coordinator = RecoveryCoordinator::new(
            db.clone(),
            gateway.clone(),
            clock.clone(),
            EventBus::new(),
            LifecyclePolicy::default(),
            30,
        );
        Rig {
            db,
            clock,
            backend,
            handler,
            gateway,
            coordinator,
        }
    }

    fn test_instance(
        db: &SharedDb,
        at: DateTime<Utc>,
        dismissal: DismissalPolicy,
    ) -> AlarmInstance {
        db.with(|db| {
            db.insert_instance(&NewInstance {
                journey_id: None,
                scheduled_time: at,
                alarm_type: AlarmType::Test,
                profile_id: None,
                label: "Test Alarm".into(),
                dismissal,
            })
        })
        .unwrap()
    }

    #[test]
    fn resync_rings_rows_that_came_due_since_the_last_run() {
        let r = rig();
        assert_eq!(r.coordinator.recover(RecoveryTrigger::Boot).unwrap().armed, 0);

        // Written by another process, which exited before it could ring.
        let written = test_instance(
            &r.db,
            start() + Duration::seconds(10),
            DismissalPolicy::default(),
        );
        r.clock.advance(Duration::seconds(60));

        let report = r.coordinator.recover(RecoveryTrigger::Resync).unwrap();
        assert_eq!(report.armed, 1);
        assert_eq!(report.overdue, 1);
        assert_eq!(r.backend.fire_due(r.clock.now()), 1);
        assert_eq!(*r.handler.0.lock().unwrap(), vec![written.key()]);

        // The window moved on; the same row is not owed twice.
        let again = r.coordinator.recover(RecoveryTrigger::Resync).unwrap();
        assert_eq!(again.examined, 0);
    }

    #[test]
    fn boot_resumes_or_expires_alarms_cut_off_mid_ring() {
        let r = rig();
        let fired_at = start() - Duration::minutes(1);
        let waits = test_instance(&r.db, fired_at, DismissalPolicy::default());
        let stops = test_instance(
            &r.db,
            fired_at,
            DismissalPolicy {
                requires_user_dismiss: false,
                auto_stop_after_minutes: None,
            },
        );
        r.db
            .with(|db| {
                db.mark_instance_fired(waits.id, fired_at)?;
                db.mark_instance_fired(stops.id, fired_at)?;
                Ok(())
            })
            .unwrap();

        let report = r.coordinator.recover(RecoveryTrigger::Boot).unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(report.resumed, 1);
        assert_eq!(report.expired, 1);

        let stopped = r.db.with(|db| db.get_instance(stops.id)).unwrap().unwrap();
        assert_eq!(stopped.resolution, Some(Outcome::AutoStopped));
        assert!(!stopped.is_active);
        assert_eq!(r.gateway.armed_at(waits.key()), Some(fired_at));

        // Only boot looks at interrupted rows.
        let resync = r.coordinator.recover(RecoveryTrigger::ClockChanged).unwrap();
        assert_eq!((resync.resumed, resync.expired), (0, 0));

        // Past the completion grace, even an alarm waiting for a dismissal ends.
        r.clock.advance(Duration::minutes(60));
        let late = r.coordinator.recover(RecoveryTrigger::Boot).unwrap();
        assert_eq!(late.expired, 1);
    }

    #[test]
    fn recovery_arms_only_future_active_rows() {
        let clock = Arc::new(ManualClock::new(start()));
        let db = SharedDb::new(AlarmDb::open_memory().unwrap());
        let catalog = ProfileCatalog::new(db.clone(), clock.clone());
        catalog.seed_defaults().unwrap();
        let quick = catalog
            .list_profiles()
            .unwrap()
            .into_iter()
            .find(|p| p.name == "Quick Trip")
            .unwrap();
        let profile = catalog.load_profile(quick.id).unwrap();

        // Departure 07:20: the 30-minute warning (06:50) is already past.
        let departure = start() + Duration::minutes(20);
        let route = RouteSelection {
            origin: Place::named("Home"),
            destination: Place::named("Station"),
            route_id: "r".into(),
            route_summary: String::new(),
            transport_modes: Vec::new(),
            departure_time: departure,
            arrival_time: departure + Duration::minutes(15),
            duration_minutes: 15,
        };
        let alarms = materialize(&profile, departure, 30);
        let journey = db
            .with(|db| db.insert_journey(&route, &profile.profile, &alarms, start()))
            .unwrap();
        assert_eq!(journey.alarms.len(), 2);

        let instance = |offset: i64| {
            db.with(|db| {
                db.insert_instance(&NewInstance {
                    journey_id: None,
                    scheduled_time: start() + Duration::minutes(offset),
                    alarm_type: AlarmType::Test,
                    profile_id: None,
                    label: "Test Alarm".into(),
                    dismissal: DismissalPolicy::default(),
                })
            })
            .unwrap()
        };
        let live = instance(5);
        let cancelled = instance(10);
        let _past = instance(-5);
        db.with(|db| db.resolve_instance(cancelled.id, Outcome::Cancelled, start()))
            .unwrap();

        let backend = Arc::new(ManualWakeScheduler::new());
        let gateway = Arc::new(SchedulingGateway::new(
            backend.clone(),
            Arc::new(Noop::default()),
            clock.clone(),
            EventBus::new(),
        ));
        let coordinator = RecoveryCoordinator::new(
            db.clone(),
            gateway.clone(),
            clock,
            EventBus::new(),
            LifecyclePolicy::default(),
            30,
        );

        let report = coordinator.recover(RecoveryTrigger::Boot).unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.armed, 2);
        assert_eq!(report.failed, 0);

        let leave_now = journey
            .alarms
            .iter()
            .find(|a| a.scheduled_time == departure)
            .unwrap();
        let keys: Vec<AlarmKey> = gateway.pending().into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec![live.key(), leave_now.key()]);

        // A resync finds everything already armed.
        let again = coordinator.recover(RecoveryTrigger::Resync).unwrap();
        assert_eq!(again.examined, 2);
        assert_eq!(again.armed, 0);
        assert_eq!(backend.pending_count(), 2);

        // A clock change re-arms regardless; still one registration per key.
        let changed = coordinator.recover(RecoveryTrigger::ClockChanged).unwrap();
        assert_eq!(changed.armed, 2);
        assert_eq!(backend.pending_count(), 2);
    }
}
