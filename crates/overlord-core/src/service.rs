//! The operations front-ends call.
//!
//! [`AlarmService`] wires the store, the profile catalog, the scheduling gateway,
//! delivery and recovery together. It owns no state of its own beyond those
//! components, so several services may share one [`SharedDb`].

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::alarm::{
    AlarmInstance, AlarmKey, AlarmPayload, AlarmType, AlertSink, DeliveryEngine, DeliverySettings,
    NewInstance, Outcome, PendingWake, RecoveryCoordinator, RecoveryReport, RecoveryTrigger,
    ResolveResult, SchedulingGateway, TokioWakeScheduler, WakeScheduler,
};
use crate::clock::Clock;
use crate::error::{CoreError, ValidationError};
use crate::events::{Event, EventBus};
use crate::journey::{
    materialize, JourneyReceipt, JourneyStatus, JourneyWithAlarms, LifecyclePolicy,
    RouteSelection, ScheduledAlarm,
};
use crate::profile::{AlarmTemplate, DismissalPolicy, ProfileCatalog, SoundDescriptor, TemplateDraft};
use crate::storage::{Config, SharedDb};

/// Label given to test alarms when none is supplied.
pub const TEST_ALARM_LABEL: &str = "Test Alarm";

/// Per-alarm edits after a journey was scheduled. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmAdjustment {
    /// Move to this absolute time.
    pub time: Option<DateTime<Utc>>,
    /// Move by this many minutes (negative = earlier).
    pub shift_minutes: Option<i64>,
    pub label: Option<String>,
    pub enabled: Option<bool>,
    pub sound: Option<SoundDescriptor>,
    pub vibration_enabled: Option<bool>,
}

impl AlarmAdjustment {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.time.is_some() && self.shift_minutes.is_some() {
            return Err(ValidationError::InvalidValue {
                field: "time".into(),
                message: "give either an absolute time or a shift, not both".into(),
            });
        }
        if self.label.as_deref().is_some_and(|l| l.trim().is_empty()) {
            return Err(ValidationError::Empty("label"));
        }
        Ok(())
    }

    fn apply(&self, alarm: &mut ScheduledAlarm) {
        if let Some(time) = self.time {
            alarm.scheduled_time = time;
        }
        if let Some(shift) = self.shift_minutes {
            alarm.scheduled_time += Duration::minutes(shift);
        }
        if let Some(label) = &self.label {
            alarm.label = label.trim().to_string();
        }
        if let Some(enabled) = self.enabled {
            alarm.is_enabled = enabled;
        }
        if let Some(sound) = &self.sound {
            alarm.sound = sound.clone();
        }
        if let Some(vibration) = self.vibration_enabled {
            alarm.vibration_enabled = vibration;
        }
    }
}

pub struct AlarmService {
    db: SharedDb,
    catalog: ProfileCatalog,
    gateway: Arc<SchedulingGateway>,
    delivery: Arc<DeliveryEngine>,
    recovery: RecoveryCoordinator,
    clock: Arc<dyn Clock>,
    events: EventBus,
    fallback_auto_stop_secs: u32,
}

impl AlarmService {
    pub fn new(
        db: SharedDb,
        backend: Arc<dyn WakeScheduler>,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
        config: &Config,
    ) -> Self {
        let events = EventBus::new();
        let fallback_auto_stop_secs = config.delivery.default_auto_stop_secs;
        let delivery = DeliveryEngine::new(
            db.clone(),
            sink,
            Arc::clone(&clock),
            runtime,
            events.clone(),
            DeliverySettings::from(&config.delivery),
        );
        let gateway = Arc::new(SchedulingGateway::new(
            backend,
            delivery.clone(),
            Arc::clone(&clock),
            events.clone(),
        ));
        let recovery = RecoveryCoordinator::new(
            db.clone(),
            Arc::clone(&gateway),
            Arc::clone(&clock),
            events.clone(),
            LifecyclePolicy::from(&config.journeys),
            fallback_auto_stop_secs,
        );
        Self {
            catalog: ProfileCatalog::new(db.clone(), Arc::clone(&clock)),
            db,
            gateway,
            delivery,
            recovery,
            clock,
            events,
            fallback_auto_stop_secs,
        }
    }

    /// A service whose wakes are tokio timers on `runtime`.
    pub fn with_tokio_backend(
        db: SharedDb,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
        config: &Config,
    ) -> Self {
        let backend = Arc::new(TokioWakeScheduler::new(
            runtime.clone(),
            Arc::clone(&clock),
            config.scheduling.exact_wake_permitted,
            StdDuration::from_secs(config.scheduling.inexact_window_secs),
        ));
        Self::new(db, backend, sink, clock, runtime, config)
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    pub fn catalog(&self) -> &ProfileCatalog {
        &self.catalog
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn pending_wakes(&self) -> Vec<PendingWake> {
        self.gateway.pending()
    }

    pub fn ringing(&self) -> Vec<AlarmPayload> {
        self.delivery.ringing()
    }

    // ------------------------------------------------------------------------
    // Journeys
    // ------------------------------------------------------------------------

    /// Materialize `profile_id` against the route's departure, persist the
    /// journey and arm every enabled alarm.
    ///
    /// Alarms already in the past are armed too and ring right away.
    ///
    /// # Errors
    /// `Validation` for a bad route or an empty profile, `NotFound` for an
    /// unknown profile, or a store error. Arm failures are counted in the receipt.
    pub fn schedule_journey(
        &self,
        profile_id: i64,
        route: &RouteSelection,
    ) -> Result<JourneyReceipt, CoreError> {
        route.validate()?;
        let profile = self.catalog.load_profile(profile_id)?;
        if profile.templates.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "profile".into(),
                message: format!("profile '{}' has no alarms", profile.profile.name),
            }
            .into());
        }

        let alarms = materialize(&profile, route.departure_time, self.fallback_auto_stop_secs);
        let now = self.clock.now();
        let stored = self
            .db
            .with(|db| db.insert_journey(route, &profile.profile, &alarms, now))?;

        let (armed, failed) = self.arm_all(
            stored
                .alarms
                .iter()
                .filter(|a| a.is_armable())
                .map(ScheduledAlarm::payload),
        );

        tracing::info!(
            journey_id = stored.journey.id,
            profile = %profile.profile.name,
            departure = %route.departure_time,
            alarms = stored.alarms.len(),
            armed,
            failed,
            "scheduled journey"
        );
        self.events.emit(Event::JourneyScheduled {
            journey_id: stored.journey.id,
            alarms: stored.alarms.len(),
            armed,
            at: now,
        });

        Ok(JourneyReceipt {
            journey: stored.journey,
            alarms: stored.alarms,
            armed,
            failed,
        })
    }

    fn arm_all(&self, payloads: impl Iterator<Item = AlarmPayload>) -> (usize, usize) {
        let mut armed = 0;
        let mut failed = 0;
        for payload in payloads {
            let key = payload.key;
            match self.gateway.arm(payload) {
                Ok(_) => armed += 1,
                Err(e) => {
                    tracing::error!(%key, error = %e, "could not arm alarm");
                    failed += 1;
                }
            }
        }
        (armed, failed)
    }

    /// Cancel the journey and every alarm of it that has not ended yet.
    ///
    /// # Errors
    /// `NotFound` if the journey does not exist.
    pub fn cancel_journey(&self, journey_id: i64) -> Result<JourneyWithAlarms, CoreError> {
        let now = self.clock.now();
        let alarms = self.db.with(|db| {
            if !db.set_journey_status(journey_id, JourneyStatus::Cancelled, now)? {
                return Err(CoreError::not_found("journey", journey_id));
            }
            db.alarms_for_journey(journey_id)
        })?;

        for alarm in alarms.iter().filter(|a| !a.is_terminal()) {
            self.cancel_alarm(alarm.key())?;
        }

        tracing::info!(journey_id, "cancelled journey");
        self.events.emit(Event::JourneyCancelled { journey_id, at: now });

        self.db.with(|db| {
            db.load_journey(journey_id)?
                .ok_or_else(|| CoreError::not_found("journey", journey_id))
        })
    }

    // ------------------------------------------------------------------------
    // Alarms
    // ------------------------------------------------------------------------

    fn ensure_exists(&self, key: AlarmKey) -> Result<(), CoreError> {
        let exists = self.db.with(|db| match key {
            AlarmKey::Scheduled(id) => Ok(db.get_scheduled_alarm(id)?.is_some()),
            AlarmKey::Instance(id) => Ok(db.get_instance(id)?.is_some()),
        })?;
        if exists {
            Ok(())
        } else {
            Err(CoreError::not_found("alarm", key))
        }
    }

    fn stamp(&self, key: AlarmKey, outcome: Outcome) -> Result<bool, CoreError> {
        let now = self.clock.now();
        self.db.with(|db| match key {
            AlarmKey::Scheduled(id) => db.resolve_scheduled_alarm(id, outcome, now),
            AlarmKey::Instance(id) => db.resolve_instance(id, outcome, now),
        })
    }

    /// Cancel an alarm whether or not it has fired. Idempotent.
    ///
    /// A wake racing the cancel is dropped. Returns false if the alarm had
    /// already ended.
    ///
    /// # Errors
    /// `NotFound` for an unknown key, or a store error after the wake was
    /// already removed.
    pub fn cancel_alarm(&self, key: AlarmKey) -> Result<bool, CoreError> {
        self.ensure_exists(key)?;
        self.delivery.tombstone(key);
        self.gateway.disarm(key);
        match self.delivery.resolve(key, Outcome::Cancelled) {
            ResolveResult::Resolved => Ok(true),
            ResolveResult::AlreadyResolved | ResolveResult::NotRinging => {
                let changed = self.stamp(key, Outcome::Cancelled)?;
                if changed {
                    tracing::info!(%key, "cancelled alarm");
                    self.events.emit(Event::AlarmResolved {
                        key,
                        outcome: Outcome::Cancelled,
                        at: self.clock.now(),
                    });
                }
                Ok(changed)
            }
        }
    }

    /// Dismiss an alarm that is ringing, here or in another process. Idempotent.
    ///
    /// Alarms that have not rung yet cannot be dismissed; cancel them instead.
    ///
    /// # Errors
    /// `NotFound` for an unknown key, `Validation` for an alarm that has not
    /// fired, or a store error.
    pub fn dismiss_alarm(&self, key: AlarmKey) -> Result<bool, CoreError> {
        match self.delivery.resolve(key, Outcome::Dismissed) {
            ResolveResult::Resolved => Ok(true),
            ResolveResult::AlreadyResolved => Ok(false),
            ResolveResult::NotRinging => {
                let (fired, terminal) = self
                    .db
                    .with(|db| match key {
                        AlarmKey::Scheduled(id) => Ok(db
                            .get_scheduled_alarm(id)?
                            .map(|a| (a.is_fired, a.is_terminal()))),
                        AlarmKey::Instance(id) => Ok(db
                            .get_instance(id)?
                            .map(|i| (i.fired_at.is_some(), i.is_terminal()))),
                    })?
                    .ok_or_else(|| CoreError::not_found("alarm", key))?;
                if terminal {
                    return Ok(false);
                }
                if !fired {
                    return Err(ValidationError::InvalidValue {
                        field: "alarm".into(),
                        message: format!("alarm {key} has not fired yet; cancel it instead"),
                    }
                    .into());
                }

                self.delivery.tombstone(key);
                self.gateway.disarm(key);
                let changed = self.stamp(key, Outcome::Dismissed)?;
                if changed {
                    tracing::info!(%key, "dismissed alarm");
                    self.events.emit(Event::AlarmResolved {
                        key,
                        outcome: Outcome::Dismissed,
                        at: self.clock.now(),
                    });
                }
                Ok(changed)
            }
        }
    }

    /// Edit one scheduled alarm and re-arm or disarm it to match.
    ///
    /// Templates are never touched.
    ///
    /// # Errors
    /// `Validation` for conflicting or blank fields and for alarms that already
    /// fired or ended, `NotFound` for an unknown id, `Scheduling` if the new time
    /// could not be armed.
    pub fn adjust_alarm(
        &self,
        alarm_id: i64,
        adjustment: &AlarmAdjustment,
    ) -> Result<ScheduledAlarm, CoreError> {
        adjustment.validate()?;
        let (alarm, status) = self.db.with(|db| {
            let mut alarm = db
                .get_scheduled_alarm(alarm_id)?
                .ok_or_else(|| CoreError::not_found("alarm", alarm_id))?;
            if alarm.is_fired || alarm.is_terminal() {
                return Err(ValidationError::InvalidValue {
                    field: "alarm".into(),
                    message: format!("alarm {alarm_id} already fired or ended"),
                }
                .into());
            }
            adjustment.apply(&mut alarm);
            db.update_scheduled_alarm(&alarm)?;
            let journey = db
                .get_journey(alarm.journey_id)?
                .ok_or_else(|| CoreError::not_found("journey", alarm.journey_id))?;
            Ok((alarm, journey.status))
        })?;

        if alarm.is_armable() && status.is_live() {
            self.gateway.arm(alarm.payload())?;
        } else {
            self.gateway.disarm(alarm.key());
        }
        tracing::info!(
            alarm_id,
            time = %alarm.scheduled_time,
            enabled = alarm.is_enabled,
            "adjusted alarm"
        );
        Ok(alarm)
    }

    /// Create and arm a standalone test alarm `delay` from now.
    ///
    /// # Errors
    /// Returns an error if the instance cannot be stored or armed.
    pub fn schedule_test_alarm(
        &self,
        delay: Duration,
        label: Option<&str>,
        dismissal: DismissalPolicy,
    ) -> Result<AlarmInstance, CoreError> {
        let label = label
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(TEST_ALARM_LABEL);
        let new = NewInstance {
            journey_id: None,
            scheduled_time: self.clock.now() + delay,
            alarm_type: AlarmType::Test,
            profile_id: None,
            label: label.to_string(),
            dismissal,
        };
        let instance = self.db.with(|db| db.insert_instance(&new))?;
        self.gateway
            .arm(instance.payload(self.fallback_auto_stop_secs))?;
        tracing::info!(instance_id = instance.id, at = %instance.scheduled_time, "scheduled test alarm");
        Ok(instance)
    }

    // ------------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------------

    /// See [`ProfileCatalog::upsert_template`].
    ///
    /// # Errors
    /// As [`ProfileCatalog::upsert_template`].
    pub fn upsert_template(
        &self,
        profile_id: i64,
        target: Option<i32>,
        draft: &TemplateDraft,
    ) -> Result<Vec<AlarmTemplate>, CoreError> {
        self.catalog.upsert_template(profile_id, target, draft)
    }

    /// See [`ProfileCatalog::delete_template`].
    ///
    /// # Errors
    /// As [`ProfileCatalog::delete_template`].
    pub fn delete_template(&self, template_id: i64) -> Result<Vec<AlarmTemplate>, CoreError> {
        self.catalog.delete_template(template_id)
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    /// Stop alerts resolved by other processes, then re-arm everything due.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub fn recover(&self, trigger: RecoveryTrigger) -> Result<RecoveryReport, CoreError> {
        let stopped = self.delivery.reconcile_with_store();
        if stopped > 0 {
            tracing::info!(stopped, "stopped alerts resolved elsewhere");
        }
        self.recovery.recover(trigger)
    }
}
