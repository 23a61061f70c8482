//! Delivery state machine.
//!
//! A wake that survives the gateway lands in [`DeliveryEngine::on_wake`], which
//! starts an alert session: render, looping audio, repeating vibration and, for
//! alarms nobody has to dismiss, an auto-stop countdown. Every way a session can
//! end (dismiss, auto-stop, cancel) goes through [`DeliveryEngine::resolve`],
//! where an atomic flag per session picks exactly one winner.
//!
//! Physical teardown always runs before the outcome is written to the store, and
//! a failed write never undoes it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::gateway::WakeHandler;
use super::sink::AlertSink;
use super::types::{AlarmKey, AlarmPayload, Outcome};
use crate::clock::Clock;
use crate::error::CoreError;
use crate::events::{Event, EventBus};
use crate::storage::{DeliveryConfig, SharedDb};

/// Delivery knobs taken from `[delivery]` in the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySettings {
    pub vibration_pattern_ms: Vec<u64>,
    pub fallback_auto_stop_secs: u32,
    /// Played when an alarm carries neither a sound name nor a URI.
    pub default_sound_name: String,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            vibration_pattern_ms: config.vibration_pattern_ms.clone(),
            fallback_auto_stop_secs: config.default_auto_stop_secs,
            default_sound_name: config.default_sound_name.clone(),
        }
    }
}

/// What a call to [`DeliveryEngine::resolve`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveResult {
    /// This call won and tore the alert down.
    Resolved,
    /// Someone else already resolved it; nothing was done.
    AlreadyResolved,
    /// The alarm is not ringing in this process.
    NotRinging,
}

struct AlertSession {
    payload: AlarmPayload,
    resolved: AtomicBool,
    countdown: CancellationToken,
}

#[derive(Default)]
struct DeliveryState {
    ringing: HashMap<AlarmKey, Arc<AlertSession>>,
    /// Keys that must never ring again in this process: resolved here, or
    /// cancelled before their wake arrived.
    terminal: HashSet<AlarmKey>,
}

pub struct DeliveryEngine {
    me: Weak<DeliveryEngine>,
    db: SharedDb,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    events: EventBus,
    settings: DeliverySettings,
    state: Mutex<DeliveryState>,
}

/// Whether the store still wants `key` to ring.
///
/// `None` when the row is gone, disabled or resolved; otherwise the journey the
/// alarm belongs to, if any.
fn still_wanted(db: &SharedDb, key: AlarmKey) -> Result<Option<Option<i64>>, CoreError> {
    db.with(|db| match key {
        AlarmKey::Scheduled(id) => Ok(db
            .get_scheduled_alarm(id)?
            .filter(|a| a.is_enabled && !a.is_terminal())
            .map(|a| Some(a.journey_id))),
        AlarmKey::Instance(id) => Ok(db
            .get_instance(id)?
            .filter(|i| i.is_active && !i.is_terminal())
            .map(|i| i.journey_id)),
    })
}

impl DeliveryEngine {
    pub fn new(
        db: SharedDb,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
        events: EventBus,
        settings: DeliverySettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            db,
            sink,
            clock,
            runtime,
            events,
            settings,
            state: Mutex::new(DeliveryState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `key` as cancelled so a wake already in flight is dropped.
    pub fn tombstone(&self, key: AlarmKey) {
        self.state().terminal.insert(key);
    }

    pub fn is_ringing(&self, key: AlarmKey) -> bool {
        self.state().ringing.contains_key(&key)
    }

    /// Payloads of every alert currently ringing, ordered by key.
    pub fn ringing(&self) -> Vec<AlarmPayload> {
        let mut ringing: Vec<AlarmPayload> = self
            .state()
            .ringing
            .values()
            .map(|s| s.payload.clone())
            .collect();
        ringing.sort_by_key(|p| p.key);
        ringing
    }

    fn deliver(&self, mut payload: AlarmPayload) {
        let key = payload.key;
        {
            let state = self.state();
            if state.terminal.contains(&key) {
                tracing::info!(%key, "wake for cancelled alarm ignored");
                return;
            }
            if state.ringing.contains_key(&key) {
                tracing::debug!(%key, "already ringing");
                return;
            }
        }

        let now = self.clock.now();
        match still_wanted(&self.db, key) {
            Ok(None) => {
                tracing::info!(%key, "wake for inactive alarm ignored");
                return;
            }
            Ok(Some(journey_id)) => {
                let stamped = self.db.with(|db| {
                    match key {
                        AlarmKey::Scheduled(id) => db.mark_alarm_fired(id, now)?,
                        AlarmKey::Instance(id) => db.mark_instance_fired(id, now)?,
                    };
                    if let Some(journey_id) = journey_id {
                        db.mark_journey_started(journey_id, now)?;
                    }
                    Ok(())
                });
                if let Err(e) = stamped {
                    tracing::error!(%key, error = %e, "failed to stamp fired alarm");
                }
            }
            // Ringing without bookkeeping beats not ringing at all.
            Err(e) => tracing::error!(%key, error = %e, "store check failed, delivering anyway"),
        }

        if !payload.requires_user_dismiss && payload.auto_stop_after_secs.is_none() {
            payload.auto_stop_after_secs = Some(self.settings.fallback_auto_stop_secs);
        }
        if payload.sound.name.is_none() && payload.sound.uri.is_none() {
            payload.sound.name = Some(self.settings.default_sound_name.clone());
        }

        let session = Arc::new(AlertSession {
            payload: payload.clone(),
            resolved: AtomicBool::new(false),
            countdown: CancellationToken::new(),
        });
        {
            let mut state = self.state();
            if state.terminal.contains(&key) {
                tracing::info!(%key, "alarm cancelled while waking");
                return;
            }
            if state.ringing.contains_key(&key) {
                return;
            }
            state.ringing.insert(key, Arc::clone(&session));
        }

        if let Err(e) = self.sink.render(&payload) {
            tracing::error!(%key, error = %e, "alert render failed");
        }
        if let Err(e) = self.sink.start_audio(key, &payload.sound) {
            tracing::error!(%key, error = %e, "alert audio failed");
        }
        if payload.vibration_enabled {
            if let Err(e) = self
                .sink
                .start_vibration(key, &self.settings.vibration_pattern_ms)
            {
                tracing::error!(%key, error = %e, "alert vibration failed");
            }
        }

        tracing::info!(%key, label = %payload.label, "alarm fired");
        self.events.emit(Event::AlarmFired {
            key,
            label: payload.label.clone(),
            scheduled_time: payload.scheduled_time,
            auto_stop_after_secs: payload.auto_stop_after_secs,
            at: now,
        });

        if let Some(secs) = payload.auto_stop_after_secs {
            self.start_countdown(key, &session, StdDuration::from_secs(u64::from(secs)));
        }
    }

    fn start_countdown(&self, key: AlarmKey, session: &AlertSession, after: StdDuration) {
        let token = session.countdown.clone();
        let engine = self.me.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    if let Some(engine) = engine.upgrade() {
                        engine.resolve(key, Outcome::AutoStopped);
                    }
                }
            }
        });
    }

    /// Stop every output of `session`. Sink failures are logged and skipped.
    fn teardown(&self, key: AlarmKey, session: &AlertSession) {
        session.countdown.cancel();
        if let Err(e) = self.sink.stop_audio(key) {
            tracing::error!(%key, error = %e, "failed to stop audio");
        }
        if let Err(e) = self.sink.stop_vibration(key) {
            tracing::error!(%key, error = %e, "failed to stop vibration");
        }
        if let Err(e) = self.sink.dismiss_render(key) {
            tracing::error!(%key, error = %e, "failed to close alert");
        }
        let mut state = self.state();
        state.ringing.remove(&key);
        state.terminal.insert(key);
    }

    fn stamp(&self, key: AlarmKey, outcome: Outcome) {
        let now = self.clock.now();
        let result = self.db.with(|db| match key {
            AlarmKey::Scheduled(id) => db.resolve_scheduled_alarm(id, outcome, now),
            AlarmKey::Instance(id) => db.resolve_instance(id, outcome, now),
        });
        match result {
            Ok(true) => {}
            Ok(false) => tracing::debug!(%key, outcome = outcome.as_str(), "outcome already recorded"),
            Err(e) => tracing::error!(
                %key,
                outcome = outcome.as_str(),
                error = %e,
                "failed to record outcome; alert already stopped"
            ),
        }
    }

    /// End the ringing alert for `key` with `outcome`.
    ///
    /// Exactly one caller per session gets [`ResolveResult::Resolved`]; it stops
    /// the outputs, then records the outcome.
    pub fn resolve(&self, key: AlarmKey, outcome: Outcome) -> ResolveResult {
        let session = {
            let state = self.state();
            match state.ringing.get(&key) {
                Some(session) => Arc::clone(session),
                None if state.terminal.contains(&key) => {
                    tracing::debug!(%key, outcome = outcome.as_str(), "resolve lost the race");
                    return ResolveResult::AlreadyResolved;
                }
                None => return ResolveResult::NotRinging,
            }
        };

        if session.resolved.swap(true, Ordering::AcqRel) {
            tracing::debug!(%key, outcome = outcome.as_str(), "resolve lost the race");
            return ResolveResult::AlreadyResolved;
        }

        self.teardown(key, &session);
        self.stamp(key, outcome);

        tracing::info!(%key, outcome = outcome.as_str(), "alarm resolved");
        self.events.emit(Event::AlarmResolved {
            key,
            outcome,
            at: self.clock.now(),
        });
        ResolveResult::Resolved
    }

    /// Stop alerts whose rows were resolved by another process (a one-shot CLI
    /// dismiss while the daemon rings). Returns how many were stopped.
    ///
    /// Also forgets terminal keys whose rows are resolved or gone; the store
    /// keeps those from ringing on its own.
    pub fn reconcile_with_store(&self) -> usize {
        self.prune_terminal();

        let ringing: Vec<(AlarmKey, Arc<AlertSession>)> = self
            .state()
            .ringing
            .iter()
            .map(|(k, s)| (*k, Arc::clone(s)))
            .collect();

        let mut stopped = 0;
        for (key, session) in ringing {
            let outcome = self.db.with(|db| match key {
                AlarmKey::Scheduled(id) => Ok(db.get_scheduled_alarm(id)?.map(|a| a.resolution)),
                AlarmKey::Instance(id) => Ok(db.get_instance(id)?.map(|i| i.resolution)),
            });
            let outcome = match outcome {
                Ok(Some(Some(outcome))) => outcome,
                // Deleted with its journey.
                Ok(None) => Outcome::Cancelled,
                Ok(Some(None)) => continue,
                Err(e) => {
                    tracing::warn!(%key, error = %e, "could not reconcile ringing alarm");
                    continue;
                }
            };
            if session.resolved.swap(true, Ordering::AcqRel) {
                continue;
            }
            self.teardown(key, &session);
            tracing::info!(%key, outcome = outcome.as_str(), "alarm resolved elsewhere");
            self.events.emit(Event::AlarmResolved {
                key,
                outcome,
                at: self.clock.now(),
            });
            stopped += 1;
        }
        stopped
    }

    fn prune_terminal(&self) {
        let keys: Vec<AlarmKey> = {
            let state = self.state();
            state
                .terminal
                .iter()
                .filter(|k| !state.ringing.contains_key(k))
                .copied()
                .collect()
        };
        if keys.is_empty() {
            return;
        }

        // A key whose row is still unresolved may be a cancel in progress.
        let settled = self.db.with(|db| {
            let mut settled = Vec::new();
            for key in keys {
                let done = match key {
                    AlarmKey::Scheduled(id) => db
                        .get_scheduled_alarm(id)?
                        .map_or(true, |a| a.is_terminal()),
                    AlarmKey::Instance(id) => {
                        db.get_instance(id)?.map_or(true, |i| i.is_terminal())
                    }
                };
                if done {
                    settled.push(key);
                }
            }
            Ok(settled)
        });
        match settled {
            Ok(settled) => {
                let mut state = self.state();
                for key in &settled {
                    state.terminal.remove(key);
                }
                tracing::debug!(
                    pruned = settled.len(),
                    left = state.terminal.len(),
                    "pruned terminal keys"
                );
            }
            Err(e) => tracing::warn!(error = %e, "could not prune terminal keys"),
        }
    }
}

impl WakeHandler for DeliveryEngine {
    fn on_wake(&self, payload: AlarmPayload) {
        self.deliver(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::sink::{RecordingAlertSink, SinkCall};
    use crate::alarm::{AlarmType, NewInstance};
    use crate::clock::ManualClock;
    use crate::profile::{DismissalPolicy, SoundDescriptor};
    use crate::storage::AlarmDb;
    use chrono::{DateTime, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap()
    }

    struct Fixture {
        db: SharedDb,
        sink: Arc<RecordingAlertSink>,
        engine: Arc<DeliveryEngine>,
    }

    fn fixture(sink: RecordingAlertSink) -> Fixture {
        let db = SharedDb::new(AlarmDb::open_memory().unwrap());
        let sink = Arc::new(sink);
        let engine = DeliveryEngine::new(
            db.clone(),
            sink.clone(),
            Arc::new(ManualClock::new(start())),
            Handle::current(),
            EventBus::new(),
            DeliverySettings::default(),
        );
        Fixture { db, sink, engine }
    }

    fn instance(f: &Fixture, requires_user_dismiss: bool) -> AlarmPayload {
        let new = NewInstance {
            journey_id: None,
            scheduled_time: start(),
            alarm_type: AlarmType::Test,
            profile_id: None,
            label: "Test Alarm".into(),
            dismissal: DismissalPolicy {
                requires_user_dismiss,
                auto_stop_after_minutes: None,
            },
        };
        let stored = f.db.with(|db| db.insert_instance(&new)).unwrap();
        AlarmPayload {
            auto_stop_after_secs: None,
            ..stored.payload(30)
        }
    }

    #[tokio::test]
    async fn wake_starts_every_output() {
        let f = fixture(RecordingAlertSink::new());
        let payload = instance(&f, true);
        let key = payload.key;

        f.engine.on_wake(payload);

        assert!(f.engine.is_ringing(key));
        assert_eq!(
            f.sink.calls(),
            vec![
                SinkCall::Render(key),
                SinkCall::StartAudio(key),
                SinkCall::StartVibration(key)
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_wake_rings_once() {
        let f = fixture(RecordingAlertSink::new());
        let payload = instance(&f, true);
        f.engine.on_wake(payload.clone());
        f.engine.on_wake(payload.clone());
        assert_eq!(f.sink.count(&SinkCall::Render(payload.key)), 1);
    }

    #[tokio::test]
    async fn dismiss_racing_auto_stop_resolves_once() {
        let f = fixture(RecordingAlertSink::new());
        let payload = instance(&f, false);
        let key = payload.key;
        f.engine.on_wake(payload);

        let a = Arc::clone(&f.engine);
        let b = Arc::clone(&f.engine);
        let dismiss = std::thread::spawn(move || a.resolve(key, Outcome::Dismissed));
        let auto = std::thread::spawn(move || b.resolve(key, Outcome::AutoStopped));
        let results = [dismiss.join().unwrap(), auto.join().unwrap()];

        assert_eq!(
            results.iter().filter(|r| **r == ResolveResult::Resolved).count(),
            1
        );
        assert_eq!(
            results
                .iter()
                .filter(|r| **r == ResolveResult::AlreadyResolved)
                .count(),
            1
        );
        assert_eq!(f.sink.count(&SinkCall::StopAudio(key)), 1);
        assert_eq!(f.sink.count(&SinkCall::StopVibration(key)), 1);

        let AlarmKey::Instance(id) = key else { unreachable!() };
        let stored = f.db.with(|db| db.get_instance(id)).unwrap().unwrap();
        assert!(stored.acknowledged_at.is_some());
        assert!(stored.cancelled_at.is_none());
        assert!(!stored.is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn instance_without_dismissal_auto_stops_within_30s() {
        let f = fixture(RecordingAlertSink::new());
        let payload = instance(&f, false);
        let key = payload.key;
        let mut rx = f.engine.events.subscribe();

        f.engine.on_wake(payload);
        tokio::time::sleep(StdDuration::from_secs(29)).await;
        assert!(f.engine.is_ringing(key));

        tokio::time::sleep(StdDuration::from_secs(2)).await;
        assert!(!f.engine.is_ringing(key));

        let AlarmKey::Instance(id) = key else { unreachable!() };
        let stored = f.db.with(|db| db.get_instance(id)).unwrap().unwrap();
        assert_eq!(stored.resolution, Some(Outcome::AutoStopped));
        assert!(stored.acknowledged_at.is_some());
        assert!(stored.cancelled_at.is_none());

        assert!(matches!(rx.try_recv().unwrap(), Event::AlarmFired { auto_stop_after_secs: Some(30), .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::AlarmResolved {
                outcome: Outcome::AutoStopped,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dismiss_cancels_countdown() {
        let f = fixture(RecordingAlertSink::new());
        let payload = instance(&f, false);
        let key = payload.key;
        f.engine.on_wake(payload);

        assert_eq!(f.engine.resolve(key, Outcome::Dismissed), ResolveResult::Resolved);
        tokio::time::sleep(StdDuration::from_secs(60)).await;

        assert_eq!(f.sink.count(&SinkCall::StopAudio(key)), 1);
        assert_eq!(
            f.engine.resolve(key, Outcome::AutoStopped),
            ResolveResult::AlreadyResolved
        );
        let AlarmKey::Instance(id) = key else { unreachable!() };
        let stored = f.db.with(|db| db.get_instance(id)).unwrap().unwrap();
        assert_eq!(stored.resolution, Some(Outcome::Dismissed));
    }

    #[tokio::test]
    async fn tombstoned_key_never_rings() {
        let f = fixture(RecordingAlertSink::new());
        let payload = instance(&f, true);
        f.engine.tombstone(payload.key);
        f.engine.on_wake(payload.clone());
        assert!(f.sink.calls().is_empty());
        assert_eq!(
            f.engine.resolve(payload.key, Outcome::Dismissed),
            ResolveResult::AlreadyResolved
        );
    }

    #[tokio::test]
    async fn resolved_row_is_not_delivered() {
        let f = fixture(RecordingAlertSink::new());
        let payload = instance(&f, true);
        let AlarmKey::Instance(id) = payload.key else { unreachable!() };
        f.db
            .with(|db| db.resolve_instance(id, Outcome::Cancelled, start()))
            .unwrap();
        f.engine.on_wake(payload);
        assert!(f.sink.calls().is_empty());
    }

    #[tokio::test]
    async fn stamp_failure_still_stops_outputs() {
        let f = fixture(RecordingAlertSink::new());
        let payload = instance(&f, true);
        let key = payload.key;
        f.engine.on_wake(payload);

        f.db
            .with(|db| {
                db.conn().execute_batch("DROP TABLE alarm_instances")?;
                Ok(())
            })
            .unwrap();

        assert_eq!(f.engine.resolve(key, Outcome::Dismissed), ResolveResult::Resolved);
        assert_eq!(f.sink.count(&SinkCall::StopAudio(key)), 1);
        assert_eq!(f.sink.count(&SinkCall::StopVibration(key)), 1);
        assert_eq!(f.sink.count(&SinkCall::DismissRender(key)), 1);
        assert!(!f.engine.is_ringing(key));
    }

    #[tokio::test]
    async fn audio_failure_does_not_block_render() {
        let f = fixture(RecordingAlertSink::with_failing_audio());
        let payload = instance(&f, true);
        let key = payload.key;
        f.engine.on_wake(payload);
        assert_eq!(f.sink.count(&SinkCall::Render(key)), 1);
        assert_eq!(f.sink.count(&SinkCall::StartVibration(key)), 1);
        assert!(f.engine.is_ringing(key));
    }

    #[tokio::test]
    async fn reconcile_stops_alarms_resolved_elsewhere() {
        let f = fixture(RecordingAlertSink::new());
        let payload = instance(&f, true);
        let key = payload.key;
        f.engine.on_wake(payload);

        let AlarmKey::Instance(id) = key else { unreachable!() };
        f.db
            .with(|db| db.resolve_instance(id, Outcome::Dismissed, start()))
            .unwrap();

        assert_eq!(f.engine.reconcile_with_store(), 1);
        assert!(!f.engine.is_ringing(key));
        assert_eq!(f.sink.count(&SinkCall::StopAudio(key)), 1);
        assert_eq!(f.engine.reconcile_with_store(), 0);
    }

    #[tokio::test]
    async fn firing_stamps_instance() {
        let f = fixture(RecordingAlertSink::new());
        let payload = instance(&f, true);
        let AlarmKey::Instance(id) = payload.key else { unreachable!() };
        f.engine.on_wake(payload);

        let stored = f.db.with(|db| db.get_instance(id)).unwrap().unwrap();
        assert_eq!(stored.fired_at, Some(start()));
        assert!(stored.resolution.is_none());
    }

    #[tokio::test]
    async fn settled_keys_leave_the_terminal_set() {
        let f = fixture(RecordingAlertSink::new());
        let rung = instance(&f, true);
        let pending_cancel = instance(&f, true);
        let purged = instance(&f, true);

        f.engine.on_wake(rung.clone());
        f.engine.resolve(rung.key, Outcome::Dismissed);
        f.engine.tombstone(pending_cancel.key);
        f.engine.tombstone(purged.key);
        let AlarmKey::Instance(purged_id) = purged.key else { unreachable!() };
        f.db
            .with(|db| {
                db.conn()
                    .execute("DELETE FROM alarm_instances WHERE id = ?1", [purged_id])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(f.engine.state().terminal.len(), 3);

        f.engine.reconcile_with_store();
        let terminal = f.engine.state().terminal.clone();
        assert_eq!(terminal, HashSet::from([pending_cancel.key]));

        // The resolved row still keeps a late wake from ringing.
        f.engine.on_wake(rung.clone());
        assert_eq!(f.sink.count(&SinkCall::Render(rung.key)), 1);
        assert!(!f.engine.is_ringing(rung.key));
    }

    #[tokio::test]
    async fn fallbacks_apply_when_payload_lacks_them() {
        let f = fixture(RecordingAlertSink::new());
        let payload = AlarmPayload {
            sound: SoundDescriptor::default(),
            ..instance(&f, false)
        };
        let key = payload.key;
        f.engine.on_wake(payload);
        let ringing = f.engine.ringing().into_iter().find(|p| p.key == key).unwrap();
        assert_eq!(ringing.auto_stop_after_secs, Some(30));
        assert_eq!(ringing.sound.name.as_deref(), Some("Default Alarm"));
    }
}
