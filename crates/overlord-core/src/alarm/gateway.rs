//! Scheduling gateway.
//!
//! Sits between the service and the platform's wake primitive. It keeps one
//! registration per [`AlarmKey`] and wraps every wake in a guard that consumes
//! the registration before delivering, so a key yields at most one delivery per
//! `arm` call no matter how the backend behaves.
//!
//! ## Backends
//!
//! - [`TokioWakeScheduler`]: in-process timers on a tokio runtime
//! - [`ManualWakeScheduler`]: nothing fires until [`ManualWakeScheduler::fire_due`]
//!   is called, for embedders that own their timer loop (and for tests)

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::types::{AlarmKey, AlarmPayload};
use crate::clock::Clock;
use crate::error::SchedulingError;
use crate::events::{Event, EventBus};

/// Callback a backend runs when a wake comes due.
pub type Deliverable = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakePrecision {
    Exact,
    /// The platform may defer the wake; used when exact wakes are refused.
    Inexact,
}

/// Platform wake primitive.
///
/// `arm` replaces any wake previously registered for the key. Implementations
/// must not run `deliverable` synchronously from inside `arm`.
pub trait WakeScheduler: Send + Sync {
    /// # Errors
    /// [`SchedulingError::ExactDenied`] when an exact wake is not allowed, or
    /// [`SchedulingError::Unavailable`] when nothing could be registered.
    fn arm(
        &self,
        key: AlarmKey,
        at: DateTime<Utc>,
        precision: WakePrecision,
        deliverable: Deliverable,
    ) -> Result<(), SchedulingError>;

    /// Remove the wake for `key`, if any.
    fn disarm(&self, key: AlarmKey);
}

/// Receives wakes that survived the gateway's staleness check.
pub trait WakeHandler: Send + Sync {
    fn on_wake(&self, payload: AlarmPayload);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Registration {
    generation: u64,
    at: DateTime<Utc>,
    precision: WakePrecision,
}

/// A registration as reported by [`SchedulingGateway::pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWake {
    pub key: AlarmKey,
    pub at: DateTime<Utc>,
    pub precision: WakePrecision,
}

type Registrations = Arc<Mutex<HashMap<AlarmKey, Registration>>>;

fn lock(registrations: &Mutex<HashMap<AlarmKey, Registration>>) -> MutexGuard<'_, HashMap<AlarmKey, Registration>> {
    registrations.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SchedulingGateway {
    backend: Arc<dyn WakeScheduler>,
    handler: Arc<dyn WakeHandler>,
    registrations: Registrations,
    next_generation: AtomicU64,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl SchedulingGateway {
    pub fn new(
        backend: Arc<dyn WakeScheduler>,
        handler: Arc<dyn WakeHandler>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            backend,
            handler,
            registrations: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            clock,
            events,
        }
    }

    fn deliverable(&self, generation: u64, payload: AlarmPayload) -> Deliverable {
        let registrations = Arc::clone(&self.registrations);
        let handler = Arc::clone(&self.handler);
        Box::new(move || {
            let key = payload.key;
            let current = {
                let mut regs = lock(&registrations);
                match regs.get(&key) {
                    Some(reg) if reg.generation == generation => {
                        regs.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                handler.on_wake(payload);
            } else {
                tracing::debug!(%key, generation, "discarding superseded wake");
            }
        })
    }

    /// Register the wake for `payload.key`, replacing any previous one.
    ///
    /// Tries an exact wake first and degrades to an inexact one if the backend
    /// refuses. Returns the precision that was obtained.
    ///
    /// # Errors
    /// Returns an error only if the backend could not register any wake; the key
    /// is left disarmed in that case.
    pub fn arm(&self, payload: AlarmPayload) -> Result<WakePrecision, SchedulingError> {
        let key = payload.key;
        let at = payload.scheduled_time;
        let mut regs = lock(&self.registrations);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let precision = match self.backend.arm(
            key,
            at,
            WakePrecision::Exact,
            self.deliverable(generation, payload.clone()),
        ) {
            Ok(()) => WakePrecision::Exact,
            Err(SchedulingError::ExactDenied(reason)) => {
                tracing::warn!(%key, %reason, "exact wake denied, falling back to inexact");
                match self.backend.arm(
                    key,
                    at,
                    WakePrecision::Inexact,
                    self.deliverable(generation, payload),
                ) {
                    Ok(()) => WakePrecision::Inexact,
                    Err(e) => {
                        regs.remove(&key);
                        self.backend.disarm(key);
                        tracing::error!(%key, error = %e, "could not arm alarm");
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                regs.remove(&key);
                self.backend.disarm(key);
                tracing::error!(%key, error = %e, "could not arm alarm");
                return Err(e);
            }
        };

        regs.insert(
            key,
            Registration {
                generation,
                at,
                precision,
            },
        );
        drop(regs);

        tracing::debug!(%key, %at, ?precision, "armed");
        self.events.emit(Event::AlarmArmed {
            key,
            scheduled_time: at,
            precision,
            at: self.clock.now(),
        });
        Ok(precision)
    }

    /// Remove the registration for `key`. Returns false if there was none.
    pub fn disarm(&self, key: AlarmKey) -> bool {
        let removed = {
            let mut regs = lock(&self.registrations);
            let removed = regs.remove(&key).is_some();
            self.backend.disarm(key);
            removed
        };
        if removed {
            tracing::debug!(%key, "disarmed");
            self.events.emit(Event::AlarmDisarmed {
                key,
                at: self.clock.now(),
            });
        }
        removed
    }

    pub fn is_armed(&self, key: AlarmKey) -> bool {
        lock(&self.registrations).contains_key(&key)
    }

    /// The instant `key` is currently armed for, if any.
    pub fn armed_at(&self, key: AlarmKey) -> Option<DateTime<Utc>> {
        lock(&self.registrations).get(&key).map(|reg| reg.at)
    }

    /// Current registrations in wake order.
    pub fn pending(&self) -> Vec<PendingWake> {
        let mut pending: Vec<PendingWake> = lock(&self.registrations)
            .iter()
            .map(|(key, reg)| PendingWake {
                key: *key,
                at: reg.at,
                precision: reg.precision,
            })
            .collect();
        pending.sort_by_key(|p| (p.at, p.key));
        pending
    }
}

// ============================================================================
// Tokio backend
// ============================================================================

struct Timer {
    id: u64,
    token: CancellationToken,
}

/// Wakes driven by tokio timers on the given runtime.
///
/// Delays are computed against the wall clock at arm time; wall-clock jumps after
/// that are handled by re-arming on recovery.
pub struct TokioWakeScheduler {
    runtime: Handle,
    clock: Arc<dyn Clock>,
    exact_permitted: bool,
    inexact_window: StdDuration,
    timers: Arc<Mutex<HashMap<AlarmKey, Timer>>>,
    next_id: AtomicU64,
}

impl TokioWakeScheduler {
    pub fn new(
        runtime: Handle,
        clock: Arc<dyn Clock>,
        exact_permitted: bool,
        inexact_window: StdDuration,
    ) -> Self {
        Self {
            runtime,
            clock,
            exact_permitted,
            inexact_window,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn delay_until(&self, at: DateTime<Utc>, precision: WakePrecision) -> StdDuration {
        let delay = (at - self.clock.now()).to_std().unwrap_or(StdDuration::ZERO);
        let window = self.inexact_window.as_millis();
        if precision == WakePrecision::Exact || window == 0 {
            return delay;
        }
        let rounded = delay.as_millis().div_ceil(window) * window;
        StdDuration::from_millis(u64::try_from(rounded).unwrap_or(u64::MAX))
    }

    /// Number of timers currently waiting.
    pub fn active_timers(&self) -> usize {
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl WakeScheduler for TokioWakeScheduler {
    fn arm(
        &self,
        key: AlarmKey,
        at: DateTime<Utc>,
        precision: WakePrecision,
        deliverable: Deliverable,
    ) -> Result<(), SchedulingError> {
        if precision == WakePrecision::Exact && !self.exact_permitted {
            return Err(SchedulingError::ExactDenied(
                "exact wakes disabled by scheduling.exact_wake_permitted".into(),
            ));
        }

        let delay = self.delay_until(at, precision);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let child = token.clone();
        let timers = Arc::clone(&self.timers);

        if let Some(previous) = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Timer { id, token })
        {
            previous.token.cancel();
        }

        self.runtime.spawn(async move {
            tokio::select! {
                () = child.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    {
                        let mut timers = timers.lock().unwrap_or_else(|e| e.into_inner());
                        if timers.get(&key).is_some_and(|t| t.id == id) {
                            timers.remove(&key);
                        }
                    }
                    deliverable();
                }
            }
        });
        Ok(())
    }

    fn disarm(&self, key: AlarmKey) {
        if let Some(timer) = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
        {
            timer.token.cancel();
        }
    }
}

// ============================================================================
// Manual backend
// ============================================================================

struct ManualEntry {
    at: DateTime<Utc>,
    precision: WakePrecision,
    deliverable: Deliverable,
}

/// A backend that only fires when told to.
#[derive(Default)]
pub struct ManualWakeScheduler {
    deny_exact: AtomicBool,
    pending: Mutex<BTreeMap<AlarmKey, ManualEntry>>,
}

impl ManualWakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse exact wakes from now on, as a platform without the permission would.
    pub fn deny_exact(&self, deny: bool) {
        self.deny_exact.store(deny, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn precision_of(&self, key: AlarmKey) -> Option<WakePrecision> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .map(|e| e.precision)
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.at)
            .min()
    }

    /// Run every wake due at `now`, earliest first. Returns how many ran.
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let mut due: Vec<ManualEntry> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<AlarmKey> = pending
                .iter()
                .filter(|(_, e)| e.at <= now)
                .map(|(k, _)| *k)
                .collect();
            keys.iter().filter_map(|k| pending.remove(k)).collect()
        };
        due.sort_by_key(|e| e.at);
        let fired = due.len();
        for entry in due {
            (entry.deliverable)();
        }
        fired
    }
}

impl WakeScheduler for ManualWakeScheduler {
    fn arm(
        &self,
        key: AlarmKey,
        at: DateTime<Utc>,
        precision: WakePrecision,
        deliverable: Deliverable,
    ) -> Result<(), SchedulingError> {
        if precision == WakePrecision::Exact && self.deny_exact.load(Ordering::SeqCst) {
            return Err(SchedulingError::ExactDenied("exact wakes denied".into()));
        }
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            key,
            ManualEntry {
                at,
                precision,
                deliverable,
            },
        );
        Ok(())
    }

    fn disarm(&self, key: AlarmKey) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }
}
