use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::alarm::{AlarmKey, Outcome, RecoveryTrigger, WakePrecision};

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Every state change of an alarm or journey produces an Event.
/// The daemon prints them; embedders subscribe to drive their UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    JourneyScheduled {
        journey_id: i64,
        alarms: usize,
        armed: usize,
        at: DateTime<Utc>,
    },
    JourneyCancelled {
        journey_id: i64,
        at: DateTime<Utc>,
    },
    AlarmArmed {
        key: AlarmKey,
        scheduled_time: DateTime<Utc>,
        precision: WakePrecision,
        at: DateTime<Utc>,
    },
    AlarmDisarmed {
        key: AlarmKey,
        at: DateTime<Utc>,
    },
    /// Alert started: sound, vibration and render are on.
    AlarmFired {
        key: AlarmKey,
        label: String,
        scheduled_time: DateTime<Utc>,
        auto_stop_after_secs: Option<u32>,
        at: DateTime<Utc>,
    },
    AlarmResolved {
        key: AlarmKey,
        outcome: Outcome,
        at: DateTime<Utc>,
    },
    RecoveryCompleted {
        trigger: RecoveryTrigger,
        examined: usize,
        armed: usize,
        failed: usize,
        at: DateTime<Utc>,
    },
}

/// Broadcast fan-out for [`Event`]s.
///
/// Non-blocking: `emit` never waits. Slow receivers lag rather than blocking the
/// sender.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns the number of receivers that got the event.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = Event::AlarmResolved {
            key: AlarmKey::Scheduled(4),
            outcome: Outcome::AutoStopped,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "AlarmResolved");
        assert_eq!(json["key"], "scheduled:4");
        assert_eq!(json["outcome"], "auto_stopped");
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        assert_eq!(
            bus.emit(Event::JourneyCancelled {
                journey_id: 1,
                at: Utc::now()
            }),
            0
        );
        let mut rx = bus.subscribe();
        bus.emit(Event::JourneyCancelled {
            journey_id: 2,
            at: Utc::now(),
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::JourneyCancelled { journey_id: 2, .. }
        ));
    }
}
