//! Journey and materialized alarm types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alarm::{AlarmKey, AlarmPayload, Outcome};
use crate::error::ValidationError;
use crate::profile::{DismissalPolicy, SoundDescriptor};

/// A named location with optional address and coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Place {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl Place {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// The route the user picked, as handed over by the route planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSelection {
    pub origin: Place,
    pub destination: Place,
    pub route_id: String,
    #[serde(default)]
    pub route_summary: String,
    #[serde(default)]
    pub transport_modes: Vec<String>,
    pub departure_time: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    pub duration_minutes: u32,
}

impl RouteSelection {
    /// # Errors
    /// Returns an error if names are empty or arrival precedes departure.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.origin.name.trim().is_empty() {
            return Err(ValidationError::Empty("origin"));
        }
        if self.destination.name.trim().is_empty() {
            return Err(ValidationError::Empty("destination"));
        }
        if self.arrival_time < self.departure_time {
            return Err(ValidationError::InvalidTimeRange {
                departure: self.departure_time,
                arrival: self.arrival_time,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JourneyStatus {
    #[default]
    Upcoming,
    InProgress,
    Completed,
    Cancelled,
}

impl JourneyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JourneyStatus::Upcoming => "UPCOMING",
            JourneyStatus::InProgress => "IN_PROGRESS",
            JourneyStatus::Completed => "COMPLETED",
            JourneyStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "IN_PROGRESS" => JourneyStatus::InProgress,
            "COMPLETED" => JourneyStatus::Completed,
            "CANCELLED" => JourneyStatus::Cancelled,
            _ => JourneyStatus::Upcoming,
        }
    }

    /// Whether alarms of a journey in this status may still ring.
    pub fn is_live(self) -> bool {
        matches!(self, JourneyStatus::Upcoming | JourneyStatus::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJourney {
    pub id: i64,
    pub origin: Place,
    pub destination: Place,
    pub route_id: String,
    pub route_summary: String,
    pub transport_modes: Vec<String>,
    pub departure_time: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    pub duration_minutes: u32,
    pub status: JourneyStatus,
    pub profile_id: Option<i64>,
    /// Snapshot of the profile name at scheduling time.
    pub profile_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One concrete alarm of a journey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAlarm {
    pub id: i64,
    pub journey_id: i64,
    pub template_id: Option<i64>,
    pub label: String,
    pub scheduled_time: DateTime<Utc>,
    /// Offset the alarm was materialized with. Never changes afterwards.
    pub original_offset_minutes: i32,
    pub sort_order: i32,
    pub sound: SoundDescriptor,
    pub dismissal: DismissalPolicy,
    pub vibration_enabled: bool,
    pub auto_stop_after_secs: Option<u32>,
    pub is_enabled: bool,
    pub is_fired: bool,
    pub fired_at: Option<DateTime<Utc>>,
    pub dismissed_at: Option<DateTime<Utc>>,
    /// Persisted but never acted on.
    pub snoozed_until: Option<DateTime<Utc>>,
    pub resolution: Option<Outcome>,
}

impl ScheduledAlarm {
    pub fn key(&self) -> AlarmKey {
        AlarmKey::Scheduled(self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.resolution.is_some()
    }

    /// Enabled, not yet fired and not resolved.
    pub fn is_armable(&self) -> bool {
        self.is_enabled && !self.is_fired && !self.is_terminal()
    }

    pub fn payload(&self) -> AlarmPayload {
        AlarmPayload {
            key: self.key(),
            label: self.label.clone(),
            scheduled_time: self.scheduled_time,
            sound: self.sound.clone(),
            vibration_enabled: self.vibration_enabled,
            requires_user_dismiss: self.dismissal.requires_user_dismiss,
            auto_stop_after_secs: self.auto_stop_after_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyWithAlarms {
    pub journey: ScheduledJourney,
    pub alarms: Vec<ScheduledAlarm>,
}

/// Result of scheduling a journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyReceipt {
    pub journey: ScheduledJourney,
    pub alarms: Vec<ScheduledAlarm>,
    /// Alarms handed to the wake backend.
    pub armed: usize,
    /// Alarms that were enabled but could not be armed.
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn route(departure: DateTime<Utc>, arrival: DateTime<Utc>) -> RouteSelection {
        RouteSelection {
            origin: Place::named("Home"),
            destination: Place::named("Office"),
            route_id: "r1".into(),
            route_summary: String::new(),
            transport_modes: vec!["TRAIN".into()],
            departure_time: departure,
            arrival_time: arrival,
            duration_minutes: 30,
        }
    }

    #[test]
    fn route_rejects_arrival_before_departure() {
        let now = Utc::now();
        assert!(route(now, now + Duration::minutes(30)).validate().is_ok());
        assert!(matches!(
            route(now, now - Duration::minutes(1)).validate(),
            Err(ValidationError::InvalidTimeRange { .. })
        ));
    }

    #[test]
    fn route_rejects_blank_places() {
        let now = Utc::now();
        let mut r = route(now, now);
        r.origin.name = "  ".into();
        assert!(matches!(r.validate(), Err(ValidationError::Empty("origin"))));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            JourneyStatus::Upcoming,
            JourneyStatus::InProgress,
            JourneyStatus::Completed,
            JourneyStatus::Cancelled,
        ] {
            assert_eq!(JourneyStatus::parse(status.as_str()), status);
        }
        assert!(JourneyStatus::InProgress.is_live());
        assert!(!JourneyStatus::Cancelled.is_live());
    }
}
