//! Alarm identities, ad-hoc instances and the payload handed to delivery.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::profile::{DismissalPolicy, SoundDescriptor};

/// Identity of anything that can be armed.
///
/// Rendered as `scheduled:<id>` or `instance:<id>`; the same string is used for
/// wake registrations, events and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AlarmKey {
    Scheduled(i64),
    Instance(i64),
}

impl fmt::Display for AlarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmKey::Scheduled(id) => write!(f, "scheduled:{id}"),
            AlarmKey::Instance(id) => write!(f, "instance:{id}"),
        }
    }
}

impl FromStr for AlarmKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidValue {
            field: "alarm key".into(),
            message: format!("expected scheduled:<id> or instance:<id>, got '{s}'"),
        };
        let (kind, id) = s.split_once(':').ok_or_else(invalid)?;
        let id: i64 = id.trim().parse().map_err(|_| invalid())?;
        match kind.trim() {
            "scheduled" => Ok(AlarmKey::Scheduled(id)),
            "instance" => Ok(AlarmKey::Instance(id)),
            _ => Err(invalid()),
        }
    }
}

impl From<AlarmKey> for String {
    fn from(key: AlarmKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for AlarmKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// How a fired (or never-fired) alarm ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Dismissed,
    AutoStopped,
    Cancelled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Dismissed => "dismissed",
            Outcome::AutoStopped => "auto_stopped",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dismissed" => Some(Outcome::Dismissed),
            "auto_stopped" => Some(Outcome::AutoStopped),
            "cancelled" => Some(Outcome::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmType {
    WakeUp,
    GetOutOfBed,
    LeaveHome,
    Test,
}

impl AlarmType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmType::WakeUp => "WAKE_UP",
            AlarmType::GetOutOfBed => "GET_OUT_OF_BED",
            AlarmType::LeaveHome => "LEAVE_HOME",
            AlarmType::Test => "TEST",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "WAKE_UP" => AlarmType::WakeUp,
            "GET_OUT_OF_BED" => AlarmType::GetOutOfBed,
            "LEAVE_HOME" => AlarmType::LeaveHome,
            _ => AlarmType::Test,
        }
    }
}

/// A standalone alarm not produced from a profile (quick test alarms).
///
/// `acknowledged_at` and `cancelled_at` are mutually exclusive; once either is set
/// the instance is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmInstance {
    pub id: i64,
    pub journey_id: Option<i64>,
    pub scheduled_time: DateTime<Utc>,
    pub alarm_type: AlarmType,
    pub profile_id: Option<i64>,
    pub label: String,
    pub dismissal: DismissalPolicy,
    pub is_active: bool,
    /// Set when delivery started ringing it.
    pub fired_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub resolution: Option<Outcome>,
}

impl AlarmInstance {
    pub fn key(&self) -> AlarmKey {
        AlarmKey::Instance(self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.acknowledged_at.is_some() || self.cancelled_at.is_some() || self.resolution.is_some()
    }

    pub fn payload(&self, fallback_auto_stop_secs: u32) -> AlarmPayload {
        AlarmPayload {
            key: self.key(),
            label: self.label.clone(),
            scheduled_time: self.scheduled_time,
            sound: SoundDescriptor::default(),
            vibration_enabled: true,
            requires_user_dismiss: self.dismissal.requires_user_dismiss,
            auto_stop_after_secs: self.dismissal.effective_auto_stop_secs(fallback_auto_stop_secs),
        }
    }
}

/// Fields for a new [`AlarmInstance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstance {
    pub journey_id: Option<i64>,
    pub scheduled_time: DateTime<Utc>,
    pub alarm_type: AlarmType,
    pub profile_id: Option<i64>,
    pub label: String,
    pub dismissal: DismissalPolicy,
}

/// Everything delivery needs to ring an alarm without going back to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmPayload {
    pub key: AlarmKey,
    pub label: String,
    pub scheduled_time: DateTime<Utc>,
    pub sound: SoundDescriptor,
    pub vibration_enabled: bool,
    pub requires_user_dismiss: bool,
    /// `None` rings until dismissed.
    pub auto_stop_after_secs: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_and_parse_agree() {
        for key in [AlarmKey::Scheduled(42), AlarmKey::Instance(7)] {
            assert_eq!(key.to_string().parse::<AlarmKey>().unwrap(), key);
        }
        assert!("alarm:1".parse::<AlarmKey>().is_err());
        assert!("scheduled:x".parse::<AlarmKey>().is_err());
        assert!("42".parse::<AlarmKey>().is_err());
    }

    #[test]
    fn key_serializes_as_string() {
        let json = serde_json::to_string(&AlarmKey::Scheduled(3)).unwrap();
        assert_eq!(json, "\"scheduled:3\"");
        let back: AlarmKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AlarmKey::Scheduled(3));
    }

    #[test]
    fn instance_payload_applies_auto_stop_fallback() {
        let instance = AlarmInstance {
            id: 5,
            journey_id: None,
            scheduled_time: Utc::now(),
            alarm_type: AlarmType::Test,
            profile_id: None,
            label: "Test".into(),
            dismissal: DismissalPolicy {
                requires_user_dismiss: false,
                auto_stop_after_minutes: None,
            },
            is_active: true,
            fired_at: None,
            acknowledged_at: None,
            cancelled_at: None,
            resolution: None,
        };
        let payload = instance.payload(30);
        assert_eq!(payload.key, AlarmKey::Instance(5));
        assert_eq!(payload.auto_stop_after_secs, Some(30));
        assert!(!instance.is_terminal());
    }
}
