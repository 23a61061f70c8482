//! Turns a profile and a departure time into concrete alarms.

use chrono::{DateTime, Duration, Utc};

use super::types::ScheduledAlarm;
use crate::profile::ProfileWithTemplates;

/// Materialize every template of `profile` against `departure`.
///
/// Output follows ascending sort order. The result depends only on the inputs, so
/// the same profile and departure always yield the same times. Ids are left at 0
/// for the store to assign.
pub fn materialize(
    profile: &ProfileWithTemplates,
    departure: DateTime<Utc>,
    fallback_auto_stop_secs: u32,
) -> Vec<ScheduledAlarm> {
    let mut templates: Vec<_> = profile.templates.iter().collect();
    templates.sort_by_key(|t| (t.sort_order, t.id));

    templates
        .into_iter()
        .map(|template| ScheduledAlarm {
            id: 0,
            journey_id: 0,
            template_id: Some(template.id),
            label: template.label.clone(),
            scheduled_time: departure + Duration::minutes(i64::from(template.offset_minutes)),
            original_offset_minutes: template.offset_minutes,
            sort_order: template.sort_order,
            sound: template.sound.clone(),
            dismissal: template.dismissal,
            vibration_enabled: template.vibration_enabled,
            auto_stop_after_secs: template
                .dismissal
                .effective_auto_stop_secs(fallback_auto_stop_secs),
            is_enabled: true,
            is_fired: false,
            fired_at: None,
            dismissed_at: None,
            snoozed_until: None,
            resolution: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{
        AlarmProfile, AlarmTemplate, DismissalPolicy, SoundDescriptor, DEFAULT_AUTO_STOP_SECS,
    };
    use chrono::TimeZone;

    fn template(id: i64, label: &str, offset: i32, sort_order: i32) -> AlarmTemplate {
        AlarmTemplate {
            id,
            profile_id: 1,
            label: label.into(),
            offset_minutes: offset,
            sort_order,
            sound: SoundDescriptor::default(),
            dismissal: DismissalPolicy::default(),
            vibration_enabled: true,
            gap: None,
        }
    }

    fn quick_trip() -> ProfileWithTemplates {
        let now = Utc::now();
        ProfileWithTemplates {
            profile: AlarmProfile {
                id: 1,
                name: "Quick Trip".into(),
                description: None,
                is_system_default: true,
                created_at: now,
                updated_at: now,
            },
            // Deliberately out of order.
            templates: vec![
                template(11, "Leave Now", 0, 2),
                template(10, "30-Min Warning", -30, 1),
            ],
        }
    }

    #[test]
    fn quick_trip_at_nine() {
        let departure = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let alarms = materialize(&quick_trip(), departure, DEFAULT_AUTO_STOP_SECS);

        let summary: Vec<(&str, DateTime<Utc>, i32)> = alarms
            .iter()
            .map(|a| (a.label.as_str(), a.scheduled_time, a.original_offset_minutes))
            .collect();
        assert_eq!(
            summary,
            vec![
                (
                    "30-Min Warning",
                    Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).unwrap(),
                    -30
                ),
                ("Leave Now", departure, 0),
            ]
        );
        assert_eq!(alarms[0].template_id, Some(10));
        assert!(alarms.iter().all(|a| a.is_enabled && !a.is_fired));
    }

    #[test]
    fn materialization_is_deterministic() {
        let departure = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let profile = quick_trip();
        assert_eq!(
            materialize(&profile, departure, 30),
            materialize(&profile, departure, 30)
        );
    }

    #[test]
    fn auto_stop_is_decided_per_alarm() {
        let mut profile = quick_trip();
        profile.templates[0].dismissal = DismissalPolicy {
            requires_user_dismiss: false,
            auto_stop_after_minutes: None,
        };
        profile.templates[1].dismissal = DismissalPolicy {
            requires_user_dismiss: false,
            auto_stop_after_minutes: Some(2),
        };

        let alarms = materialize(&profile, Utc::now(), 30);
        assert_eq!(alarms[0].auto_stop_after_secs, Some(120));
        assert_eq!(alarms[1].auto_stop_after_secs, Some(30));

        let required = materialize(&quick_trip(), Utc::now(), 30);
        assert!(required.iter().all(|a| a.auto_stop_after_secs.is_none()));
    }
}
