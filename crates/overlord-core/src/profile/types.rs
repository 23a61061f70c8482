//! Profile and template types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fallback auto-stop applied when nobody has to dismiss an alarm and no
/// duration was configured.
pub const DEFAULT_AUTO_STOP_SECS: u32 = 30;

/// A named, reusable ordered set of alarm templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmProfile {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_system_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A profile together with its templates in ascending sort order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileWithTemplates {
    pub profile: AlarmProfile,
    pub templates: Vec<AlarmTemplate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SoundSource {
    #[default]
    Local,
    Spotify,
}

impl SoundSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SoundSource::Local => "LOCAL",
            SoundSource::Spotify => "SPOTIFY",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SPOTIFY" => SoundSource::Spotify,
            _ => SoundSource::Local,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SoundDescriptor {
    pub source: SoundSource,
    pub uri: Option<String>,
    pub name: Option<String>,
}

/// How a fired alarm is allowed to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismissalPolicy {
    pub requires_user_dismiss: bool,
    /// `None` means "never auto-stop" when a dismissal is required.
    pub auto_stop_after_minutes: Option<u32>,
}

impl Default for DismissalPolicy {
    fn default() -> Self {
        Self {
            requires_user_dismiss: true,
            auto_stop_after_minutes: None,
        }
    }
}

impl DismissalPolicy {
    /// Auto-stop countdown in seconds, or `None` if the alarm rings until dismissed.
    ///
    /// An alarm nobody has to dismiss always gets a countdown: the configured
    /// minutes, or `fallback_secs`.
    pub fn effective_auto_stop_secs(&self, fallback_secs: u32) -> Option<u32> {
        if self.requires_user_dismiss {
            return None;
        }
        Some(
            self.auto_stop_after_minutes
                .map(|m| m.saturating_mul(60))
                .unwrap_or(fallback_secs),
        )
    }

    pub fn effective_auto_stop(&self, fallback_secs: u32) -> Option<Duration> {
        self.effective_auto_stop_secs(fallback_secs)
            .map(|s| Duration::from_secs(u64::from(s)))
    }
}

/// A template's declared dependency on another template of the same profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GapRelation {
    pub reference_sort_order: i32,
    pub gap_minutes: u32,
    pub gap_is_before: bool,
}

impl GapRelation {
    /// Offset implied by this relation for a reference sitting at `reference_offset`.
    pub fn derive(&self, reference_offset: i32) -> i32 {
        let gap = i32::try_from(self.gap_minutes).unwrap_or(i32::MAX);
        if self.gap_is_before {
            reference_offset.saturating_sub(gap)
        } else {
            reference_offset.saturating_add(gap)
        }
    }
}

/// How a template's offset is defined when it is edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OffsetRule {
    /// Minutes relative to departure, set directly by the user.
    Fixed { minutes: i32 },
    /// Derived from another template's offset.
    RelativeTo {
        reference_sort_order: i32,
        gap_minutes: u32,
        before: bool,
    },
}

impl OffsetRule {
    pub fn relation(&self) -> Option<GapRelation> {
        match *self {
            OffsetRule::Fixed { .. } => None,
            OffsetRule::RelativeTo {
                reference_sort_order,
                gap_minutes,
                before,
            } => Some(GapRelation {
                reference_sort_order,
                gap_minutes,
                gap_is_before: before,
            }),
        }
    }
}

/// One alarm definition within a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmTemplate {
    pub id: i64,
    pub profile_id: i64,
    pub label: String,
    /// Minutes relative to departure; negative is before.
    pub offset_minutes: i32,
    pub sort_order: i32,
    pub sound: SoundDescriptor,
    pub dismissal: DismissalPolicy,
    pub vibration_enabled: bool,
    pub gap: Option<GapRelation>,
}

impl AlarmTemplate {
    pub fn rule(&self) -> OffsetRule {
        match self.gap {
            Some(gap) => OffsetRule::RelativeTo {
                reference_sort_order: gap.reference_sort_order,
                gap_minutes: gap.gap_minutes,
                before: gap.gap_is_before,
            },
            None => OffsetRule::Fixed {
                minutes: self.offset_minutes,
            },
        }
    }
}

/// The editable part of a template. Offsets are given as a rule and resolved
/// against the rest of the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub label: String,
    pub rule: OffsetRule,
    #[serde(default)]
    pub sound: SoundDescriptor,
    #[serde(default)]
    pub dismissal: DismissalPolicy,
    #[serde(default = "default_true")]
    pub vibration_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl TemplateDraft {
    pub fn fixed(label: impl Into<String>, minutes: i32) -> Self {
        Self {
            label: label.into(),
            rule: OffsetRule::Fixed { minutes },
            sound: SoundDescriptor::default(),
            dismissal: DismissalPolicy::default(),
            vibration_enabled: true,
        }
    }

    pub fn relative(
        label: impl Into<String>,
        reference_sort_order: i32,
        gap_minutes: u32,
        before: bool,
    ) -> Self {
        Self {
            label: label.into(),
            rule: OffsetRule::RelativeTo {
                reference_sort_order,
                gap_minutes,
                before,
            },
            sound: SoundDescriptor::default(),
            dismissal: DismissalPolicy::default(),
            vibration_enabled: true,
        }
    }

    pub fn with_dismissal(mut self, dismissal: DismissalPolicy) -> Self {
        self.dismissal = dismissal;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_before_subtracts_and_after_adds() {
        let before = GapRelation {
            reference_sort_order: 1,
            gap_minutes: 15,
            gap_is_before: true,
        };
        let after = GapRelation {
            gap_is_before: false,
            ..before
        };
        assert_eq!(before.derive(-60), -75);
        assert_eq!(after.derive(-60), -45);
    }

    #[test]
    fn auto_stop_falls_back_when_dismissal_not_required() {
        let policy = DismissalPolicy {
            requires_user_dismiss: false,
            auto_stop_after_minutes: None,
        };
        assert_eq!(policy.effective_auto_stop_secs(30), Some(30));

        let configured = DismissalPolicy {
            requires_user_dismiss: false,
            auto_stop_after_minutes: Some(5),
        };
        assert_eq!(configured.effective_auto_stop_secs(30), Some(300));

        assert_eq!(DismissalPolicy::default().effective_auto_stop_secs(30), None);
    }

    #[test]
    fn rule_reflects_relationship() {
        let draft = TemplateDraft::relative("Pack", 2, 10, true);
        assert_eq!(
            draft.rule.relation(),
            Some(GapRelation {
                reference_sort_order: 2,
                gap_minutes: 10,
                gap_is_before: true
            })
        );
        assert_eq!(TemplateDraft::fixed("Leave", 0).rule.relation(), None);
    }
}
