//! Built-in profiles seeded on first start.

/// A built-in profile: name, description and `(label, offset_minutes)` pairs in
/// sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinProfile {
    pub name: &'static str,
    pub description: &'static str,
    pub alarms: &'static [(&'static str, i32)],
}

/// Returns all built-in profiles.
pub fn builtin_profiles() -> [BuiltinProfile; 3] {
    [standard_morning(), full_morning_routine(), quick_trip()]
}

/// Find a built-in profile by name.
pub fn find_builtin(name: &str) -> Option<BuiltinProfile> {
    builtin_profiles().into_iter().find(|p| p.name == name)
}

// ============================================================================
// BUILT-IN PROFILES
// ============================================================================

/// Wake up, get up, leave.
fn standard_morning() -> BuiltinProfile {
    BuiltinProfile {
        name: "Standard Morning",
        description: "Basic wake up and leave routine",
        alarms: &[("Wake Up", -90), ("Get Out of Bed", -75), ("Leave Home", -10)],
    }
}

fn full_morning_routine() -> BuiltinProfile {
    BuiltinProfile {
        name: "Full Morning Routine",
        description: "For mornings with shower and prep time",
        alarms: &[
            ("Wake Up", -120),
            ("Get Out of Bed", -105),
            ("Start Shower", -90),
            ("Getting Ready", -60),
            ("Pack Reminder", -30),
            ("10-Min Warning", -10),
            ("Leave Now!", 0),
        ],
    }
}

/// Already ready, just needs a nudge.
fn quick_trip() -> BuiltinProfile {
    BuiltinProfile {
        name: "Quick Trip",
        description: "When you're already ready, just need a reminder",
        alarms: &[("30-Min Warning", -30), ("Leave Now", 0)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_are_unique() {
        let profiles = builtin_profiles();
        for (i, a) in profiles.iter().enumerate() {
            for b in &profiles[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn builtin_alarms_are_chronological() {
        for profile in builtin_profiles() {
            assert!(!profile.alarms.is_empty(), "{} has no alarms", profile.name);
            assert!(profile.alarms.windows(2).all(|w| w[0].1 <= w[1].1));
        }
    }

    #[test]
    fn find_builtin_by_name() {
        let quick = find_builtin("Quick Trip").unwrap();
        assert_eq!(quick.alarms, &[("30-Min Warning", -30), ("Leave Now", 0)]);
        assert!(find_builtin("Nope").is_none());
    }
}
