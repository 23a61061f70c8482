//! Alarm commands: list, cancel, dismiss, adjust and test alarms.

use chrono::{DateTime, Duration, Utc};
use clap::Subcommand;
use overlord_core::alarm::AlarmKey;
use overlord_core::profile::DismissalPolicy;
use overlord_core::AlarmAdjustment;
use tokio::runtime::Handle;

use super::journey::print_alarms;
use super::{local, open_service, parse_instant, print_json, CliResult};

#[derive(Subcommand)]
pub enum AlarmAction {
    /// List scheduled alarms and test alarms
    List {
        /// Include alarms that already ended
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Cancel an alarm (key: scheduled:<id> or instance:<id>)
    Cancel { key: AlarmKey },
    /// Dismiss a ringing alarm
    Dismiss { key: AlarmKey },
    /// Change one scheduled alarm of a journey
    Adjust {
        /// Scheduled alarm ID
        id: i64,
        /// New absolute time
        #[arg(long, value_parser = parse_instant, conflicts_with = "shift")]
        time: Option<DateTime<Utc>>,
        /// Move by this many minutes (negative = earlier)
        #[arg(long, allow_hyphen_values = true)]
        shift: Option<i64>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
    /// Schedule a standalone test alarm
    Test {
        /// Seconds from now
        #[arg(long, default_value_t = 10)]
        in_secs: i64,
        #[arg(long)]
        label: Option<String>,
        /// Stop automatically instead of waiting for a dismissal
        #[arg(long)]
        auto_stop: bool,
    },
}

pub fn run(runtime: &Handle, action: AlarmAction) -> CliResult {
    let service = open_service(runtime)?;

    match action {
        AlarmAction::List { all, json } => {
            let (alarms, instances) = service.db().with(|db| {
                Ok((db.list_scheduled_alarms()?, db.list_instances(!all)?))
            })?;
            let alarms: Vec<_> = alarms
                .into_iter()
                .filter(|a| all || !a.is_terminal())
                .collect();
            if json {
                return print_json(&serde_json::json!({
                    "scheduled": alarms,
                    "instances": instances,
                }));
            }
            if alarms.is_empty() && instances.is_empty() {
                println!("No alarms.");
                return Ok(());
            }
            print_alarms(&alarms);
            for instance in instances {
                let state = instance
                    .resolution
                    .map(|o| o.as_str())
                    .unwrap_or(if instance.is_active { "pending" } else { "inactive" });
                println!(
                    "  {:<14} {}  {:<12} {}",
                    instance.key().to_string(),
                    local(instance.scheduled_time),
                    state,
                    instance.label
                );
            }
        }
        AlarmAction::Cancel { key } => {
            if service.cancel_alarm(key)? {
                println!("Alarm cancelled: {key}");
            } else {
                println!("Alarm already ended: {key}");
            }
        }
        AlarmAction::Dismiss { key } => {
            if service.dismiss_alarm(key)? {
                println!("Alarm dismissed: {key}");
            } else {
                println!("Alarm already ended: {key}");
            }
        }
        AlarmAction::Adjust {
            id,
            time,
            shift,
            label,
            enable,
            disable,
        } => {
            let adjustment = AlarmAdjustment {
                time,
                shift_minutes: shift,
                label,
                enabled: match (enable, disable) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                ..AlarmAdjustment::default()
            };
            let alarm = service.adjust_alarm(id, &adjustment)?;
            println!(
                "Alarm adjusted: {} at {}{}",
                alarm.label,
                local(alarm.scheduled_time),
                if alarm.is_enabled { "" } else { " (disabled)" }
            );
        }
        AlarmAction::Test {
            in_secs,
            label,
            auto_stop,
        } => {
            let dismissal = DismissalPolicy {
                requires_user_dismiss: !auto_stop,
                auto_stop_after_minutes: None,
            };
            let instance = service.schedule_test_alarm(
                Duration::seconds(in_secs.max(0)),
                label.as_deref(),
                dismissal,
            )?;
            println!(
                "Test alarm scheduled: {} at {}",
                instance.key(),
                local(instance.scheduled_time)
            );
        }
    }
    Ok(())
}
