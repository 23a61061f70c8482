pub mod alarm;
pub mod config;
pub mod journey;
pub mod profile;
pub mod recover;
pub mod run;
pub mod template;

use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use overlord_core::alarm::{LogAlertSink, ManualWakeScheduler};
use overlord_core::{AlarmDb, AlarmService, Config, SharedDb, SystemClock};
use tokio::runtime::Handle;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Service for one-shot commands.
///
/// Wakes armed here only live as long as the process, so one-shot commands
/// record state and leave ringing to `overlord run`.
pub fn open_service(runtime: &Handle) -> Result<AlarmService, Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let service = AlarmService::new(
        SharedDb::new(AlarmDb::open()?),
        Arc::new(ManualWakeScheduler::new()),
        Arc::new(LogAlertSink),
        Arc::new(SystemClock),
        runtime.clone(),
        &config,
    );
    service.catalog().seed_defaults()?;
    Ok(service)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Local wall-clock rendering for human output.
pub fn local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

/// Parse an RFC 3339 instant, or a naive `YYYY-MM-DDTHH:MM` in local time.
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Ok(at.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, format) {
            if let Some(at) = naive.and_local_timezone(Local).earliest() {
                return Ok(at.with_timezone(&Utc));
            }
        }
    }
    Err(format!("invalid time '{s}' (expected RFC 3339 or YYYY-MM-DDTHH:MM)"))
}
