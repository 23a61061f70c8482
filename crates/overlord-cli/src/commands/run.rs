//! Foreground alarm daemon.
//!
//! Re-arms everything at start, re-reads the store every
//! `scheduling.resync_interval_secs` so edits made by other `overlord`
//! invocations are picked up, prints every event as one JSON line on stdout and
//! accepts `dismiss <key>` / `cancel <key>` commands on stdin.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use overlord_core::alarm::LogAlertSink;
use overlord_core::{AlarmDb, AlarmKey, AlarmService, Config, RecoveryTrigger, SharedDb, SystemClock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;

use super::CliResult;

/// Wall-clock drift against the monotonic clock that counts as a clock change.
const CLOCK_JUMP_TOLERANCE: Duration = Duration::from_secs(5);

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl-C, stopping"),
        () = terminate => tracing::info!("received SIGTERM, stopping"),
    }
}

/// Tracks wall-clock time against monotonic time between resyncs.
struct ClockWatch {
    wall: chrono::DateTime<Utc>,
    mono: Instant,
}

impl ClockWatch {
    fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    /// Whether the wall clock moved differently from real elapsed time since the
    /// last check.
    fn jumped(&mut self) -> bool {
        let wall = Utc::now();
        let mono = Instant::now();
        let wall_elapsed = (wall - self.wall).num_milliseconds();
        let mono_elapsed = i64::try_from(mono.duration_since(self.mono).as_millis()).unwrap_or(i64::MAX);
        self.wall = wall;
        self.mono = mono;
        let tolerance = i64::try_from(CLOCK_JUMP_TOLERANCE.as_millis()).unwrap_or(i64::MAX);
        (wall_elapsed - mono_elapsed).abs() > tolerance
    }
}

fn handle_command(service: &AlarmService, line: &str) {
    let mut parts = line.split_whitespace();
    let (Some(verb), Some(key)) = (parts.next(), parts.next()) else {
        if !line.trim().is_empty() {
            eprintln!("usage: dismiss <key> | cancel <key>");
        }
        return;
    };
    let key: AlarmKey = match key.parse() {
        Ok(key) => key,
        Err(e) => {
            eprintln!("error: {e}");
            return;
        }
    };
    let result = match verb {
        "dismiss" => service.dismiss_alarm(key),
        "cancel" => service.cancel_alarm(key),
        other => {
            eprintln!("unknown command '{other}'");
            return;
        }
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
    }
}

pub async fn run() -> CliResult {
    let config = Config::load()?;
    let service = AlarmService::with_tokio_backend(
        SharedDb::new(AlarmDb::open()?),
        Arc::new(LogAlertSink),
        Arc::new(SystemClock),
        Handle::current(),
        &config,
    );
    service.catalog().seed_defaults()?;
    let mut events = service.subscribe();

    let report = service.recover(RecoveryTrigger::Boot)?;
    tracing::info!(armed = report.armed, failed = report.failed, "daemon started");

    let mut resync = tokio::time::interval(Duration::from_secs(
        config.scheduling.resync_interval_secs.max(1),
    ));
    // The first tick completes immediately; boot recovery already covered it.
    resync.tick().await;
    let mut clock = ClockWatch::new();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = resync.tick() => {
                let trigger = if clock.jumped() {
                    RecoveryTrigger::ClockChanged
                } else {
                    RecoveryTrigger::Resync
                };
                if let Err(e) = service.recover(trigger) {
                    tracing::error!(error = %e, trigger = trigger.as_str(), "recovery failed");
                }
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event output fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_command(&service, &line),
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    Ok(())
}
