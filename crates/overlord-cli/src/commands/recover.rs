//! Manual recovery trigger, for boot scripts and clock-change hooks.

use clap::Args;
use overlord_core::RecoveryTrigger;
use tokio::runtime::Handle;

use super::{open_service, print_json, CliResult};

#[derive(Args)]
pub struct RecoverArgs {
    /// What happened: boot, clock-changed, timezone-changed or resync
    #[arg(long, default_value = "boot")]
    trigger: RecoveryTrigger,
    #[arg(long)]
    json: bool,
}

pub fn run(runtime: &Handle, args: RecoverArgs) -> CliResult {
    let service = open_service(runtime)?;
    let report = service.recover(args.trigger)?;
    if args.json {
        return print_json(&report);
    }
    println!("Recovery ({}):", report.trigger);
    println!("  Due alarms:  {}", report.examined);
    println!("  Armed:       {}", report.armed);
    if report.overdue > 0 {
        println!("  Overdue:     {}", report.overdue);
    }
    if report.resumed + report.expired > 0 {
        println!(
            "  Interrupted: {} ringing again, {} expired",
            report.resumed, report.expired
        );
    }
    println!("  Failed:      {}", report.failed);
    println!(
        "  Journeys:    {} started, {} completed, {} purged",
        report.sweep.started, report.sweep.completed, report.sweep.purged
    );
    println!("  Instances:   {} purged", report.sweep.purged_instances);
    Ok(())
}
