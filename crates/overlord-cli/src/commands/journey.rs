//! Journey commands.

use chrono::{DateTime, Utc};
use clap::Subcommand;
use overlord_core::journey::{JourneyStatus, Place, RouteSelection, ScheduledAlarm};
use overlord_core::CoreError;
use tokio::runtime::Handle;

use super::{local, open_service, parse_instant, print_json, CliResult};

#[derive(Subcommand)]
pub enum JourneyAction {
    /// Schedule a journey and materialize its alarms from a profile
    Schedule {
        /// Profile ID
        #[arg(long)]
        profile: i64,
        /// Origin name
        #[arg(long)]
        from: String,
        /// Destination name
        #[arg(long)]
        to: String,
        /// Departure time (RFC 3339 or YYYY-MM-DDTHH:MM local)
        #[arg(long, value_parser = parse_instant)]
        departure: DateTime<Utc>,
        /// Arrival time (RFC 3339 or YYYY-MM-DDTHH:MM local)
        #[arg(long, value_parser = parse_instant)]
        arrival: DateTime<Utc>,
        /// Route identifier from the route planner
        #[arg(long, default_value = "manual")]
        route_id: String,
        /// Human-readable route summary
        #[arg(long, default_value = "")]
        summary: String,
        /// Transport mode (repeatable)
        #[arg(long = "mode")]
        modes: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// List journeys
    List {
        /// Only journeys in this status (UPCOMING, IN_PROGRESS, COMPLETED, CANCELLED)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show a journey with its alarms
    Show {
        /// Journey ID
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Cancel a journey and all its alarms
    Cancel {
        /// Journey ID
        id: i64,
    },
}

pub fn run(runtime: &Handle, action: JourneyAction) -> CliResult {
    let service = open_service(runtime)?;

    match action {
        JourneyAction::Schedule {
            profile,
            from,
            to,
            departure,
            arrival,
            route_id,
            summary,
            modes,
            json,
        } => {
            let route = RouteSelection {
                origin: Place::named(from),
                destination: Place::named(to),
                route_id,
                route_summary: summary,
                transport_modes: modes,
                departure_time: departure,
                arrival_time: arrival,
                duration_minutes: u32::try_from((arrival - departure).num_minutes()).unwrap_or(0),
            };
            let receipt = service.schedule_journey(profile, &route)?;
            if json {
                return print_json(&receipt);
            }
            println!(
                "Journey scheduled: {} → {} ({})",
                receipt.journey.origin.name, receipt.journey.destination.name, receipt.journey.id
            );
            println!("Departure: {}", local(receipt.journey.departure_time));
            print_alarms(&receipt.alarms);
            println!();
            println!("Alarms ring while 'overlord run' is active.");
        }
        JourneyAction::List { status, json } => {
            let status = match status.as_deref() {
                None => None,
                Some(s) => Some(parse_status(s)?),
            };
            let journeys = service.db().with(|db| db.list_journeys(status))?;
            if json {
                return print_json(&journeys);
            }
            if journeys.is_empty() {
                println!("No journeys.");
            }
            for journey in journeys {
                println!(
                    "{:>4}  {}  {:<11}  {} → {}",
                    journey.id,
                    local(journey.departure_time),
                    journey.status.as_str(),
                    journey.origin.name,
                    journey.destination.name
                );
            }
        }
        JourneyAction::Show { id, json } => {
            let journey = service
                .db()
                .with(|db| db.load_journey(id))?
                .ok_or_else(|| CoreError::not_found("journey", id))?;
            if json {
                return print_json(&journey);
            }
            let j = &journey.journey;
            println!("{} → {} ({})", j.origin.name, j.destination.name, j.id);
            println!("Status:    {}", j.status.as_str());
            println!("Departure: {}", local(j.departure_time));
            println!("Arrival:   {}", local(j.arrival_time));
            if !j.route_summary.is_empty() {
                println!("Route:     {}", j.route_summary);
            }
            if let Some(profile) = &j.profile_name {
                println!("Profile:   {profile}");
            }
            print_alarms(&journey.alarms);
        }
        JourneyAction::Cancel { id } => {
            let journey = service.cancel_journey(id)?;
            println!(
                "Journey cancelled: {} ({} alarms)",
                journey.journey.id,
                journey.alarms.len()
            );
        }
    }
    Ok(())
}

fn parse_status(s: &str) -> Result<JourneyStatus, String> {
    let upper = s.to_ascii_uppercase().replace('-', "_");
    match upper.as_str() {
        "UPCOMING" | "IN_PROGRESS" | "COMPLETED" | "CANCELLED" => Ok(JourneyStatus::parse(&upper)),
        _ => Err(format!("unknown journey status '{s}'")),
    }
}

pub fn print_alarms(alarms: &[ScheduledAlarm]) {
    println!();
    for alarm in alarms {
        let state = match (alarm.resolution, alarm.is_fired, alarm.is_enabled) {
            (Some(outcome), _, _) => outcome.as_str(),
            (None, true, _) => "ringing",
            (None, false, false) => "disabled",
            (None, false, true) => "pending",
        };
        println!(
            "  {:<14} {}  {:<12} {}",
            alarm.key().to_string(),
            local(alarm.scheduled_time),
            state,
            alarm.label
        );
    }
}
