//! Alarm profile commands.

use clap::Subcommand;
use overlord_core::profile::{AlarmTemplate, OffsetRule, ProfileWithTemplates};
use tokio::runtime::Handle;

use super::{open_service, print_json, CliResult};

#[derive(Subcommand)]
pub enum ProfileAction {
    /// List all profiles
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show a profile with its alarm templates
    Show {
        /// Profile ID
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Create an empty profile
    Create {
        /// Profile name (must be unique)
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Rename a profile or change its description
    Update {
        /// Profile ID
        id: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a profile and its templates
    Delete {
        /// Profile ID
        id: i64,
    },
    /// Copy a profile with all its templates
    Duplicate {
        /// Profile ID
        id: i64,
        /// Name of the copy (default: "<name> (Copy)")
        #[arg(long)]
        name: Option<String>,
    },
}

pub fn run(runtime: &Handle, action: ProfileAction) -> CliResult {
    let service = open_service(runtime)?;
    let catalog = service.catalog();

    match action {
        ProfileAction::List { json } => {
            let profiles = catalog.list_profiles()?;
            if json {
                return print_json(&profiles);
            }
            for profile in profiles {
                let marker = if profile.is_system_default { " [default]" } else { "" };
                println!("{:>4}  {}{}", profile.id, profile.name, marker);
                if let Some(description) = &profile.description {
                    println!("      {description}");
                }
            }
        }
        ProfileAction::Show { id, json } => {
            let profile = catalog.load_profile(id)?;
            if json {
                return print_json(&profile);
            }
            print_profile(&profile);
        }
        ProfileAction::Create { name, description } => {
            let profile = catalog.create_profile(&name, description.as_deref())?;
            println!("Profile created: {} ({})", profile.name, profile.id);
        }
        ProfileAction::Update {
            id,
            name,
            description,
        } => {
            let profile = catalog.update_profile(id, &name, description.as_deref())?;
            println!("Profile updated: {} ({})", profile.name, profile.id);
        }
        ProfileAction::Delete { id } => {
            catalog.delete_profile(id)?;
            println!("Profile deleted: {id}");
        }
        ProfileAction::Duplicate { id, name } => {
            let copy = catalog.duplicate_profile(id, name.as_deref())?;
            println!(
                "Profile duplicated: {} ({}), {} alarms",
                copy.profile.name,
                copy.profile.id,
                copy.templates.len()
            );
        }
    }
    Ok(())
}

pub fn print_profile(profile: &ProfileWithTemplates) {
    println!("{} ({})", profile.profile.name, profile.profile.id);
    if let Some(description) = &profile.profile.description {
        println!("{description}");
    }
    println!();
    if profile.templates.is_empty() {
        println!("  (no alarms)");
    }
    for template in &profile.templates {
        let dismissal = if template.dismissal.requires_user_dismiss {
            ""
        } else {
            "  auto-stop"
        };
        println!(
            "  {}{}  [id {}]",
            describe_template(template),
            dismissal,
            template.id
        );
    }
}

/// One line per template: sort order, offset, label and, for gap-based
/// templates, what the offset follows.
pub fn describe_template(template: &AlarmTemplate) -> String {
    let rule = match template.rule() {
        OffsetRule::Fixed { .. } => String::new(),
        OffsetRule::RelativeTo {
            reference_sort_order,
            gap_minutes,
            before,
        } => format!(
            "  ({gap_minutes} min {} #{reference_sort_order})",
            if before { "before" } else { "after" }
        ),
    };
    format!(
        "#{:<2} {:>+5} min  {}{}",
        template.sort_order, template.offset_minutes, template.label, rule
    )
}
