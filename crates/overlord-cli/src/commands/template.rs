//! Alarm template editing.
//!
//! Every edit prints the templates it changed, the edited one first, so gap
//! recalculation is visible.

use clap::{Args, Subcommand};
use overlord_core::profile::{
    AlarmTemplate, DismissalPolicy, OffsetRule, SoundDescriptor, SoundSource, TemplateDraft,
};
use tokio::runtime::Handle;

use super::profile::describe_template;
use super::{open_service, print_json, CliResult};

#[derive(Args)]
pub struct DraftArgs {
    /// Alarm label
    #[arg(long)]
    label: String,
    /// Minutes relative to departure (negative = before)
    #[arg(long, allow_hyphen_values = true, conflicts_with_all = ["before", "after"])]
    offset: Option<i32>,
    /// Ring GAP minutes before the alarm with this sort order
    #[arg(long, requires = "gap", conflicts_with = "after")]
    before: Option<i32>,
    /// Ring GAP minutes after the alarm with this sort order
    #[arg(long, requires = "gap")]
    after: Option<i32>,
    /// Gap in minutes for --before/--after
    #[arg(long)]
    gap: Option<u32>,
    /// Stop automatically instead of waiting for a dismissal
    #[arg(long)]
    auto_stop: bool,
    /// Auto-stop after this many minutes (default 30 seconds)
    #[arg(long, requires = "auto_stop")]
    auto_stop_minutes: Option<u32>,
    /// Disable vibration
    #[arg(long)]
    no_vibration: bool,
    /// Sound display name
    #[arg(long)]
    sound: Option<String>,
    /// Sound URI
    #[arg(long)]
    sound_uri: Option<String>,
    /// Treat the sound URI as a Spotify track
    #[arg(long)]
    spotify: bool,
}

impl DraftArgs {
    fn into_draft(self) -> Result<TemplateDraft, String> {
        let rule = match (self.offset, self.before, self.after, self.gap) {
            (Some(minutes), None, None, _) => OffsetRule::Fixed { minutes },
            (None, Some(reference), None, Some(gap)) => OffsetRule::RelativeTo {
                reference_sort_order: reference,
                gap_minutes: gap,
                before: true,
            },
            (None, None, Some(reference), Some(gap)) => OffsetRule::RelativeTo {
                reference_sort_order: reference,
                gap_minutes: gap,
                before: false,
            },
            _ => return Err("give either --offset or --before/--after with --gap".into()),
        };
        Ok(TemplateDraft {
            label: self.label,
            rule,
            sound: SoundDescriptor {
                source: if self.spotify {
                    SoundSource::Spotify
                } else {
                    SoundSource::Local
                },
                uri: self.sound_uri,
                name: self.sound,
            },
            dismissal: DismissalPolicy {
                requires_user_dismiss: !self.auto_stop,
                auto_stop_after_minutes: self.auto_stop_minutes,
            },
            vibration_enabled: !self.no_vibration,
        })
    }
}

#[derive(Subcommand)]
pub enum TemplateAction {
    /// Add an alarm to a profile
    Add {
        /// Profile ID
        profile_id: i64,
        #[command(flatten)]
        draft: DraftArgs,
        #[arg(long)]
        json: bool,
    },
    /// Replace the alarm at a sort order
    Edit {
        /// Profile ID
        profile_id: i64,
        /// Sort order of the alarm to edit
        sort_order: i32,
        #[command(flatten)]
        draft: DraftArgs,
        #[arg(long)]
        json: bool,
    },
    /// Delete an alarm; alarms relative to it keep their current offsets
    Delete {
        /// Template ID
        template_id: i64,
        #[arg(long)]
        json: bool,
    },
}

pub fn run(runtime: &Handle, action: TemplateAction) -> CliResult {
    let service = open_service(runtime)?;

    let (changed, json) = match action {
        TemplateAction::Add {
            profile_id,
            draft,
            json,
        } => (
            service.upsert_template(profile_id, None, &draft.into_draft()?)?,
            json,
        ),
        TemplateAction::Edit {
            profile_id,
            sort_order,
            draft,
            json,
        } => (
            service.upsert_template(profile_id, Some(sort_order), &draft.into_draft()?)?,
            json,
        ),
        TemplateAction::Delete { template_id, json } => {
            let changed = service.delete_template(template_id)?;
            if !json {
                println!("Template deleted: {template_id}");
            }
            (changed, json)
        }
    };

    if json {
        return print_json(&changed);
    }
    print_changed(&changed);
    Ok(())
}

fn print_changed(changed: &[AlarmTemplate]) {
    if changed.is_empty() {
        println!("No other alarms changed.");
        return;
    }
    for template in changed {
        println!("  {}", describe_template(template));
    }
}
