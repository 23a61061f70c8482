//! Profile and template management on top of the store.
//!
//! Every template edit loads the whole profile, runs the gap resolver in memory
//! and writes back exactly the rows that changed in one transaction.

use std::collections::HashMap;
use std::sync::Arc;

use super::defaults::builtin_profiles;
use super::resolver;
use super::types::{AlarmProfile, AlarmTemplate, ProfileWithTemplates, TemplateDraft};
use crate::clock::Clock;
use crate::error::{CoreError, ValidationError};
use crate::storage::{AlarmDb, SharedDb};

pub struct ProfileCatalog {
    db: SharedDb,
    clock: Arc<dyn Clock>,
}

fn validate_name(name: &str) -> Result<&str, CoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty("name").into());
    }
    Ok(trimmed)
}

fn ensure_unique(db: &AlarmDb, name: &str, exclude_id: Option<i64>) -> Result<(), CoreError> {
    if db.count_profiles_with_name(name, exclude_id)? > 0 {
        return Err(CoreError::DuplicateName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Rows of `templates` that differ from `original` (or are new).
fn changed_rows(original: &[AlarmTemplate], templates: &[AlarmTemplate]) -> Vec<AlarmTemplate> {
    let before: HashMap<i64, &AlarmTemplate> = original.iter().map(|t| (t.id, t)).collect();
    templates
        .iter()
        .filter(|t| t.id == 0 || before.get(&t.id) != Some(&t))
        .cloned()
        .collect()
}

impl ProfileCatalog {
    pub fn new(db: SharedDb, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// # Errors
    /// `Validation` for a blank name, `DuplicateName` if it is taken.
    pub fn create_profile(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<AlarmProfile, CoreError> {
        let name = validate_name(name)?;
        let now = self.clock.now();
        self.db.with(|db| {
            ensure_unique(db, name, None)?;
            let profile = db.insert_profile(name, description, false, now)?;
            tracing::info!(profile_id = profile.id, name, "created profile");
            Ok(profile)
        })
    }

    /// # Errors
    /// `NotFound`, `Validation` or `DuplicateName`.
    pub fn update_profile(
        &self,
        id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<AlarmProfile, CoreError> {
        let name = validate_name(name)?;
        let now = self.clock.now();
        self.db.with(|db| {
            ensure_unique(db, name, Some(id))?;
            if !db.update_profile(id, name, description, now)? {
                return Err(CoreError::not_found("profile", id));
            }
            db.get_profile(id)?
                .ok_or_else(|| CoreError::not_found("profile", id))
        })
    }

    /// Delete a profile and its templates. Journeys keep their snapshot.
    ///
    /// # Errors
    /// `NotFound` if the profile does not exist.
    pub fn delete_profile(&self, id: i64) -> Result<(), CoreError> {
        self.db.with(|db| {
            if !db.delete_profile(id)? {
                return Err(CoreError::not_found("profile", id));
            }
            tracing::info!(profile_id = id, "deleted profile");
            Ok(())
        })
    }

    /// Deep-copy a profile with all its templates and relationships.
    ///
    /// The copy is never a system default. Without `new_name` it is called
    /// "<name> (Copy)".
    ///
    /// # Errors
    /// `NotFound`, `Validation` or `DuplicateName`.
    pub fn duplicate_profile(
        &self,
        id: i64,
        new_name: Option<&str>,
    ) -> Result<ProfileWithTemplates, CoreError> {
        let now = self.clock.now();
        self.db.with(|db| {
            let source = db
                .load_profile(id)?
                .ok_or_else(|| CoreError::not_found("profile", id))?;
            let name = match new_name {
                Some(name) => validate_name(name)?.to_string(),
                None => format!("{} (Copy)", source.profile.name),
            };
            ensure_unique(db, &name, None)?;
            let copy = db.insert_profile_with_templates(
                &name,
                source.profile.description.as_deref(),
                false,
                &source.templates,
                now,
            )?;
            tracing::info!(source_id = id, profile_id = copy.profile.id, "duplicated profile");
            Ok(copy)
        })
    }

    /// System defaults first, then by name.
    pub fn list_profiles(&self) -> Result<Vec<AlarmProfile>, CoreError> {
        self.db.with(|db| db.list_profiles())
    }

    /// # Errors
    /// `NotFound` if the profile does not exist.
    pub fn load_profile(&self, id: i64) -> Result<ProfileWithTemplates, CoreError> {
        self.db.with(|db| {
            db.load_profile(id)?
                .ok_or_else(|| CoreError::not_found("profile", id))
        })
    }

    /// Create (`target == None`) or edit the template at sort order `target`.
    ///
    /// Returns every template the edit changed, the edited one first.
    ///
    /// # Errors
    /// `NotFound` for an unknown profile, `Validation` for a blank label, and
    /// `Graph` when the relationship is dangling or cyclic. Nothing is written on
    /// error.
    pub fn upsert_template(
        &self,
        profile_id: i64,
        target: Option<i32>,
        draft: &TemplateDraft,
    ) -> Result<Vec<AlarmTemplate>, CoreError> {
        if draft.label.trim().is_empty() {
            return Err(ValidationError::Empty("label").into());
        }
        let now = self.clock.now();
        self.db.with(|db| {
            if db.get_profile(profile_id)?.is_none() {
                return Err(CoreError::not_found("profile", profile_id));
            }
            let original = db.templates_for(profile_id)?;
            let mut templates = original.clone();
            resolver::repair(&mut templates);
            let affected = resolver::upsert(&mut templates, profile_id, target, draft)?;

            let mut changed = changed_rows(&original, &templates);
            db.commit_template_edit(profile_id, &mut changed, None, now)?;

            let edited = affected[0];
            changed.sort_by_key(|t| (t.sort_order != edited, t.sort_order));
            tracing::debug!(
                profile_id,
                sort_order = edited,
                changed = changed.len(),
                "saved template"
            );
            Ok(changed)
        })
    }

    /// Delete a template, detaching its dependents and renumbering the rest.
    ///
    /// Returns every remaining template whose row changed.
    ///
    /// # Errors
    /// `NotFound` if the template does not exist.
    pub fn delete_template(&self, template_id: i64) -> Result<Vec<AlarmTemplate>, CoreError> {
        let now = self.clock.now();
        self.db.with(|db| {
            let template = db
                .get_template(template_id)?
                .ok_or_else(|| CoreError::not_found("template", template_id))?;
            let original = db.templates_for(template.profile_id)?;
            let mut templates = original.clone();
            resolver::repair(&mut templates);
            resolver::remove(&mut templates, template.sort_order)?;

            let mut changed = changed_rows(&original, &templates);
            db.commit_template_edit(template.profile_id, &mut changed, Some(template_id), now)?;
            tracing::debug!(
                profile_id = template.profile_id,
                template_id,
                changed = changed.len(),
                "deleted template"
            );
            Ok(changed)
        })
    }

    /// Seed the built-in profiles unless a system default already exists.
    ///
    /// Returns the number of profiles created.
    pub fn seed_defaults(&self) -> Result<usize, CoreError> {
        let now = self.clock.now();
        self.db.with(|db| {
            if db.has_system_default()? {
                return Ok(0);
            }
            let mut created = 0;
            for builtin in builtin_profiles() {
                if db.count_profiles_with_name(builtin.name, None)? > 0 {
                    tracing::warn!(name = builtin.name, "skipping built-in profile, name taken");
                    continue;
                }
                let templates: Vec<AlarmTemplate> = builtin
                    .alarms
                    .iter()
                    .zip(1..)
                    .map(|(&(label, offset), sort_order)| {
                        let draft = TemplateDraft::fixed(label, offset);
                        AlarmTemplate {
                            id: 0,
                            profile_id: 0,
                            label: draft.label,
                            offset_minutes: offset,
                            sort_order,
                            sound: draft.sound,
                            dismissal: draft.dismissal,
                            vibration_enabled: draft.vibration_enabled,
                            gap: None,
                        }
                    })
                    .collect();
                db.insert_profile_with_templates(
                    builtin.name,
                    Some(builtin.description),
                    true,
                    &templates,
                    now,
                )?;
                created += 1;
            }
            tracing::info!(created, "seeded default profiles");
            Ok(created)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::GraphError;
    use crate::profile::{resolver::violations, DismissalPolicy};

    fn catalog() -> ProfileCatalog {
        let db = SharedDb::new(AlarmDb::open_memory().unwrap());
        ProfileCatalog::new(db, Arc::new(SystemClock))
    }

    fn offsets(catalog: &ProfileCatalog, profile_id: i64) -> Vec<(i32, i32)> {
        catalog
            .load_profile(profile_id)
            .unwrap()
            .templates
            .iter()
            .map(|t| (t.sort_order, t.offset_minutes))
            .collect()
    }

    #[test]
    fn names_are_trimmed_unique_and_non_empty() {
        let catalog = catalog();
        let work = catalog.create_profile("  Work  ", None).unwrap();
        assert_eq!(work.name, "Work");

        assert!(matches!(
            catalog.create_profile("Work", None),
            Err(CoreError::DuplicateName { .. })
        ));
        assert!(matches!(
            catalog.create_profile("   ", None),
            Err(CoreError::Validation(ValidationError::Empty("name")))
        ));
        // Case-sensitive exact match.
        catalog.create_profile("work", None).unwrap();

        // Renaming to its own name is fine, to another's is not.
        catalog.update_profile(work.id, "Work", Some("weekdays")).unwrap();
        assert!(matches!(
            catalog.update_profile(work.id, "work", None),
            Err(CoreError::DuplicateName { .. })
        ));
        assert!(matches!(
            catalog.update_profile(999, "Other", None),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn gap_edit_propagates_and_persists() {
        let catalog = catalog();
        let p = catalog.create_profile("Morning", None).unwrap();
        catalog
            .upsert_template(p.id, None, &TemplateDraft::fixed("A", -60))
            .unwrap();
        let created = catalog
            .upsert_template(p.id, None, &TemplateDraft::relative("B", 1, 15, true))
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].offset_minutes, -75);
        assert!(created[0].id > 0);

        let changed = catalog
            .upsert_template(p.id, Some(1), &TemplateDraft::fixed("A", -90))
            .unwrap();
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].label, "A");
        assert_eq!(changed[1].offset_minutes, -105);

        assert_eq!(offsets(&catalog, p.id), vec![(1, -90), (2, -105)]);
    }

    #[test]
    fn rejected_edit_writes_nothing() {
        let catalog = catalog();
        let p = catalog.create_profile("P", None).unwrap();
        catalog
            .upsert_template(p.id, None, &TemplateDraft::fixed("A", -60))
            .unwrap();
        catalog
            .upsert_template(p.id, None, &TemplateDraft::relative("B", 1, 10, true))
            .unwrap();

        let err = catalog
            .upsert_template(p.id, Some(1), &TemplateDraft::relative("A", 2, 5, true))
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Graph(GraphError::CycleDetected { .. })
        ));
        let err = catalog
            .upsert_template(p.id, None, &TemplateDraft::relative("C", 9, 5, true))
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Graph(GraphError::ReferenceNotFound { .. })
        ));
        assert_eq!(offsets(&catalog, p.id), vec![(1, -60), (2, -70)]);
    }

    #[test]
    fn deleting_template_detaches_and_renumbers() {
        let catalog = catalog();
        let p = catalog.create_profile("P", None).unwrap();
        let a = catalog
            .upsert_template(p.id, None, &TemplateDraft::fixed("A", -60))
            .unwrap();
        catalog
            .upsert_template(p.id, None, &TemplateDraft::relative("B", 1, 15, true))
            .unwrap();
        catalog
            .upsert_template(p.id, None, &TemplateDraft::relative("C", 2, 5, false))
            .unwrap();

        let changed = catalog.delete_template(a[0].id).unwrap();
        assert_eq!(changed.len(), 2);

        let loaded = catalog.load_profile(p.id).unwrap();
        assert_eq!(loaded.templates.len(), 2);
        assert_eq!(loaded.templates[0].label, "B");
        assert_eq!(loaded.templates[0].sort_order, 1);
        assert_eq!(loaded.templates[0].offset_minutes, -75);
        assert!(loaded.templates[0].gap.is_none());
        assert_eq!(loaded.templates[1].gap.unwrap().reference_sort_order, 1);
        assert!(violations(&loaded.templates).is_empty());
    }

    #[test]
    fn duplicate_copies_templates_and_clears_default_flag() {
        let catalog = catalog();
        assert_eq!(catalog.seed_defaults().unwrap(), 3);
        let standard = catalog
            .list_profiles()
            .unwrap()
            .into_iter()
            .find(|p| p.name == "Standard Morning")
            .unwrap();
        catalog
            .upsert_template(
                standard.id,
                Some(2),
                &TemplateDraft::relative("Get Out of Bed", 1, 20, false)
                    .with_dismissal(DismissalPolicy::default()),
            )
            .unwrap();

        let copy = catalog.duplicate_profile(standard.id, None).unwrap();
        assert_eq!(copy.profile.name, "Standard Morning (Copy)");
        assert!(!copy.profile.is_system_default);
        assert_eq!(copy.templates.len(), 3);
        assert_eq!(copy.templates[1].offset_minutes, -70);
        assert_eq!(copy.templates[1].gap.unwrap().reference_sort_order, 1);
        assert!(copy.templates.iter().all(|t| t.profile_id == copy.profile.id));

        assert!(matches!(
            catalog.duplicate_profile(standard.id, None),
            Err(CoreError::DuplicateName { .. })
        ));
    }

    #[test]
    fn seeding_runs_once() {
        let catalog = catalog();
        assert_eq!(catalog.seed_defaults().unwrap(), 3);
        assert_eq!(catalog.seed_defaults().unwrap(), 0);

        let profiles = catalog.list_profiles().unwrap();
        assert_eq!(profiles.len(), 3);
        assert!(profiles.iter().all(|p| p.is_system_default));
        let full = profiles
            .iter()
            .find(|p| p.name == "Full Morning Routine")
            .unwrap();
        assert_eq!(catalog.load_profile(full.id).unwrap().templates.len(), 7);
    }

    #[test]
    fn deleting_profile_removes_templates() {
        let catalog = catalog();
        let p = catalog.create_profile("P", None).unwrap();
        let t = catalog
            .upsert_template(p.id, None, &TemplateDraft::fixed("A", -5))
            .unwrap();
        catalog.delete_profile(p.id).unwrap();
        assert!(matches!(
            catalog.delete_template(t[0].id),
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            catalog.delete_profile(p.id),
            Err(CoreError::NotFound { .. })
        ));
    }
}
