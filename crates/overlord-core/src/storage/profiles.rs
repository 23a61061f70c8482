//! Profile and template persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::database::{fmt_ts, parse_ts, AlarmDb};
use crate::error::CoreError;
use crate::profile::{
    AlarmProfile, AlarmTemplate, DismissalPolicy, GapRelation, ProfileWithTemplates,
    SoundDescriptor, SoundSource,
};

const PROFILE_COLUMNS: &str = "id, name, description, is_system_default, created_at, updated_at";

const TEMPLATE_COLUMNS: &str = "id, profile_id, label, offset_minutes, sort_order,
    sound_source, sound_uri, sound_name, requires_user_dismiss, auto_stop_after_minutes,
    vibration_enabled, reference_sort_order, gap_minutes, gap_is_before";

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<AlarmProfile> {
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(AlarmProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        is_system_default: row.get(3)?,
        created_at: parse_ts(4, &created_at)?,
        updated_at: parse_ts(5, &updated_at)?,
    })
}

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<AlarmTemplate> {
    let source: String = row.get(5)?;
    let reference: Option<i32> = row.get(11)?;
    let gap_minutes: Option<u32> = row.get(12)?;
    let gap = match (reference, gap_minutes) {
        (Some(reference_sort_order), Some(gap_minutes)) => Some(GapRelation {
            reference_sort_order,
            gap_minutes,
            gap_is_before: row.get(13)?,
        }),
        _ => None,
    };
    Ok(AlarmTemplate {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        label: row.get(2)?,
        offset_minutes: row.get(3)?,
        sort_order: row.get(4)?,
        sound: SoundDescriptor {
            source: SoundSource::parse(&source),
            uri: row.get(6)?,
            name: row.get(7)?,
        },
        dismissal: DismissalPolicy {
            requires_user_dismiss: row.get(8)?,
            auto_stop_after_minutes: row.get(9)?,
        },
        vibration_enabled: row.get(10)?,
        gap,
    })
}

/// Insert `template` (when its id is 0) or overwrite the stored row.
///
/// Takes a plain connection so it can run inside a caller's transaction.
fn save_template(conn: &Connection, template: &mut AlarmTemplate) -> rusqlite::Result<()> {
    let gap = template.gap;
    let values = params![
        template.profile_id,
        template.label,
        template.offset_minutes,
        template.sort_order,
        template.sound.source.as_str(),
        template.sound.uri,
        template.sound.name,
        template.dismissal.requires_user_dismiss,
        template.dismissal.auto_stop_after_minutes,
        template.vibration_enabled,
        gap.map(|g| g.reference_sort_order),
        gap.map(|g| g.gap_minutes),
        gap.map_or(true, |g| g.gap_is_before),
    ];

    if template.id == 0 {
        conn.execute(
            "INSERT INTO alarm_templates (profile_id, label, offset_minutes, sort_order,
                sound_source, sound_uri, sound_name, requires_user_dismiss,
                auto_stop_after_minutes, vibration_enabled, reference_sort_order,
                gap_minutes, gap_is_before)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            values,
        )?;
        template.id = conn.last_insert_rowid();
    } else {
        let mut with_id = values.to_vec();
        with_id.push(&template.id);
        conn.execute(
            "UPDATE alarm_templates SET profile_id = ?1, label = ?2, offset_minutes = ?3,
                sort_order = ?4, sound_source = ?5, sound_uri = ?6, sound_name = ?7,
                requires_user_dismiss = ?8, auto_stop_after_minutes = ?9,
                vibration_enabled = ?10, reference_sort_order = ?11, gap_minutes = ?12,
                gap_is_before = ?13
             WHERE id = ?14",
            with_id.as_slice(),
        )?;
    }
    Ok(())
}

fn delete_template_row(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM alarm_templates WHERE id = ?1", [id])? > 0)
}

fn touch_profile(conn: &Connection, id: i64, at: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE alarm_profiles SET updated_at = ?1 WHERE id = ?2",
        params![fmt_ts(at), id],
    )?;
    Ok(())
}

fn insert_profile_row(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
    is_system_default: bool,
    at: DateTime<Utc>,
) -> rusqlite::Result<AlarmProfile> {
    conn.execute(
        "INSERT INTO alarm_profiles (name, description, is_system_default, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![name, description, is_system_default, fmt_ts(at)],
    )?;
    Ok(AlarmProfile {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        description: description.map(str::to_string),
        is_system_default,
        created_at: at,
        updated_at: at,
    })
}

fn templates_for_conn(
    conn: &Connection,
    profile_id: i64,
) -> rusqlite::Result<Vec<AlarmTemplate>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TEMPLATE_COLUMNS} FROM alarm_templates
         WHERE profile_id = ?1 ORDER BY sort_order ASC, id ASC"
    ))?;
    let rows = stmt.query_map([profile_id], row_to_template)?;
    rows.collect()
}

impl AlarmDb {
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn insert_profile(
        &self,
        name: &str,
        description: Option<&str>,
        is_system_default: bool,
        at: DateTime<Utc>,
    ) -> Result<AlarmProfile, CoreError> {
        Ok(insert_profile_row(
            &self.conn,
            name,
            description,
            is_system_default,
            at,
        )?)
    }

    /// Rename / re-describe a profile. Returns false if it does not exist.
    pub fn update_profile(
        &self,
        id: i64,
        name: &str,
        description: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let changed = self.conn.execute(
            "UPDATE alarm_profiles SET name = ?1, description = ?2, updated_at = ?3 WHERE id = ?4",
            params![name, description, fmt_ts(at), id],
        )?;
        Ok(changed > 0)
    }

    /// Delete a profile and, through the foreign key, its templates.
    pub fn delete_profile(&self, id: i64) -> Result<bool, CoreError> {
        Ok(self
            .conn
            .execute("DELETE FROM alarm_profiles WHERE id = ?1", [id])?
            > 0)
    }

    pub fn get_profile(&self, id: i64) -> Result<Option<AlarmProfile>, CoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM alarm_profiles WHERE id = ?1"),
                [id],
                row_to_profile,
            )
            .optional()?)
    }

    /// All profiles, system defaults first, then by name.
    pub fn list_profiles(&self) -> Result<Vec<AlarmProfile>, CoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM alarm_profiles
             ORDER BY is_system_default DESC, name ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_profile)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Number of profiles called exactly `name`, ignoring `exclude_id`.
    pub fn count_profiles_with_name(
        &self,
        name: &str,
        exclude_id: Option<i64>,
    ) -> Result<i64, CoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM alarm_profiles WHERE name = ?1 AND id != ?2",
            params![name, exclude_id.unwrap_or(-1)],
            |row| row.get(0),
        )?)
    }

    pub fn has_system_default(&self) -> Result<bool, CoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM alarm_profiles WHERE is_system_default = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Templates of a profile in ascending sort order.
    pub fn templates_for(&self, profile_id: i64) -> Result<Vec<AlarmTemplate>, CoreError> {
        Ok(templates_for_conn(&self.conn, profile_id)?)
    }

    pub fn get_template(&self, id: i64) -> Result<Option<AlarmTemplate>, CoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM alarm_templates WHERE id = ?1"),
                [id],
                row_to_template,
            )
            .optional()?)
    }

    /// Insert a profile together with copies of `templates` in one transaction.
    ///
    /// Template ids and profile ids in `templates` are ignored; sort orders and
    /// gap relations are kept as given.
    pub fn insert_profile_with_templates(
        &mut self,
        name: &str,
        description: Option<&str>,
        is_system_default: bool,
        templates: &[AlarmTemplate],
        at: DateTime<Utc>,
    ) -> Result<ProfileWithTemplates, CoreError> {
        let tx = self.conn.transaction()?;
        let profile = insert_profile_row(&tx, name, description, is_system_default, at)?;
        let mut stored = Vec::with_capacity(templates.len());
        for template in templates {
            let mut copy = AlarmTemplate {
                id: 0,
                profile_id: profile.id,
                ..template.clone()
            };
            save_template(&tx, &mut copy)?;
            stored.push(copy);
        }
        tx.commit()?;
        Ok(ProfileWithTemplates {
            profile,
            templates: stored,
        })
    }

    /// Write the result of a template edit in one transaction.
    ///
    /// `changed` rows with id 0 are inserted and get their id assigned.
    pub fn commit_template_edit(
        &mut self,
        profile_id: i64,
        changed: &mut [AlarmTemplate],
        deleted: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let tx = self.conn.transaction()?;
        if let Some(id) = deleted {
            delete_template_row(&tx, id)?;
        }
        for template in changed.iter_mut() {
            save_template(&tx, template)?;
        }
        touch_profile(&tx, profile_id, at)?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_profile(&self, id: i64) -> Result<Option<ProfileWithTemplates>, CoreError> {
        let Some(profile) = self.get_profile(id)? else {
            return Ok(None);
        };
        let templates = self.templates_for(id)?;
        Ok(Some(ProfileWithTemplates { profile, templates }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::TemplateDraft;

    fn template(profile_id: i64, label: &str, offset: i32, sort_order: i32) -> AlarmTemplate {
        let draft = TemplateDraft::fixed(label, offset);
        AlarmTemplate {
            id: 0,
            profile_id,
            label: draft.label,
            offset_minutes: offset,
            sort_order,
            sound: draft.sound,
            dismissal: draft.dismissal,
            vibration_enabled: draft.vibration_enabled,
            gap: None,
        }
    }

    #[test]
    fn profile_crud_and_name_count() {
        let db = AlarmDb::open_memory().unwrap();
        let now = Utc::now();
        let work = db.insert_profile("Work", Some("weekdays"), false, now).unwrap();
        let gym = db.insert_profile("Gym", None, false, now).unwrap();

        assert_eq!(db.count_profiles_with_name("Work", None).unwrap(), 1);
        assert_eq!(db.count_profiles_with_name("Work", Some(work.id)).unwrap(), 0);
        assert_eq!(db.count_profiles_with_name("work", None).unwrap(), 0);

        assert!(db.update_profile(gym.id, "Gym Day", None, now).unwrap());
        assert_eq!(db.get_profile(gym.id).unwrap().unwrap().name, "Gym Day");

        assert!(db.delete_profile(work.id).unwrap());
        assert!(!db.delete_profile(work.id).unwrap());
        assert!(db.get_profile(work.id).unwrap().is_none());
    }

    #[test]
    fn list_orders_system_defaults_first() {
        let db = AlarmDb::open_memory().unwrap();
        let now = Utc::now();
        db.insert_profile("Alpha", None, false, now).unwrap();
        db.insert_profile("Zulu", None, true, now).unwrap();
        db.insert_profile("Beta", None, false, now).unwrap();

        let names: Vec<String> = db
            .list_profiles()
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Zulu", "Alpha", "Beta"]);
        assert!(db.has_system_default().unwrap());
    }

    #[test]
    fn templates_round_trip_with_gap_and_cascade() {
        let db = AlarmDb::open_memory().unwrap();
        let profile = db.insert_profile("P", None, false, Utc::now()).unwrap();

        let mut wake = template(profile.id, "Wake", -60, 1);
        save_template(db.conn(), &mut wake).unwrap();
        let mut dress = template(profile.id, "Dress", -75, 2);
        dress.gap = Some(GapRelation {
            reference_sort_order: 1,
            gap_minutes: 15,
            gap_is_before: true,
        });
        dress.sound.source = SoundSource::Spotify;
        dress.sound.uri = Some("spotify:track:1".into());
        save_template(db.conn(), &mut dress).unwrap();

        let loaded = db.load_profile(profile.id).unwrap().unwrap();
        assert_eq!(loaded.templates, vec![wake.clone(), dress.clone()]);

        dress.label = "Get dressed".into();
        save_template(db.conn(), &mut dress).unwrap();
        assert_eq!(
            db.get_template(dress.id).unwrap().unwrap().label,
            "Get dressed"
        );

        db.delete_profile(profile.id).unwrap();
        assert!(db.get_template(wake.id).unwrap().is_none());
        assert!(db.templates_for(profile.id).unwrap().is_empty());
    }
}
