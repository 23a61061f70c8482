//! Database schema migrations for overlord.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const SCHEMA_VERSION: i32 = 4;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }
    if current_version < 3 {
        migrate_v3(conn)?;
    }
    if current_version < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .unwrap_or_else(|e| {
        if !matches!(e, rusqlite::Error::QueryReturnedNoRows) {
            tracing::warn!(error = %e, "failed to read schema_version");
        }
        0
    })
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: baseline tables.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS alarm_profiles (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            name              TEXT NOT NULL,
            description       TEXT,
            is_system_default INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alarm_templates (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            profile_id              INTEGER NOT NULL
                                    REFERENCES alarm_profiles(id) ON DELETE CASCADE,
            label                   TEXT NOT NULL,
            offset_minutes          INTEGER NOT NULL,
            sort_order              INTEGER NOT NULL,
            sound_source            TEXT NOT NULL DEFAULT 'LOCAL',
            sound_uri               TEXT,
            sound_name              TEXT,
            requires_user_dismiss   INTEGER NOT NULL DEFAULT 1,
            auto_stop_after_minutes INTEGER,
            vibration_enabled       INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS scheduled_journeys (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            origin_name         TEXT NOT NULL,
            origin_address      TEXT,
            origin_lat          REAL,
            origin_lng          REAL,
            destination_name    TEXT NOT NULL,
            destination_address TEXT,
            destination_lat     REAL,
            destination_lng     REAL,
            route_id            TEXT NOT NULL,
            route_summary       TEXT NOT NULL DEFAULT '',
            transport_modes     TEXT NOT NULL DEFAULT '[]',
            departure_time      TEXT NOT NULL,
            arrival_time        TEXT NOT NULL,
            duration_minutes    INTEGER NOT NULL,
            status              TEXT NOT NULL DEFAULT 'UPCOMING',
            profile_id          INTEGER REFERENCES alarm_profiles(id) ON DELETE SET NULL,
            profile_name        TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scheduled_alarms (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            journey_id              INTEGER NOT NULL
                                    REFERENCES scheduled_journeys(id) ON DELETE CASCADE,
            template_id             INTEGER,
            label                   TEXT NOT NULL,
            scheduled_time          TEXT NOT NULL,
            original_offset_minutes INTEGER NOT NULL,
            sort_order              INTEGER NOT NULL,
            sound_source            TEXT NOT NULL DEFAULT 'LOCAL',
            sound_uri               TEXT,
            sound_name              TEXT,
            requires_user_dismiss   INTEGER NOT NULL DEFAULT 1,
            auto_stop_after_minutes INTEGER,
            auto_stop_after_secs    INTEGER,
            vibration_enabled       INTEGER NOT NULL DEFAULT 1,
            is_enabled              INTEGER NOT NULL DEFAULT 1,
            is_fired                INTEGER NOT NULL DEFAULT 0,
            fired_at                TEXT,
            dismissed_at            TEXT,
            snoozed_until           TEXT
        );

        CREATE TABLE IF NOT EXISTS alarm_instances (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            journey_id              INTEGER
                                    REFERENCES scheduled_journeys(id) ON DELETE SET NULL,
            scheduled_time          TEXT NOT NULL,
            alarm_type              TEXT NOT NULL,
            profile_id              INTEGER,
            label                   TEXT NOT NULL,
            requires_user_dismiss   INTEGER NOT NULL DEFAULT 1,
            auto_stop_after_minutes INTEGER,
            is_active               INTEGER NOT NULL DEFAULT 1,
            acknowledged_at         TEXT,
            cancelled_at            TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_templates_profile ON alarm_templates(profile_id, sort_order);
        CREATE INDEX IF NOT EXISTS idx_journeys_status ON scheduled_journeys(status);
        CREATE INDEX IF NOT EXISTS idx_alarms_journey ON scheduled_alarms(journey_id);
        CREATE INDEX IF NOT EXISTS idx_alarms_time ON scheduled_alarms(scheduled_time);
        CREATE INDEX IF NOT EXISTS idx_instances_time ON alarm_instances(scheduled_time);",
    )?;

    set_schema_version(&tx, 1)?;
    tx.commit()
}

/// Migration v2: gap relationship columns on templates.
///
/// Existing templates keep their offsets and have no relationship.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "ALTER TABLE alarm_templates ADD COLUMN reference_sort_order INTEGER;
         ALTER TABLE alarm_templates ADD COLUMN gap_minutes INTEGER;
         ALTER TABLE alarm_templates ADD COLUMN gap_is_before INTEGER NOT NULL DEFAULT 1;",
    )?;

    set_schema_version(&tx, 2)?;
    tx.commit()
}

/// Migration v3: record how each alarm ended.
///
/// Backfills from the older timestamp columns: dismissed scheduled alarms and
/// acknowledged instances become `dismissed`, cancelled instances `cancelled`.
fn migrate_v3(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "ALTER TABLE scheduled_alarms ADD COLUMN resolution TEXT;
         ALTER TABLE alarm_instances ADD COLUMN resolution TEXT;",
    )?;

    tx.execute(
        "UPDATE scheduled_alarms SET resolution = 'dismissed'
         WHERE dismissed_at IS NOT NULL AND resolution IS NULL",
        [],
    )?;
    tx.execute(
        "UPDATE alarm_instances SET resolution = 'cancelled'
         WHERE cancelled_at IS NOT NULL AND resolution IS NULL",
        [],
    )?;
    tx.execute(
        "UPDATE alarm_instances SET resolution = 'dismissed'
         WHERE acknowledged_at IS NOT NULL AND resolution IS NULL",
        [],
    )?;

    set_schema_version(&tx, 3)?;
    tx.commit()
}

/// Migration v4: firing time for ad-hoc instances.
///
/// Instances that already ended are treated as having fired when they ended.
fn migrate_v4(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch("ALTER TABLE alarm_instances ADD COLUMN fired_at TEXT;")?;
    tx.execute(
        "UPDATE alarm_instances SET fired_at = acknowledged_at WHERE acknowledged_at IS NOT NULL",
        [],
    )?;

    set_schema_version(&tx, 4)?;
    tx.commit()
}
