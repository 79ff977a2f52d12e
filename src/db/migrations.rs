/// SQL migration for the initial schema
///
/// Design principles:
/// - `kv_store` holds the device-local collections (queue, history, pending index)
///   as JSON values, one row per collection
/// - `reports` mirrors the authoritative report cache, one column per field
/// - snake_case naming (mapped to the typed model in `cache::sqlite`)
/// - exactly one ownership column per report, enforced with a CHECK
pub const MIGRATION_001: &str = r#"
-- =============================================================================
-- App Settings
-- =============================================================================
CREATE TABLE IF NOT EXISTS settings (
    key             TEXT PRIMARY KEY,
    value           TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

-- =============================================================================
-- Local key-value store (System A queue/history, System B index, session)
-- =============================================================================
CREATE TABLE IF NOT EXISTS kv_store (
    key             TEXT PRIMARY KEY,
    value           TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

-- =============================================================================
-- Reports - authoritative cache
-- =============================================================================
CREATE TABLE IF NOT EXISTS reports (
    id                          TEXT PRIMARY KEY,   -- UUID, equals the queue local_id
    user_id                     TEXT,
    anonymous_user_id           TEXT,
    local_confirmation_number   TEXT NOT NULL,

    -- REGULATOR STATE
    dmf_status                  TEXT NOT NULL DEFAULT 'pending',
    dmf_confirmation_number     TEXT,
    dmf_object_id               TEXT,
    dmf_submitted_at            TEXT,
    dmf_error                   TEXT,
    webhook_attempts            INTEGER NOT NULL DEFAULT 0,

    -- LICENSE / IDENTITY AS SUBMITTED
    has_license                 INTEGER NOT NULL DEFAULT 0,
    wrc_id                      TEXT,
    first_name                  TEXT NOT NULL,
    last_name                   TEXT NOT NULL,
    zip_code                    TEXT NOT NULL,
    date_of_birth               TEXT,

    -- HARVEST
    harvest_date                TEXT NOT NULL,      -- YYYY-MM-DD
    area_of_harvest             TEXT NOT NULL,
    red_drum_count              INTEGER NOT NULL DEFAULT 0,
    flounder_count              INTEGER NOT NULL DEFAULT 0,
    spotted_seatrout_count      INTEGER NOT NULL DEFAULT 0,
    weakfish_count              INTEGER NOT NULL DEFAULT 0,
    striped_bass_count          INTEGER NOT NULL DEFAULT 0,
    used_hook_and_line          INTEGER NOT NULL DEFAULT 1,
    gear_code                   TEXT,

    -- CONTACT PREFERENCES
    want_text_confirmation      INTEGER NOT NULL DEFAULT 0,
    phone                       TEXT,
    want_email_confirmation     INTEGER NOT NULL DEFAULT 0,
    email                       TEXT,
    enter_raffle                INTEGER NOT NULL DEFAULT 0,

    -- METADATA
    created_at                  TEXT NOT NULL,
    updated_at                  TEXT NOT NULL,

    CHECK ((user_id IS NULL) <> (anonymous_user_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_reports_user ON reports(user_id);
CREATE INDEX IF NOT EXISTS idx_reports_anonymous ON reports(anonymous_user_id);

-- =============================================================================
-- Rewards members
-- =============================================================================
CREATE TABLE IF NOT EXISTS members (
    user_id             TEXT PRIMARY KEY,
    email               TEXT,
    anonymous_user_id   TEXT,                   -- device id the member converted from
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

-- =============================================================================
-- Rewards drawing entries - one row per member per drawing
-- =============================================================================
CREATE TABLE IF NOT EXISTS rewards_entries (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id                 TEXT NOT NULL,
    drawing_id              TEXT NOT NULL,
    associated_report_ids   TEXT NOT NULL DEFAULT '[]',  -- JSON array of report ids
    entered_at              TEXT NOT NULL,

    UNIQUE(user_id, drawing_id)
);
"#;

/// Migration 002: retry bookkeeping for the pending-sync drain
///
/// dmf_attempts: regulator attempts made for a cache-resident report, so a
///               permanently rejected report stops being resubmitted every cycle
/// idx_reports_status: the webhook retry cycle and the pending drain both scan
///                     by status
pub const MIGRATION_002: &str = r#"
ALTER TABLE reports ADD COLUMN dmf_attempts INTEGER NOT NULL DEFAULT 0;

CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(dmf_status, webhook_attempts);
"#;

/// All migrations in application order, with the name recorded in `_migrations`
pub fn get_migrations() -> Vec<(&'static str, &'static str)> {
    vec![
        ("migration_001", MIGRATION_001),
        ("migration_002", MIGRATION_002),
    ]
}
