/// SQL DDL for the relay database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY,
    verbosity INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ad_hoc_commands (
    id INTEGER PRIMARY KEY,
    verbosity INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    parent_id INTEGER REFERENCES job_events(id),
    event TEXT NOT NULL,
    event_data TEXT NOT NULL,
    failed INTEGER NOT NULL DEFAULT 0,
    changed INTEGER NOT NULL DEFAULT 0,
    host_name TEXT NOT NULL DEFAULT '',
    play TEXT NOT NULL DEFAULT '',
    task TEXT NOT NULL DEFAULT '',
    counter INTEGER,
    created TEXT NOT NULL,
    modified TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ad_hoc_command_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ad_hoc_command_id INTEGER NOT NULL,
    event TEXT NOT NULL,
    event_data TEXT NOT NULL,
    failed INTEGER NOT NULL DEFAULT 0,
    changed INTEGER NOT NULL DEFAULT 0,
    host_name TEXT NOT NULL DEFAULT '',
    counter INTEGER,
    created TEXT NOT NULL,
    modified TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_tokens (
    key TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    expires TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fact_cache (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    inventory_id INTEGER NOT NULL,
    host TEXT NOT NULL,
    module TEXT NOT NULL,
    facts TEXT NOT NULL,
    modified TEXT NOT NULL,
    UNIQUE (inventory_id, host, module)
);

CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events(job_id);
CREATE INDEX IF NOT EXISTS idx_job_events_parent ON job_events(parent_id);
CREATE INDEX IF NOT EXISTS idx_job_events_job_counter ON job_events(job_id, counter);
CREATE INDEX IF NOT EXISTS idx_ad_hoc_events_command ON ad_hoc_command_events(ad_hoc_command_id);
CREATE INDEX IF NOT EXISTS idx_auth_tokens_expires ON auth_tokens(expires);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
