pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

CREATE TABLE IF NOT EXISTS sources (
    source_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    root_path TEXT NOT NULL,
    include_patterns TEXT,          -- JSON array of glob patterns
    exclude_patterns TEXT,          -- JSON array of glob patterns
    schedule TEXT,                  -- NULL means manual-only
    timezone TEXT NOT NULL DEFAULT 'UTC',
    last_scan_at INTEGER,           -- Unix timestamp (UTC)
    next_scan_at INTEGER,           -- Unix timestamp (UTC)
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fingerprints (
    fingerprint_id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL,
    path TEXT NOT NULL,
    path_hash TEXT NOT NULL,        -- SHA-256 of the absolute path, hex
    size_bytes INTEGER NOT NULL,
    modified_at INTEGER NOT NULL,   -- Unix timestamp (UTC), whole seconds
    outcome INTEGER NOT NULL,       -- 0 = success, 1 = failed, 2 = skipped
    error_message TEXT,
    processed_at INTEGER NOT NULL,
    FOREIGN KEY (source_id) REFERENCES sources(source_id) ON DELETE CASCADE,
    UNIQUE (source_id, path)
);

CREATE INDEX IF NOT EXISTS idx_fingerprints_source ON fingerprints (source_id, outcome);

COMMIT;
"#;
