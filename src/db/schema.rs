pub const SCHEMA: &str = r#"
-- Identities: one row per physical person ever resolved
CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    embedding BLOB NOT NULL,              -- float32 array stored as bytes
    embedding_dim INTEGER NOT NULL,
    label TEXT NOT NULL DEFAULT 'unknown',
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    visit_count INTEGER NOT NULL DEFAULT 1,        -- lifetime visits
    daily_visit_count INTEGER NOT NULL DEFAULT 1,  -- visits on last_visit_date
    last_visit_date TEXT NOT NULL
);

-- Visits: contiguous presence sessions, extended while within the re-entry window
CREATE TABLE IF NOT EXISTS visits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    FOREIGN KEY (identity_id) REFERENCES identities(id)
);

CREATE INDEX IF NOT EXISTS idx_visits_identity_end ON visits(identity_id, end_time);

-- Daily totals, keyed by calendar day (YYYY-MM-DD)
CREATE TABLE IF NOT EXISTS daily_analytics (
    day TEXT PRIMARY KEY,
    total_flow INTEGER NOT NULL DEFAULT 0,
    unique_count INTEGER NOT NULL DEFAULT 0
);
"#;
