pub const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id BIGSERIAL PRIMARY KEY,
    embedding BYTEA NOT NULL,
    embedding_dim INTEGER NOT NULL,
    label TEXT NOT NULL DEFAULT 'unknown',
    first_seen TIMESTAMPTZ NOT NULL,
    last_seen TIMESTAMPTZ NOT NULL,
    visit_count BIGINT NOT NULL DEFAULT 1,
    daily_visit_count BIGINT NOT NULL DEFAULT 1,
    last_visit_date DATE NOT NULL
);

CREATE TABLE IF NOT EXISTS visits (
    id BIGSERIAL PRIMARY KEY,
    identity_id BIGINT NOT NULL REFERENCES identities(id),
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_visits_identity_end ON visits(identity_id, end_time);

CREATE TABLE IF NOT EXISTS daily_analytics (
    day DATE PRIMARY KEY,
    total_flow BIGINT NOT NULL DEFAULT 0,
    unique_count BIGINT NOT NULL DEFAULT 0
);
"#;
