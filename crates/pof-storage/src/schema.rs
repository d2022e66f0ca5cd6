use sqlx::SqliteConnection;

use crate::StoreResult;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        community TEXT NOT NULL,
        author TEXT,
        title TEXT NOT NULL,
        body TEXT NOT NULL,
        url TEXT,
        created_at TEXT NOT NULL,
        ingested_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS filtered_posts (
        post_id TEXT PRIMARY KEY REFERENCES posts(id),
        matched_rule TEXT NOT NULL,
        filtered_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS clusters (
        id TEXT PRIMARY KEY,
        description TEXT NOT NULL,
        centroid BLOB NOT NULL,
        member_count INTEGER NOT NULL,
        active_count INTEGER NOT NULL,
        status TEXT NOT NULL,
        profile TEXT NOT NULL,
        last_reinforced_pass INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pain_events (
        id TEXT PRIMARY KEY,
        event_key TEXT NOT NULL UNIQUE,
        post_id TEXT NOT NULL,
        community TEXT NOT NULL,
        problem TEXT NOT NULL,
        workaround TEXT,
        frequency TEXT NOT NULL,
        sentiment TEXT NOT NULL,
        embedding BLOB,
        lifecycle_stage TEXT NOT NULL,
        cluster_id TEXT REFERENCES clusters(id),
        needs_recluster INTEGER NOT NULL DEFAULT 0,
        last_seen_pass INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pain_events_stage ON pain_events(lifecycle_stage)",
    "CREATE INDEX IF NOT EXISTS idx_pain_events_cluster ON pain_events(cluster_id)",
    "CREATE INDEX IF NOT EXISTS idx_pain_events_post ON pain_events(post_id)",
    r#"
    CREATE TABLE IF NOT EXISTS opportunities (
        id TEXT PRIMARY KEY,
        cluster_id TEXT NOT NULL UNIQUE REFERENCES clusters(id),
        name TEXT NOT NULL,
        description TEXT NOT NULL,
        total_score REAL NOT NULL,
        score_breakdown TEXT NOT NULL,
        recommendation TEXT,
        reason_code TEXT,
        rec_threshold REAL,
        rec_observed REAL,
        scored_pass INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_opportunities_score ON opportunities(total_score DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS opportunity_scores (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        opportunity_id TEXT NOT NULL REFERENCES opportunities(id),
        run_id TEXT NOT NULL,
        pass_no INTEGER NOT NULL,
        total_score REAL NOT NULL,
        score_breakdown TEXT NOT NULL,
        scored_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS shortlist_entries (
        run_id TEXT NOT NULL,
        pass_no INTEGER NOT NULL,
        opportunity_id TEXT NOT NULL REFERENCES opportunities(id),
        rank INTEGER NOT NULL,
        rule TEXT NOT NULL,
        threshold REAL NOT NULL,
        PRIMARY KEY (run_id, opportunity_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        run_id TEXT PRIMARY KEY,
        pass_no INTEGER NOT NULL,
        mode TEXT NOT NULL,
        stages TEXT NOT NULL,
        status TEXT NOT NULL,
        last_committed_stage TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingested_files (
        content_hash TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        path TEXT NOT NULL,
        pass_no INTEGER NOT NULL,
        ingested_at TEXT NOT NULL
    )
    "#,
];

pub(crate) async fn apply(conn: &mut SqliteConnection) -> StoreResult<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}
