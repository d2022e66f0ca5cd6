//! SQLite-backed event store for POF: the single source of truth shared by every stage.
//!
//! One `EventStore` handle is opened per run and passed to each component. Writes go
//! through [`StoreTx`], one transaction per unit of work; dropping an uncommitted
//! `StoreTx` rolls it back.

mod mapping;
mod schema;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pof_core::{
    Cluster, LifecycleStage, Opportunity, PainEvent, Post, ProcessingMode, RetentionRate,
    ShortlistEntry,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use mapping::{decode_vector, encode_vector};

pub const CRATE_NAME: &str = "pof-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Tables callers may count; keeps table names out of caller-built SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Posts,
    FilteredPosts,
    PainEvents,
    Clusters,
    Opportunities,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Posts,
        Table::FilteredPosts,
        Table::PainEvents,
        Table::Clusters,
        Table::Opportunities,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Posts => "posts",
            Table::FilteredPosts => "filtered_posts",
            Table::PainEvents => "pain_events",
            Table::Clusters => "clusters",
            Table::Opportunities => "opportunities",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RunStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown run status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub pass_no: i64,
    pub mode: ProcessingMode,
    pub stages: String,
    pub status: RunStatus,
    pub last_committed_stage: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPost {
    pub post: Post,
    pub ingested_at: DateTime<Utc>,
}

/// An opportunity from the latest scoring pass with its cluster's current strength.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedOpportunity {
    pub opportunity: Opportunity,
    pub active_count: i64,
}

#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Open (creating if missing) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. A single connection keeps every query on the same database.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        schema::apply(&mut conn).await?;
        debug!("event store schema applied");
        Ok(())
    }

    pub async fn begin(&self) -> StoreResult<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn count(&self, table: Table) -> StoreResult<i64> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!("SELECT COUNT(*) AS n FROM {}", table.name());
        let row = sqlx::query(&sql).fetch_one(&mut *conn).await?;
        Ok(row.try_get("n")?)
    }

    pub async fn count_events_in_stage(&self, stage: LifecycleStage) -> StoreResult<i64> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pain_events WHERE lifecycle_stage = ?")
            .bind(stage.as_str())
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn retention_rate(&self) -> StoreResult<RetentionRate> {
        let mut conn = self.pool.acquire().await?;
        queries::retention_rate(&mut conn).await
    }

    pub async fn pain_events_in_stage(&self, stage: LifecycleStage) -> StoreResult<Vec<PainEvent>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT * FROM pain_events WHERE lifecycle_stage = ? ORDER BY created_at, id",
        )
        .bind(stage.as_str())
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(mapping::pain_event_from_row).collect()
    }

    pub async fn pain_events(&self) -> StoreResult<Vec<PainEvent>> {
        let mut conn = self.pool.acquire().await?;
        queries::pain_events(&mut conn).await
    }

    pub async fn clusters(&self) -> StoreResult<Vec<Cluster>> {
        let mut conn = self.pool.acquire().await?;
        queries::clusters(&mut conn).await
    }

    pub async fn posts(&self) -> StoreResult<Vec<StoredPost>> {
        let mut conn = self.pool.acquire().await?;
        queries::posts(&mut conn).await
    }

    pub async fn opportunities(&self) -> StoreResult<Vec<Opportunity>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query("SELECT * FROM opportunities ORDER BY created_at, id")
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(mapping::opportunity_from_row).collect()
    }

    pub async fn opportunity(&self, id: Uuid) -> StoreResult<Option<Opportunity>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT * FROM opportunities WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(mapping::opportunity_from_row).transpose()
    }

    /// Opportunities at or above `min_score`, best first.
    pub async fn opportunities_above(&self, min_score: f64) -> StoreResult<Vec<Opportunity>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT * FROM opportunities WHERE total_score >= ? ORDER BY total_score DESC, id",
        )
        .bind(min_score)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(mapping::opportunity_from_row).collect()
    }

    pub async fn shortlist_for_run(&self, run_id: Uuid) -> StoreResult<Vec<ShortlistEntry>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT * FROM shortlist_entries WHERE run_id = ? ORDER BY rank",
        )
        .bind(run_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
        rows.iter()
            .map(|row| {
                let opportunity_id: String = row.try_get("opportunity_id")?;
                let rule: String = row.try_get("rule")?;
                Ok(ShortlistEntry {
                    pass_no: row.try_get("pass_no")?,
                    opportunity_id: mapping::parse_uuid(
                        &opportunity_id,
                        "shortlist_entries.opportunity_id",
                    )?,
                    rank: row.try_get("rank")?,
                    rule: mapping::parse_enum(&rule)?,
                    threshold: row.try_get("threshold")?,
                })
            })
            .collect()
    }

    pub async fn score_history(&self, opportunity_id: Uuid) -> StoreResult<Vec<(i64, f64)>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT pass_no, total_score FROM opportunity_scores WHERE opportunity_id = ? ORDER BY id",
        )
        .bind(opportunity_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("pass_no")?, row.try_get("total_score")?)))
            .collect()
    }

    pub async fn is_file_ingested(&self, content_hash: &str) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT 1 AS hit FROM ingested_files WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    /// Pass numbers advance only with successful runs; a failed or cancelled run is retried
    /// under the same pass.
    pub async fn next_pass_no(&self) -> StoreResult<i64> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT COALESCE(MAX(pass_no), 0) + 1 AS next FROM pipeline_runs WHERE status = 'succeeded'",
        )
        .fetch_one(&mut *conn)
        .await?;
        Ok(row.try_get("next")?)
    }

    pub async fn last_successful_run(&self) -> StoreResult<Option<RunRecord>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT * FROM pipeline_runs WHERE status = 'succeeded' ORDER BY pass_no DESC, started_at DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    pub async fn run(&self, run_id: Uuid) -> StoreResult<Option<RunRecord>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT * FROM pipeline_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    pub async fn start_run(
        &self,
        run_id: Uuid,
        pass_no: i64,
        mode: ProcessingMode,
        stages: &str,
        started_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (run_id, pass_no, mode, stages, status, started_at)
            VALUES (?, ?, ?, ?, 'running', ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(pass_no)
        .bind(mode.as_str())
        .bind(stages)
        .bind(started_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn mark_stage_committed(&self, run_id: Uuid, stage: &str) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("UPDATE pipeline_runs SET last_committed_stage = ? WHERE run_id = ?")
            .bind(stage)
            .bind(run_id.to_string())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "UPDATE pipeline_runs SET status = ?, error = ?, finished_at = ? WHERE run_id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(run_id.to_string())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<RunRecord> {
    let run_id: String = row.try_get("run_id")?;
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    Ok(RunRecord {
        run_id: mapping::parse_uuid(&run_id, "pipeline_runs.run_id")?,
        pass_no: row.try_get("pass_no")?,
        mode: mapping::parse_enum(&mode)?,
        stages: row.try_get("stages")?,
        status: status.parse()?,
        last_committed_stage: row.try_get("last_committed_stage")?,
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

/// One unit of work. Nothing is visible to other handles until [`StoreTx::commit`].
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    pub async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn pain_events(&mut self) -> StoreResult<Vec<PainEvent>> {
        queries::pain_events(self.conn()).await
    }

    pub async fn clusters(&mut self) -> StoreResult<Vec<Cluster>> {
        queries::clusters(self.conn()).await
    }

    pub async fn posts(&mut self) -> StoreResult<Vec<StoredPost>> {
        queries::posts(self.conn()).await
    }

    pub async fn retention_rate(&mut self) -> StoreResult<RetentionRate> {
        queries::retention_rate(self.conn()).await
    }

    /// Returns `false` when a post with the same id already exists.
    pub async fn insert_post(
        &mut self,
        post: &Post,
        ingested_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO posts (id, community, author, title, body, url, created_at, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.community)
        .bind(&post.author)
        .bind(&post.title)
        .bind(&post.body)
        .bind(&post.url)
        .bind(post.created_at)
        .bind(ingested_at)
        .execute(self.conn())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn upsert_filtered_post(
        &mut self,
        post_id: &str,
        matched_rule: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO filtered_posts (post_id, matched_rule, filtered_at)
            VALUES (?, ?, ?)
            ON CONFLICT(post_id) DO UPDATE SET matched_rule = excluded.matched_rule,
                                               filtered_at = excluded.filtered_at
            "#,
        )
        .bind(post_id)
        .bind(matched_rule)
        .bind(Utc::now())
        .execute(self.conn())
        .await?;
        Ok(())
    }

    pub async fn post_community(&mut self, post_id: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT community FROM posts WHERE id = ?")
            .bind(post_id)
            .fetch_optional(self.conn())
            .await?;
        Ok(row.map(|r| r.try_get("community")).transpose()?)
    }

    pub async fn pain_event_by_key(&mut self, event_key: &str) -> StoreResult<Option<PainEvent>> {
        let row = sqlx::query("SELECT * FROM pain_events WHERE event_key = ?")
            .bind(event_key)
            .fetch_optional(self.conn())
            .await?;
        row.as_ref().map(mapping::pain_event_from_row).transpose()
    }

    pub async fn pain_events_for_post(&mut self, post_id: &str) -> StoreResult<Vec<PainEvent>> {
        let rows =
            sqlx::query("SELECT * FROM pain_events WHERE post_id = ? ORDER BY created_at, id")
                .bind(post_id)
                .fetch_all(self.conn())
                .await?;
        rows.iter().map(mapping::pain_event_from_row).collect()
    }

    pub async fn insert_pain_event(&mut self, event: &PainEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pain_events (
                id, event_key, post_id, community, problem, workaround, frequency, sentiment,
                embedding, lifecycle_stage, cluster_id, needs_recluster, last_seen_pass,
                created_at, last_seen_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.event_key)
        .bind(&event.post_id)
        .bind(&event.community)
        .bind(&event.problem)
        .bind(&event.workaround)
        .bind(event.frequency.as_str())
        .bind(mapping::to_json(&event.sentiment)?)
        .bind(event.embedding.as_deref().map(encode_vector))
        .bind(event.lifecycle_stage.as_str())
        .bind(event.cluster_id.map(|id| id.to_string()))
        .bind(event.needs_recluster)
        .bind(event.last_seen_pass)
        .bind(event.created_at)
        .bind(event.last_seen_at)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    /// Rewrites every mutable column of an existing event.
    pub async fn update_pain_event(&mut self, event: &PainEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE pain_events
               SET event_key = ?, problem = ?, workaround = ?, frequency = ?, sentiment = ?,
                   embedding = ?, lifecycle_stage = ?, cluster_id = ?, needs_recluster = ?,
                   last_seen_pass = ?, last_seen_at = ?
             WHERE id = ?
            "#,
        )
        .bind(&event.event_key)
        .bind(&event.problem)
        .bind(&event.workaround)
        .bind(event.frequency.as_str())
        .bind(mapping::to_json(&event.sentiment)?)
        .bind(event.embedding.as_deref().map(encode_vector))
        .bind(event.lifecycle_stage.as_str())
        .bind(event.cluster_id.map(|id| id.to_string()))
        .bind(event.needs_recluster)
        .bind(event.last_seen_pass)
        .bind(event.last_seen_at)
        .bind(event.id.to_string())
        .execute(self.conn())
        .await?;
        Ok(())
    }

    pub async fn upsert_cluster(&mut self, cluster: &Cluster) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO clusters (
                id, description, centroid, member_count, active_count, status, profile,
                last_reinforced_pass, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                description = excluded.description,
                centroid = excluded.centroid,
                member_count = excluded.member_count,
                active_count = excluded.active_count,
                status = excluded.status,
                profile = excluded.profile,
                last_reinforced_pass = excluded.last_reinforced_pass,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(cluster.id.to_string())
        .bind(&cluster.description)
        .bind(encode_vector(&cluster.centroid))
        .bind(cluster.member_count)
        .bind(cluster.active_count)
        .bind(cluster.status.as_str())
        .bind(mapping::to_json(&cluster.profile)?)
        .bind(cluster.last_reinforced_pass)
        .bind(cluster.created_at)
        .bind(cluster.updated_at)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    pub async fn opportunity(&mut self, id: Uuid) -> StoreResult<Option<Opportunity>> {
        let row = sqlx::query("SELECT * FROM opportunities WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.conn())
            .await?;
        row.as_ref().map(mapping::opportunity_from_row).transpose()
    }

    pub async fn upsert_opportunity(&mut self, opportunity: &Opportunity) -> StoreResult<()> {
        let rec = opportunity.recommendation;
        sqlx::query(
            r#"
            INSERT INTO opportunities (
                id, cluster_id, name, description, total_score, score_breakdown, recommendation,
                reason_code, rec_threshold, rec_observed, scored_pass, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                total_score = excluded.total_score,
                score_breakdown = excluded.score_breakdown,
                recommendation = excluded.recommendation,
                reason_code = excluded.reason_code,
                rec_threshold = excluded.rec_threshold,
                rec_observed = excluded.rec_observed,
                scored_pass = excluded.scored_pass,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(opportunity.id.to_string())
        .bind(opportunity.cluster_id.to_string())
        .bind(&opportunity.name)
        .bind(&opportunity.description)
        .bind(opportunity.total_score)
        .bind(mapping::to_json(&opportunity.breakdown)?)
        .bind(rec.map(|r| r.outcome.as_str()))
        .bind(rec.map(|r| r.reason.as_str()))
        .bind(rec.map(|r| r.threshold))
        .bind(rec.map(|r| r.observed))
        .bind(opportunity.scored_pass)
        .bind(opportunity.created_at)
        .bind(opportunity.updated_at)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    pub async fn append_score_history(
        &mut self,
        run_id: Uuid,
        opportunity: &Opportunity,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO opportunity_scores (opportunity_id, run_id, pass_no, total_score, score_breakdown, scored_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(opportunity.id.to_string())
        .bind(run_id.to_string())
        .bind(opportunity.scored_pass)
        .bind(opportunity.total_score)
        .bind(mapping::to_json(&opportunity.breakdown)?)
        .bind(opportunity.updated_at)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    /// Opportunities scored in `pass_no`, joined with their cluster's active count.
    pub async fn scored_opportunities(
        &mut self,
        pass_no: i64,
    ) -> StoreResult<Vec<RankedOpportunity>> {
        let rows = sqlx::query(
            r#"
            SELECT o.*, c.active_count AS cluster_active_count
              FROM opportunities o
              JOIN clusters c ON c.id = o.cluster_id
             WHERE o.scored_pass = ?
             ORDER BY o.id
            "#,
        )
        .bind(pass_no)
        .fetch_all(self.conn())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RankedOpportunity {
                    opportunity: mapping::opportunity_from_row(row)?,
                    active_count: row.try_get("cluster_active_count")?,
                })
            })
            .collect()
    }

    pub async fn insert_shortlist_entry(
        &mut self,
        run_id: Uuid,
        entry: &ShortlistEntry,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO shortlist_entries (run_id, pass_no, opportunity_id, rank, rule, threshold)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(entry.pass_no)
        .bind(entry.opportunity_id.to_string())
        .bind(entry.rank)
        .bind(entry.rule.as_str())
        .bind(entry.threshold)
        .execute(self.conn())
        .await?;
        Ok(())
    }

    pub async fn record_ingested_file(
        &mut self,
        content_hash: &str,
        kind: &str,
        path: &str,
        pass_no: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO ingested_files (content_hash, kind, path, pass_no, ingested_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(content_hash)
        .bind(kind)
        .bind(path)
        .bind(pass_no)
        .bind(Utc::now())
        .execute(self.conn())
        .await?;
        Ok(())
    }
}

mod queries {
    use super::*;

    pub async fn pain_events(conn: &mut SqliteConnection) -> StoreResult<Vec<PainEvent>> {
        let rows = sqlx::query("SELECT * FROM pain_events ORDER BY created_at, id")
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(mapping::pain_event_from_row).collect()
    }

    pub async fn clusters(conn: &mut SqliteConnection) -> StoreResult<Vec<Cluster>> {
        let rows = sqlx::query("SELECT * FROM clusters ORDER BY created_at, id")
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(mapping::cluster_from_row).collect()
    }

    pub async fn posts(conn: &mut SqliteConnection) -> StoreResult<Vec<StoredPost>> {
        let rows = sqlx::query("SELECT * FROM posts ORDER BY created_at, id")
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(StoredPost {
                    post: mapping::post_from_row(row)?,
                    ingested_at: row.try_get("ingested_at")?,
                })
            })
            .collect()
    }

    pub async fn retention_rate(conn: &mut SqliteConnection) -> StoreResult<RetentionRate> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(CASE WHEN lifecycle_stage = 'active' THEN 1 ELSE 0 END), 0) AS active,
                   COUNT(*) AS total
              FROM pain_events
            "#,
        )
        .fetch_one(&mut *conn)
        .await?;
        Ok(RetentionRate {
            active: row.try_get("active")?,
            total: row.try_get("total")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use pof_core::{
        ClusterStatus, DescriptorProfile, Frequency, Recommendation, ReasonCode,
        RecommendationOutcome,
    };

    fn event(key: &str, stage: LifecycleStage) -> PainEvent {
        let now = Utc::now();
        PainEvent {
            id: Uuid::new_v4(),
            event_key: key.to_string(),
            post_id: format!("post-{key}"),
            community: "r/smallbusiness".into(),
            problem: format!("problem {key}"),
            workaround: Some("spreadsheet".into()),
            frequency: Frequency::Weekly,
            sentiment: BTreeSet::from(["frustrated".to_string()]),
            embedding: Some(vec![0.25, 0.5, 0.75]),
            lifecycle_stage: stage,
            cluster_id: None,
            needs_recluster: false,
            last_seen_pass: 1,
            created_at: now,
            last_seen_at: now,
        }
    }

    fn cluster() -> Cluster {
        let now = Utc::now();
        Cluster {
            id: Uuid::new_v4(),
            description: "invoices are painful".into(),
            centroid: vec![0.1, 0.2, 0.3],
            member_count: 1,
            active_count: 1,
            status: ClusterStatus::Active,
            profile: DescriptorProfile::default(),
            last_reinforced_pass: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn retention_rate_counts_active_over_all() {
        let store = EventStore::open_in_memory().await.expect("store");
        let mut tx = store.begin().await.expect("begin");
        for i in 0..10 {
            let stage = if i < 7 { LifecycleStage::Active } else { LifecycleStage::Orphan };
            tx.insert_pain_event(&event(&format!("k{i}"), stage)).await.expect("insert");
        }
        tx.commit().await.expect("commit");

        let rate = store.retention_rate().await.expect("rate");
        assert_eq!(rate, RetentionRate { active: 7, total: 10 });
        assert_eq!(rate.percent(), 70.0);
        assert_eq!(store.count_events_in_stage(LifecycleStage::Orphan).await.expect("count"), 3);
        let orphans = store.pain_events_in_stage(LifecycleStage::Orphan).await.expect("load");
        assert_eq!(orphans.len(), 3);
        assert_eq!(store.count(Table::PainEvents).await.expect("count"), 10);
    }

    #[tokio::test]
    async fn file_store_keeps_events_across_connections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("pof.db").display());

        let store = EventStore::connect(&url).await.expect("connect");
        let mut tx = store.begin().await.expect("begin");
        tx.insert_pain_event(&event("kept", LifecycleStage::Active)).await.expect("insert");
        tx.commit().await.expect("commit");
        store.close().await;

        let reopened = EventStore::connect(&url).await.expect("reconnect");
        let events = reopened.pain_events().await.expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_key, "kept");
        reopened.close().await;
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = EventStore::open_in_memory().await.expect("store");
        {
            let mut tx = store.begin().await.expect("begin");
            tx.insert_pain_event(&event("gone", LifecycleStage::Active)).await.expect("insert");
        }
        assert_eq!(store.count(Table::PainEvents).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn event_rows_round_trip_with_cluster_reference() {
        let store = EventStore::open_in_memory().await.expect("store");
        let c = cluster();
        let mut e = event("a", LifecycleStage::Active);
        e.cluster_id = Some(c.id);

        let mut tx = store.begin().await.expect("begin");
        tx.upsert_cluster(&c).await.expect("cluster");
        tx.insert_pain_event(&e).await.expect("event");
        tx.commit().await.expect("commit");

        let loaded = store.pain_events().await.expect("events");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].cluster_id, Some(c.id));
        assert_eq!(loaded[0].embedding, e.embedding);
        assert_eq!(loaded[0].sentiment, e.sentiment);
        assert_eq!(store.clusters().await.expect("clusters")[0].centroid, c.centroid);
    }

    #[tokio::test]
    async fn opportunities_are_selected_by_score_descending() {
        let store = EventStore::open_in_memory().await.expect("store");
        let mut tx = store.begin().await.expect("begin");
        for score in [4.0, 12.5, 9.0] {
            let c = cluster();
            tx.upsert_cluster(&c).await.expect("cluster");
            let now = Utc::now();
            tx.upsert_opportunity(&Opportunity {
                id: Opportunity::id_for_cluster(c.id),
                cluster_id: c.id,
                name: format!("opp {score}"),
                description: String::new(),
                total_score: score,
                breakdown: Default::default(),
                recommendation: Some(Recommendation {
                    outcome: RecommendationOutcome::Research,
                    reason: ReasonCode::ScoreBelowThreshold,
                    threshold: 10.0,
                    observed: score,
                }),
                scored_pass: 1,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("opportunity");
        }
        tx.commit().await.expect("commit");

        let above = store.opportunities_above(5.0).await.expect("query");
        let scores: Vec<f64> = above.iter().map(|o| o.total_score).collect();
        assert_eq!(scores, vec![12.5, 9.0]);
        assert_eq!(
            above[0].recommendation.map(|r| r.reason),
            Some(ReasonCode::ScoreBelowThreshold)
        );
    }

    #[tokio::test]
    async fn pass_numbers_advance_only_on_success() {
        let store = EventStore::open_in_memory().await.expect("store");
        assert_eq!(store.next_pass_no().await.expect("pass"), 1);

        let failed = Uuid::new_v4();
        store
            .start_run(failed, 1, ProcessingMode::Incremental, "all", Utc::now())
            .await
            .expect("start");
        store.finish_run(failed, RunStatus::Failed, Some("boom")).await.expect("finish");
        assert_eq!(store.next_pass_no().await.expect("pass"), 1);
        assert!(store.last_successful_run().await.expect("last").is_none());

        let ok = Uuid::new_v4();
        store
            .start_run(ok, 1, ProcessingMode::Incremental, "all", Utc::now())
            .await
            .expect("start");
        store.finish_run(ok, RunStatus::Succeeded, None).await.expect("finish");
        assert_eq!(store.next_pass_no().await.expect("pass"), 2);
        assert_eq!(
            store.last_successful_run().await.expect("last").map(|r| r.run_id),
            Some(ok)
        );
    }
}
