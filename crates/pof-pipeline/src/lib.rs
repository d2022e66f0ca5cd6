//! The POF batch pipeline: ingestion, clustering, lifecycle tracking, scoring and the shortlist.

pub mod cluster;
pub mod config;
pub mod ingest;
pub mod lifecycle;
pub mod pipeline;
pub mod scoring;
pub mod shortlist;
pub mod stage;
pub mod summary;
pub mod vector;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use pof_adapters::provider_from_settings;
use pof_core::LifecycleStage;
use pof_storage::{EventStore, Table};

pub use cluster::{ClusterEngine, ClusterLocks, ClusterReport};
pub use config::PipelineConfig;
pub use ingest::{ExtractReport, FetchReport, FilterReport, RelevanceFilter};
pub use lifecycle::{LifecycleReport, LifecycleTracker};
pub use pipeline::{Pipeline, RunFailure, RunOptions, RunOutcome};
pub use scoring::{OpportunityScorer, ScoringReport};
pub use shortlist::{ShortlistDecision, ShortlistReport};
pub use stage::{Stage, StageError, StageSelector};
pub use summary::{ClusterStageReport, RunInfo, RunSummary};

pub const CRATE_NAME: &str = "pof-pipeline";

/// Open the configured store and embedding provider and wire them into a pipeline.
pub async fn connect_pipeline(config: PipelineConfig) -> Result<Pipeline> {
    let store = EventStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening event store at {}", config.database_url))?;
    let provider = provider_from_settings(&config.embedding)?;
    Ok(Pipeline::new(config, store, provider))
}

pub async fn run_pipeline_from_env(options: RunOptions) -> Result<RunOutcome> {
    let config = PipelineConfig::from_env()?;
    let pipeline = connect_pipeline(config).await?;
    pipeline.run(options).await
}

/// Markdown overview of the store: table counts, lifecycle split, retention and the best
/// opportunities.
pub async fn stats_markdown(store: &EventStore, min_score: f64) -> Result<String> {
    let mut lines = vec!["# POF Stats".to_string(), String::new(), "## Tables".to_string()];
    for table in Table::ALL {
        let count = store.count(table).await.with_context(|| format!("counting {}", table.name()))?;
        lines.push(format!("- {}: {count}", table.name()));
    }

    let active = store.count_events_in_stage(LifecycleStage::Active).await?;
    let orphan = store.count_events_in_stage(LifecycleStage::Orphan).await?;
    let retention = store.retention_rate().await?;
    lines.push(String::new());
    lines.push("## Lifecycle".to_string());
    lines.push(format!("- active: {active}"));
    lines.push(format!("- orphan: {orphan}"));
    lines.push(format!("- retention rate: {:.1}%", retention.percent()));

    lines.push(String::new());
    lines.push(format!("## Opportunities scoring at least {min_score}"));
    let opportunities = store.opportunities_above(min_score).await?;
    if opportunities.is_empty() {
        lines.push("- none".to_string());
    }
    for opportunity in opportunities {
        let verdict = opportunity
            .recommendation
            .map(|r| r.to_string())
            .unwrap_or_else(|| "undecided".to_string());
        lines.push(format!(
            "- {:.2} `{}` {} ({verdict})",
            opportunity.total_score, opportunity.id, opportunity.name
        ));
    }

    if let Some(run) = store.last_successful_run().await? {
        lines.push(String::new());
        lines.push(format!(
            "Last successful run: pass {} ({}), started {}",
            run.pass_no, run.mode, run.started_at
        ));
    }
    Ok(lines.join("\n"))
}
