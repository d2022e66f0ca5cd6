//! Run summaries, per-stage metrics, and Parquet snapshots written under `reports/`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use pof_core::{Cluster, Opportunity, ProcessingMode};
use pof_storage::{sha256_hex, RunStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::ClusterReport;
use crate::ingest::{ExtractReport, FetchReport, FilterReport};
use crate::lifecycle::LifecycleReport;
use crate::scoring::ScoringReport;
use crate::shortlist::ShortlistReport;
use crate::stage::Stage;

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub pass_no: i64,
    pub mode: ProcessingMode,
    pub stages: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_committed_stage: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The cluster stage runs assignment and then the lifecycle pass; both land under one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStageReport {
    #[serde(flatten)]
    pub assignment: ClusterReport,
    #[serde(flatten)]
    pub lifecycle: LifecycleReport,
}

/// Counters for every stage that committed. Stages that did not run stay absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract: Option<ExtractReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterStageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoringReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortlist: Option<ShortlistReport>,
}

impl RunSummary {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Counters of one stage as a JSON object, if it committed.
    pub fn stage_counters(&self, stage: Stage) -> Option<serde_json::Value> {
        let value = match stage {
            Stage::Fetch => serde_json::to_value(self.fetch.as_ref()?),
            Stage::Filter => serde_json::to_value(self.filter.as_ref()?),
            Stage::Extract => serde_json::to_value(self.extract.as_ref()?),
            Stage::Cluster => serde_json::to_value(self.cluster.as_ref()?),
            Stage::Score => serde_json::to_value(self.score.as_ref()?),
            Stage::Shortlist => serde_json::to_value(self.shortlist.as_ref()?),
        };
        value.ok()
    }
}

pub fn write_run_summary(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_id = summary
        .run
        .as_ref()
        .map(|r| r.run_id)
        .context("run summary has no run metadata")?;
    let dir = reports_root.join(run_id.to_string());
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(SUMMARY_FILE);
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetrics {
    pub run_id: Uuid,
    pub pass_no: i64,
    pub stage: Stage,
    pub status: String,
    pub duration_ms: u64,
    pub attempts: usize,
    #[serde(default)]
    pub counters: serde_json::Value,
    #[serde(default)]
    pub retention_rate: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Append one metrics record as a JSON line.
pub fn append_metrics(reports_root: &Path, metrics: &StageMetrics) -> Result<()> {
    std::fs::create_dir_all(reports_root)
        .with_context(|| format!("creating {}", reports_root.display()))?;
    let path = reports_root.join(METRICS_FILE);
    let mut line = serde_json::to_string(metrics).context("serializing stage metrics")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("appending to {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Write cluster and opportunity snapshots plus a manifest; returns the manifest path.
pub fn export_snapshots(
    reports_root: &Path,
    run_id: Uuid,
    clusters: &[Cluster],
    opportunities: &[Opportunity],
) -> Result<PathBuf> {
    let run_dir = reports_root.join(run_id.to_string());
    let snapshot_dir = run_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let clusters_path = snapshot_dir.join("clusters.parquet");
    let opportunities_path = snapshot_dir.join("opportunities.parquet");
    write_clusters_parquet(&clusters_path, clusters)?;
    write_opportunities_parquet(&opportunities_path, opportunities)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id,
        files: vec![
            manifest_entry("clusters", &run_dir, &clusters_path, clusters.len())?,
            manifest_entry("opportunities", &run_dir, &opportunities_path, opportunities.len())?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_clusters_parquet(path: &Path, clusters: &[Cluster]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("cluster_id", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("member_count", DataType::Int64, false),
        ArrowField::new("active_count", DataType::Int64, false),
        ArrowField::new("last_reinforced_pass", DataType::Int64, false),
        ArrowField::new("updated_at", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(
        clusters
            .iter()
            .map(|c| Some(c.id.to_string()))
            .collect::<Vec<_>>(),
    );
    let descriptions = StringArray::from(
        clusters
            .iter()
            .map(|c| Some(c.description.as_str()))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        clusters
            .iter()
            .map(|c| Some(c.status.as_str()))
            .collect::<Vec<_>>(),
    );
    let members = Int64Array::from(clusters.iter().map(|c| c.member_count).collect::<Vec<_>>());
    let active = Int64Array::from(clusters.iter().map(|c| c.active_count).collect::<Vec<_>>());
    let reinforced = Int64Array::from(
        clusters
            .iter()
            .map(|c| c.last_reinforced_pass)
            .collect::<Vec<_>>(),
    );
    let updated = StringArray::from(
        clusters
            .iter()
            .map(|c| Some(c.updated_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(descriptions),
            Arc::new(statuses),
            Arc::new(members),
            Arc::new(active),
            Arc::new(reinforced),
            Arc::new(updated),
        ],
    )
    .context("building clusters record batch")?;
    write_parquet(path, batch)
}

fn write_opportunities_parquet(path: &Path, opportunities: &[Opportunity]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("opportunity_id", DataType::Utf8, false),
        ArrowField::new("cluster_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("total_score", DataType::Float64, false),
        ArrowField::new("recommendation", DataType::Utf8, true),
        ArrowField::new("reason", DataType::Utf8, true),
        ArrowField::new("scored_pass", DataType::Int64, false),
        ArrowField::new("breakdown", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(
        opportunities
            .iter()
            .map(|o| Some(o.id.to_string()))
            .collect::<Vec<_>>(),
    );
    let cluster_ids = StringArray::from(
        opportunities
            .iter()
            .map(|o| Some(o.cluster_id.to_string()))
            .collect::<Vec<_>>(),
    );
    let names = StringArray::from(
        opportunities
            .iter()
            .map(|o| Some(o.name.as_str()))
            .collect::<Vec<_>>(),
    );
    let scores = Float64Array::from(
        opportunities
            .iter()
            .map(|o| o.total_score)
            .collect::<Vec<_>>(),
    );
    let outcomes = StringArray::from(
        opportunities
            .iter()
            .map(|o| o.recommendation.map(|r| r.outcome.as_str()))
            .collect::<Vec<_>>(),
    );
    let reasons = StringArray::from(
        opportunities
            .iter()
            .map(|o| o.recommendation.map(|r| r.reason.as_str()))
            .collect::<Vec<_>>(),
    );
    let passes = Int64Array::from(opportunities.iter().map(|o| o.scored_pass).collect::<Vec<_>>());
    let breakdowns = opportunities
        .iter()
        .map(|o| serde_json::to_string(&o.breakdown).map(Some))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("serializing score breakdowns")?;
    let breakdowns = StringArray::from(breakdowns);

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(cluster_ids),
            Arc::new(names),
            Arc::new(scores),
            Arc::new(outcomes),
            Arc::new(reasons),
            Arc::new(passes),
            Arc::new(breakdowns),
        ],
    )
    .context("building opportunities record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(
    name: &str,
    run_dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::cluster;
    use tempfile::tempdir;

    fn info() -> RunInfo {
        RunInfo {
            run_id: Uuid::new_v4(),
            pass_no: 3,
            mode: ProcessingMode::Incremental,
            stages: "all".into(),
            status: RunStatus::Succeeded,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            last_committed_stage: Some("shortlist".into()),
            error: None,
        }
    }

    #[test]
    fn stages_that_did_not_run_are_absent() {
        let dir = tempdir().expect("tempdir");
        let summary = RunSummary {
            run: Some(info()),
            fetch: Some(FetchReport {
                total_saved: 4,
                ..Default::default()
            }),
            cluster: Some(ClusterStageReport {
                assignment: ClusterReport {
                    clusters_created: 2,
                    ..Default::default()
                },
                lifecycle: LifecycleReport {
                    retention_rate: 75.0,
                    ..Default::default()
                },
            }),
            ..Default::default()
        };
        let path = write_run_summary(dir.path(), &summary).expect("write");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["fetch"]["total_saved"], 4);
        assert_eq!(raw["cluster"]["clusters_created"], 2);
        assert_eq!(raw["cluster"]["retention_rate"], 75.0);
        assert!(raw.get("score").is_none());
        assert!(raw.get("shortlist").is_none());

        assert_eq!(RunSummary::load(&path).expect("load"), summary);
    }

    #[test]
    fn readers_tolerate_partial_summaries() {
        let summary: RunSummary =
            serde_json::from_str(r#"{"filter": {"processed": 5}}"#).expect("parse");
        assert!(summary.run.is_none());
        assert_eq!(summary.filter.as_ref().expect("filter").processed, 5);
        assert!(summary.stage_counters(Stage::Score).is_none());
    }

    #[test]
    fn metrics_accumulate_as_json_lines() {
        let dir = tempdir().expect("tempdir");
        for stage in [Stage::Fetch, Stage::Cluster] {
            append_metrics(
                dir.path(),
                &StageMetrics {
                    run_id: Uuid::nil(),
                    pass_no: 1,
                    stage,
                    status: "committed".into(),
                    duration_ms: 12,
                    attempts: 1,
                    counters: serde_json::json!({"total_saved": 1}),
                    retention_rate: None,
                    recorded_at: Utc::now(),
                },
            )
            .expect("append");
        }
        let text = std::fs::read_to_string(dir.path().join(METRICS_FILE)).expect("read");
        let lines: Vec<StageMetrics> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].stage, Stage::Cluster);
    }

    #[test]
    fn snapshots_are_listed_with_checksums() {
        let dir = tempdir().expect("tempdir");
        let run_id = Uuid::new_v4();
        let clusters = vec![cluster(1, vec![1.0, 0.0], 2), cluster(2, vec![0.0, 1.0], 0)];
        let manifest_path = export_snapshots(dir.path(), run_id, &clusters, &[]).expect("export");

        let text = std::fs::read_to_string(&manifest_path).expect("read");
        let manifest: SnapshotManifest = serde_json::from_str(&text).expect("manifest");
        assert_eq!(manifest.run_id, run_id);
        assert_eq!(manifest.files.len(), 2);
        let clusters_file = &manifest.files[0];
        assert_eq!(clusters_file.rows, 2);
        assert_eq!(clusters_file.sha256.len(), 64);
        assert_eq!(clusters_file.path, "snapshots/clusters.parquet");
        let parquet_path = dir.path().join(run_id.to_string()).join(&clusters_file.path);
        let bytes = std::fs::read(parquet_path).expect("parquet");
        assert_eq!(sha256_hex(&bytes), clusters_file.sha256);
    }
}
