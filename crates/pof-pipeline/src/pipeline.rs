//! Runs the stages in order against one store, one committed stage at a time.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use pof_adapters::EmbeddingProvider;
use pof_core::{ProcessingMode, RunScope};
use pof_storage::{EventStore, RunStatus};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cluster::{ClusterEngine, ClusterLocks};
use crate::config::PipelineConfig;
use crate::ingest::{self, ExtractReport, Extractor, FetchReport, FilterReport, RelevanceFilter};
use crate::lifecycle::LifecycleTracker;
use crate::scoring::{OpportunityScorer, ScoringReport};
use crate::shortlist::{ShortlistDecision, ShortlistReport};
use crate::stage::{Stage, StageError, StageSelector};
use crate::summary::{self, ClusterStageReport, RunInfo, RunSummary, StageMetrics};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub stage: StageSelector,
    pub mode: ProcessingMode,
    pub save_results: bool,
    pub enable_monitoring: bool,
}

#[derive(Debug, Clone, Error)]
#[error("{stage} stage failed after {attempts} attempt(s): {message}")]
pub struct RunFailure {
    pub stage: Stage,
    pub message: String,
    pub attempts: usize,
    pub last_committed_stage: Option<Stage>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub pass_no: i64,
    pub status: RunStatus,
    pub summary: RunSummary,
    pub failure: Option<RunFailure>,
    pub summary_path: Option<PathBuf>,
    pub snapshot_manifest: Option<PathBuf>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

enum StageOutput {
    Fetch(FetchReport),
    Filter(FilterReport),
    Extract(ExtractReport),
    Cluster(ClusterStageReport),
    Score(ScoringReport),
    Shortlist(ShortlistReport),
}

impl StageOutput {
    fn record(self, summary: &mut RunSummary) {
        match self {
            StageOutput::Fetch(report) => summary.fetch = Some(report),
            StageOutput::Filter(report) => summary.filter = Some(report),
            StageOutput::Extract(report) => summary.extract = Some(report),
            StageOutput::Cluster(report) => summary.cluster = Some(report),
            StageOutput::Score(report) => summary.score = Some(report),
            StageOutput::Shortlist(report) => summary.shortlist = Some(report),
        }
    }
}

struct RunProgress {
    summary: RunSummary,
    last_committed: Option<Stage>,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: EventStore,
    provider: Arc<dyn EmbeddingProvider>,
    locks: Arc<ClusterLocks>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: EventStore,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            store,
            provider,
            locks: Arc::new(ClusterLocks::new()),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, options: RunOptions) -> Result<RunOutcome> {
        self.run_until(options, std::future::pending::<()>()).await
    }

    /// Run until the stages finish or `cancel` resolves. Cancelling drops the open
    /// transaction, so only stages that already committed stay applied.
    pub async fn run_until<F>(&self, options: RunOptions, cancel: F) -> Result<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        let pass_no = self.store.next_pass_no().await.context("reading next pass number")?;
        let last_success = self.store.last_successful_run().await.context("reading last run")?;
        let scope = RunScope::new(pass_no, options.mode, last_success.map(|run| run.started_at));
        let started_at = Utc::now();
        self.store
            .start_run(scope.run_id, pass_no, options.mode, options.stage.label(), started_at)
            .await
            .context("recording run start")?;

        let span = info_span!(
            "pipeline_run",
            run_id = %scope.run_id,
            pass_no,
            mode = %options.mode
        );
        info!(parent: &span, stages = options.stage.label(), "run started");

        let mut progress = RunProgress {
            summary: RunSummary::default(),
            last_committed: None,
        };
        tokio::pin!(cancel);
        let result = tokio::select! {
            biased;
            _ = &mut cancel => None,
            result = self
                .run_stages(&options, &scope, &mut progress)
                .instrument(span.clone()) => Some(result),
        };

        let (status, failure) = match result {
            Some(Ok(())) => (RunStatus::Succeeded, None),
            Some(Err(failure)) => (RunStatus::Failed, Some(failure)),
            None => {
                warn!(parent: &span, last_committed = ?progress.last_committed, "run cancelled");
                (RunStatus::Cancelled, None)
            }
        };
        let message = failure.as_ref().map(|f| f.to_string());
        self.store
            .finish_run(scope.run_id, status, message.as_deref())
            .await
            .context("recording run outcome")?;

        let mut summary = progress.summary;
        summary.run = Some(RunInfo {
            run_id: scope.run_id,
            pass_no,
            mode: options.mode,
            stages: options.stage.label().to_string(),
            status,
            started_at,
            finished_at: Some(Utc::now()),
            last_committed_stage: progress.last_committed.map(|s| s.as_str().to_string()),
            error: message,
        });

        let (mut summary_path, mut snapshot_manifest) = (None, None);
        if options.save_results {
            let reports_root = self.config.reports_root();
            summary_path = Some(summary::write_run_summary(&reports_root, &summary)?);
            let clusters = self.store.clusters().await.context("loading clusters for snapshot")?;
            let opportunities = self
                .store
                .opportunities()
                .await
                .context("loading opportunities for snapshot")?;
            snapshot_manifest = Some(summary::export_snapshots(
                &reports_root,
                scope.run_id,
                &clusters,
                &opportunities,
            )?);
        }

        info!(parent: &span, status = status.as_str(), "run finished");
        Ok(RunOutcome {
            run_id: scope.run_id,
            pass_no,
            status,
            summary,
            failure,
            summary_path,
            snapshot_manifest,
        })
    }

    async fn run_stages(
        &self,
        options: &RunOptions,
        scope: &RunScope,
        progress: &mut RunProgress,
    ) -> Result<(), RunFailure> {
        for stage in options.stage.stages() {
            let span = info_span!("stage", stage = %stage);
            let started = Instant::now();
            let (result, attempts) = self
                .run_with_retry(stage, scope)
                .instrument(span.clone())
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    error!(
                        parent: &span,
                        error = %err,
                        attempts,
                        last_committed = ?progress.last_committed,
                        "stage failed, skipping downstream stages"
                    );
                    if options.enable_monitoring {
                        self.record_metrics(
                            scope,
                            stage,
                            "failed",
                            duration_ms,
                            attempts,
                            &progress.summary,
                        );
                    }
                    return Err(RunFailure {
                        stage,
                        message: err.to_string(),
                        attempts,
                        last_committed_stage: progress.last_committed,
                    });
                }
            };

            output.record(&mut progress.summary);
            progress.last_committed = Some(stage);
            if let Err(err) = self.store.mark_stage_committed(scope.run_id, stage.as_str()).await {
                return Err(RunFailure {
                    stage,
                    message: format!("recording committed stage: {err}"),
                    attempts,
                    last_committed_stage: progress.last_committed,
                });
            }
            if options.enable_monitoring {
                self.record_metrics(
                    scope,
                    stage,
                    "committed",
                    duration_ms,
                    attempts,
                    &progress.summary,
                );
            }
        }
        Ok(())
    }

    async fn run_with_retry(
        &self,
        stage: Stage,
        scope: &RunScope,
    ) -> (Result<StageOutput, StageError>, usize) {
        let policy = self.config.stage_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_stage(stage, scope).await {
                Err(err) if err.is_retryable() && attempt <= policy.max_retries => {
                    let delay = policy.delay_for_attempt(attempt - 1);
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "stage dependency unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return (result, attempt),
            }
        }
    }

    async fn run_stage(&self, stage: Stage, scope: &RunScope) -> Result<StageOutput, StageError> {
        let store = &self.store;
        Ok(match stage {
            Stage::Fetch => {
                let inbox = self.config.posts_inbox();
                StageOutput::Fetch(ingest::fetch_posts(store, scope, &inbox).await?)
            }
            Stage::Filter => {
                let path = self.config.resolve(&self.config.relevance_rules);
                let rules = RelevanceFilter::from_path(&path)?;
                StageOutput::Filter(ingest::filter_posts(store, scope, &rules).await?)
            }
            Stage::Extract => {
                let extractor = Extractor {
                    config: &self.config.extract,
                    locks: &self.locks,
                };
                let inbox = self.config.extractions_inbox();
                StageOutput::Extract(extractor.run(store, scope, &inbox).await?)
            }
            Stage::Cluster => {
                let engine = ClusterEngine::new(
                    self.config.cluster.clone(),
                    self.provider.clone(),
                    self.locks.clone(),
                );
                let assignment = engine.run(store, scope).await?;
                let lifecycle = LifecycleTracker::new(self.config.lifecycle.clone())
                    .run(store, scope)
                    .await?;
                StageOutput::Cluster(ClusterStageReport { assignment, lifecycle })
            }
            Stage::Score => {
                let scorer = OpportunityScorer::new(self.config.scoring.clone());
                StageOutput::Score(scorer.run(store, scope).await?)
            }
            Stage::Shortlist => {
                let decision = ShortlistDecision::new(self.config.shortlist.clone());
                StageOutput::Shortlist(decision.run(store, scope).await?)
            }
        })
    }

    fn record_metrics(
        &self,
        scope: &RunScope,
        stage: Stage,
        status: &str,
        duration_ms: u64,
        attempts: usize,
        summary: &RunSummary,
    ) {
        let counters = summary.stage_counters(stage).unwrap_or(serde_json::Value::Null);
        let retention_rate = match stage {
            Stage::Cluster => summary.cluster.as_ref().map(|c| c.lifecycle.retention_rate),
            _ => None,
        };
        info!(stage = %stage, status, duration_ms, attempts, counters = %counters, "stage metrics");
        let metrics = StageMetrics {
            run_id: scope.run_id,
            pass_no: scope.pass_no,
            stage,
            status: status.to_string(),
            duration_ms,
            attempts,
            counters,
            retention_rate,
            recorded_at: Utc::now(),
        };
        if let Err(err) = summary::append_metrics(&self.config.reports_root(), &metrics) {
            warn!(error = %format!("{err:#}"), "could not append stage metrics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pof_adapters::{BackoffPolicy, FixtureEmbeddingProvider};
    use std::fs;
    use tempfile::tempdir;

    fn config_in(root: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            workspace_root: root.to_path_buf(),
            stage_backoff: BackoffPolicy::none(),
            ..PipelineConfig::default()
        }
    }

    fn write_extractions(root: &std::path::Path, name: &str, body: &str) {
        let dir = root.join("inbox").join("extractions");
        fs::create_dir_all(&dir).expect("inbox");
        fs::write(dir.join(name), body).expect("write");
    }

    #[tokio::test]
    async fn outage_fails_the_stage_and_skips_everything_downstream() {
        let root = tempdir().expect("tempdir");
        write_extractions(
            root.path(),
            "a.json",
            r#"{"pain_events": [{"post_id": "p1", "problem": "Receipts pile up every week"}]}"#,
        );
        let store = EventStore::open_in_memory().await.expect("store");
        let pipeline = Pipeline::new(
            config_in(root.path()),
            store.clone(),
            Arc::new(FixtureEmbeddingProvider::unavailable()),
        );

        let outcome = pipeline
            .run(RunOptions {
                save_results: true,
                ..RunOptions::default()
            })
            .await
            .expect("run");
        assert_eq!(outcome.status, RunStatus::Failed);
        let failure = outcome.failure.as_ref().expect("failure");
        assert_eq!(failure.stage, Stage::Cluster);
        assert_eq!(failure.last_committed_stage, Some(Stage::Extract));

        assert!(outcome.summary.extract.is_some());
        assert!(outcome.summary.cluster.is_none());
        assert!(outcome.summary.score.is_none());
        let path = outcome.summary_path.as_deref().expect("summary path");
        let written = RunSummary::load(path).expect("load");
        assert!(written.shortlist.is_none());
        assert_eq!(written.extract.expect("extract").pain_events_saved, 1);

        let record = store.run(outcome.run_id).await.expect("record").expect("exists");
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.last_committed_stage.as_deref(), Some("extract"));
        assert_eq!(store.next_pass_no().await.expect("pass"), 1);
    }

    #[tokio::test]
    async fn cancelled_runs_keep_their_pass_number() {
        let root = tempdir().expect("tempdir");
        let store = EventStore::open_in_memory().await.expect("store");
        let pipeline = Pipeline::new(
            config_in(root.path()),
            store.clone(),
            Arc::new(FixtureEmbeddingProvider::new()),
        );

        let outcome = pipeline
            .run_until(RunOptions::default(), std::future::ready(()))
            .await
            .expect("run");
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(outcome.failure.is_none());
        assert_eq!(store.next_pass_no().await.expect("pass"), 1);

        let outcome = pipeline.run(RunOptions::default()).await.expect("rerun");
        assert!(outcome.succeeded());
        assert_eq!(outcome.pass_no, 1);
        assert_eq!(store.next_pass_no().await.expect("pass"), 2);
    }

    #[tokio::test]
    async fn monitoring_appends_one_line_per_stage() {
        let root = tempdir().expect("tempdir");
        let store = EventStore::open_in_memory().await.expect("store");
        let pipeline = Pipeline::new(
            config_in(root.path()),
            store,
            Arc::new(FixtureEmbeddingProvider::new()),
        );

        let outcome = pipeline
            .run(RunOptions {
                enable_monitoring: true,
                ..RunOptions::default()
            })
            .await
            .expect("run");
        assert!(outcome.succeeded());
        assert!(outcome.summary_path.is_none());

        let metrics_path = root.path().join("reports").join(summary::METRICS_FILE);
        let metrics = fs::read_to_string(metrics_path).expect("metrics");
        assert_eq!(metrics.lines().count(), Stage::ALL.len());
    }

    #[tokio::test]
    async fn single_stage_runs_leave_other_keys_out() {
        let root = tempdir().expect("tempdir");
        let store = EventStore::open_in_memory().await.expect("store");
        let pipeline = Pipeline::new(
            config_in(root.path()),
            store,
            Arc::new(FixtureEmbeddingProvider::new()),
        );

        let outcome = pipeline
            .run(RunOptions {
                stage: StageSelector::Only(Stage::Score),
                ..RunOptions::default()
            })
            .await
            .expect("run");
        assert!(outcome.succeeded());
        assert!(outcome.summary.score.is_some());
        assert!(outcome.summary.fetch.is_none());
        assert_eq!(outcome.summary.run.as_ref().expect("run").stages, "score");
    }
}
