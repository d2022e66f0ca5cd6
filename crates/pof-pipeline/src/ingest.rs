//! Ingestion stages: fetcher posts, relevance filtering, and extracted pain events.
//!
//! Both inboxes are content-addressed: a file whose sha256 is already in the ledger is
//! skipped, so re-running a stage never double-counts. Each file is its own transaction.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use pof_adapters::{
    list_inbox, load_inbox_file, ExtractedPainEvent, ExtractionBundle, InboxFile, PostBundle,
};
use pof_core::{
    normalize_text, ClusterStatus, LifecycleStage, PainEvent, Post, RunScope, ID_NAMESPACE,
};
use pof_storage::{sha256_hex, EventStore, StoreTx};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterLocks;
use crate::config::ExtractConfig;
use crate::stage::StageError;
use crate::vector::remove_from_mean;

const UNKNOWN_COMMUNITY: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchReport {
    pub files_ingested: usize,
    pub files_skipped: usize,
    pub files_rejected: usize,
    pub total_saved: usize,
    pub duplicates: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterReport {
    pub processed: usize,
    pub filtered: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractReport {
    pub files_ingested: usize,
    pub files_skipped: usize,
    pub files_rejected: usize,
    pub pain_events_saved: usize,
    pub reseen: usize,
    pub reextracted: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct RelevanceRulesFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    min_chars: usize,
    #[serde(default)]
    rules: Vec<RelevanceRule>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelevanceRule {
    pub rule: String,
    pub contains_any: Vec<String>,
}

/// Keyword rules deciding which posts are worth extracting from.
#[derive(Debug, Clone, Default)]
pub struct RelevanceFilter {
    min_chars: usize,
    rules: Vec<RelevanceRule>,
}

impl RelevanceFilter {
    pub const MATCH_ANY: &'static str = "any";

    /// A missing rules file lets every non-empty post through.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(
                path = %path.display(),
                "no relevance rules found, accepting every non-empty post"
            );
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: RelevanceRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let rules = file
            .rules
            .into_iter()
            .map(|rule| RelevanceRule {
                contains_any: rule.contains_any.iter().map(|n| n.to_lowercase()).collect(),
                rule: rule.rule,
            })
            .collect();
        Ok(Self {
            min_chars: file.min_chars,
            rules,
        })
    }

    /// Name of the first matching rule, or `None` when the post is irrelevant.
    pub fn evaluate(&self, post: &Post) -> Option<String> {
        let text = post.text();
        if text.is_empty() || text.chars().count() < self.min_chars {
            return None;
        }
        if self.rules.is_empty() {
            return Some(Self::MATCH_ANY.to_string());
        }
        let lowered = text.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.contains_any.iter().any(|needle| lowered.contains(needle.as_str())))
            .map(|rule| rule.rule.clone())
    }
}

pub async fn fetch_posts(
    store: &EventStore,
    scope: &RunScope,
    inbox: &Path,
) -> Result<FetchReport, StageError> {
    let mut report = FetchReport::default();
    for path in list_inbox(inbox)? {
        let file: InboxFile<PostBundle> = match load_inbox_file(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "rejecting unreadable post bundle"
                );
                report.files_rejected += 1;
                continue;
            }
        };
        if store.is_file_ingested(&file.content_hash).await? {
            debug!(path = %path.display(), "post bundle already ingested");
            report.files_skipped += 1;
            continue;
        }

        let now = Utc::now();
        let (mut saved, mut duplicates, mut malformed) = (0, 0, 0);
        let mut tx = store.begin().await?;
        for post in &file.payload.posts {
            if post.id.trim().is_empty() || post.community.trim().is_empty() {
                warn!(
                    path = %path.display(),
                    post_id = %post.id,
                    "skipping post without id or community"
                );
                malformed += 1;
                continue;
            }
            if tx.insert_post(post, now).await? {
                saved += 1;
            } else {
                duplicates += 1;
            }
        }
        let source = path.display().to_string();
        tx.record_ingested_file(&file.content_hash, "posts", &source, scope.pass_no)
            .await?;
        tx.commit().await?;

        report.files_ingested += 1;
        report.total_saved += saved;
        report.duplicates += duplicates;
        report.malformed += malformed;
    }
    info!(saved = report.total_saved, files = report.files_ingested, "fetch committed");
    Ok(report)
}

pub async fn filter_posts(
    store: &EventStore,
    scope: &RunScope,
    rules: &RelevanceFilter,
) -> Result<FilterReport, StageError> {
    let mut report = FilterReport::default();
    let posts = store.posts().await?;
    let mut tx = store.begin().await?;
    for stored in posts.iter().filter(|p| scope.includes(p.ingested_at)) {
        report.processed += 1;
        if let Some(rule) = rules.evaluate(&stored.post) {
            tx.upsert_filtered_post(&stored.post.id, &rule).await?;
            report.filtered += 1;
        }
    }
    tx.commit().await?;
    info!(processed = report.processed, filtered = report.filtered, "filter committed");
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractOutcome {
    Saved,
    Reseen,
    Reextracted,
    Repeated,
    Malformed,
}

/// Pulls extracted pain events into the store, matching them against what is already known.
pub struct Extractor<'a> {
    pub config: &'a ExtractConfig,
    pub locks: &'a ClusterLocks,
}

impl Extractor<'_> {
    pub async fn run(
        &self,
        store: &EventStore,
        scope: &RunScope,
        inbox: &Path,
    ) -> Result<ExtractReport, StageError> {
        let mut report = ExtractReport::default();
        for path in list_inbox(inbox)? {
            let file: InboxFile<ExtractionBundle> = match load_inbox_file(&path) {
                Ok(file) => file,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %format!("{err:#}"),
                        "rejecting unreadable extraction bundle"
                    );
                    report.files_rejected += 1;
                    continue;
                }
            };
            if store.is_file_ingested(&file.content_hash).await? {
                debug!(path = %path.display(), "extraction bundle already ingested");
                report.files_skipped += 1;
                continue;
            }

            let now = Utc::now();
            let mut file_report = ExtractReport::default();
            let mut tx = store.begin().await?;
            for extracted in &file.payload.pain_events {
                match self.apply(&mut tx, scope, extracted, now).await? {
                    ExtractOutcome::Saved => file_report.pain_events_saved += 1,
                    ExtractOutcome::Reseen => file_report.reseen += 1,
                    ExtractOutcome::Reextracted => file_report.reextracted += 1,
                    ExtractOutcome::Repeated => {}
                    ExtractOutcome::Malformed => {
                        warn!(
                            path = %path.display(),
                            post_id = %extracted.post_id,
                            "skipping malformed pain event"
                        );
                        file_report.malformed += 1;
                    }
                }
            }
            let source = path.display().to_string();
            tx.record_ingested_file(&file.content_hash, "extractions", &source, scope.pass_no)
                .await?;
            tx.commit().await?;

            report.files_ingested += 1;
            report.pain_events_saved += file_report.pain_events_saved;
            report.reseen += file_report.reseen;
            report.reextracted += file_report.reextracted;
            report.malformed += file_report.malformed;
        }
        info!(
            saved = report.pain_events_saved,
            reseen = report.reseen,
            reextracted = report.reextracted,
            malformed = report.malformed,
            "extraction committed"
        );
        Ok(report)
    }

    async fn apply(
        &self,
        tx: &mut StoreTx,
        scope: &RunScope,
        extracted: &ExtractedPainEvent,
        now: DateTime<Utc>,
    ) -> Result<ExtractOutcome, StageError> {
        let problem = extracted.problem.trim();
        if problem.is_empty() || extracted.post_id.trim().is_empty() {
            return Ok(ExtractOutcome::Malformed);
        }
        let normalized = normalize_text(problem);
        let key = event_key(&extracted.post_id, &normalized);
        let embedding = extracted
            .embedding
            .clone()
            .filter(|v| !v.is_empty() && v.iter().all(|x| x.is_finite()));

        if let Some(mut existing) = tx.pain_event_by_key(&key).await? {
            if existing.last_seen_pass >= scope.pass_no {
                return Ok(ExtractOutcome::Repeated);
            }
            existing.last_seen_pass = scope.pass_no;
            existing.last_seen_at = now;
            tx.update_pain_event(&existing).await?;
            return Ok(ExtractOutcome::Reseen);
        }

        let closest = tx
            .pain_events_for_post(&extracted.post_id)
            .await?
            .into_iter()
            .map(|sibling| {
                let similarity = jaro_winkler(&normalized, &sibling.normalized_text());
                (sibling, similarity)
            })
            .filter(|(_, similarity)| *similarity >= self.config.reextraction_similarity)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((mut sibling, similarity)) = closest {
            self.detach(tx, &mut sibling, now).await?;
            debug!(event_id = %sibling.id, similarity, "re-extraction replaces earlier wording");
            sibling.event_key = key;
            sibling.problem = problem.to_string();
            sibling.workaround = extracted.workaround.clone();
            sibling.frequency = extracted.frequency();
            sibling.sentiment = extracted.sentiment_tags();
            sibling.embedding = embedding;
            sibling.needs_recluster = true;
            sibling.last_seen_pass = scope.pass_no;
            sibling.last_seen_at = now;
            tx.update_pain_event(&sibling).await?;
            return Ok(ExtractOutcome::Reextracted);
        }

        let community = match extracted.community.as_deref().map(str::trim) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => tx
                .post_community(&extracted.post_id)
                .await?
                .unwrap_or_else(|| UNKNOWN_COMMUNITY.to_string()),
        };
        tx.insert_pain_event(&PainEvent {
            id: Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()),
            event_key: key,
            post_id: extracted.post_id.clone(),
            community,
            problem: problem.to_string(),
            workaround: extracted.workaround.clone(),
            frequency: extracted.frequency(),
            sentiment: extracted.sentiment_tags(),
            embedding,
            lifecycle_stage: LifecycleStage::Active,
            cluster_id: None,
            needs_recluster: false,
            last_seen_pass: scope.pass_no,
            created_at: now,
            last_seen_at: now,
        })
        .await?;
        Ok(ExtractOutcome::Saved)
    }

    /// Take a re-extracted event out of its cluster so the engine places it afresh.
    async fn detach(
        &self,
        tx: &mut StoreTx,
        event: &mut PainEvent,
        now: DateTime<Utc>,
    ) -> Result<(), StageError> {
        let Some(cluster_id) = event.cluster_id.take() else {
            return Ok(());
        };
        let _guard = self.locks.acquire(cluster_id).await;
        let Some(mut cluster) = tx.clusters().await?.into_iter().find(|c| c.id == cluster_id) else {
            return Ok(());
        };
        if event.is_active() {
            if let Some(vector) = event.embedding.as_deref() {
                remove_from_mean(&mut cluster.centroid, cluster.active_count, vector);
            }
            cluster.active_count = (cluster.active_count - 1).max(0);
            cluster.profile.remove(event);
        }
        cluster.member_count = (cluster.member_count - 1).max(0);
        if cluster.active_count == 0 {
            cluster.status = ClusterStatus::Dormant;
        }
        cluster.updated_at = now;
        tx.upsert_cluster(&cluster).await?;
        Ok(())
    }
}

/// Stable identity of one complaint: its post plus the normalized wording.
pub fn event_key(post_id: &str, normalized_problem: &str) -> String {
    sha256_hex(format!("{post_id}\n{normalized_problem}").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::cluster;
    use pof_core::ProcessingMode;
    use pof_storage::Table;
    use std::fs;
    use tempfile::tempdir;

    fn scope(pass_no: i64) -> RunScope {
        RunScope::new(pass_no, ProcessingMode::Incremental, None)
    }

    fn post_json(id: &str, title: &str) -> String {
        format!(
            r#"{{"id": "{id}", "community": "r/accounting", "title": "{title}", "body": "", "created_at": "2026-03-01T10:00:00Z"}}"#
        )
    }

    #[tokio::test]
    async fn post_bundles_are_ingested_once() {
        let store = EventStore::open_in_memory().await.expect("store");
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("a.json"),
            format!(
                r#"{{"posts": [{}, {}]}}"#,
                post_json("p1", "Invoices hurt"),
                post_json("", "no id")
            ),
        )
        .expect("write");
        fs::write(
            dir.path().join("b.json"),
            format!(
                r#"{{"posts": [{}, {}]}}"#,
                post_json("p1", "Invoices hurt"),
                post_json("p2", "Payroll too")
            ),
        )
        .expect("write");
        fs::write(dir.path().join("c.json"), "{ not json").expect("write");

        let report = fetch_posts(&store, &scope(1), dir.path()).await.expect("fetch");
        assert_eq!(report.total_saved, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.files_rejected, 1);

        let again = fetch_posts(&store, &scope(2), dir.path()).await.expect("refetch");
        assert_eq!(again.total_saved, 0);
        assert_eq!(again.files_skipped, 2);
        assert_eq!(store.count(Table::Posts).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn relevance_rules_pick_the_first_matching_rule() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("relevance.yaml");
        fs::write(
            &path,
            "version: 1\nmin_chars: 12\nrules:\n  - rule: workflow_pain\n    contains_any: [\"Hate\", \"takes forever\"]\n  - rule: wishlist\n    contains_any: [\"wish\"]\n",
        )
        .expect("write");
        let filter = RelevanceFilter::from_path(&path).expect("rules");

        let post = |title: &str| Post {
            id: "p".into(),
            community: "r/x".into(),
            author: None,
            title: title.into(),
            body: String::new(),
            url: None,
            created_at: Utc::now(),
        };
        assert_eq!(filter.evaluate(&post("I hate month end close")), Some("workflow_pain".into()));
        assert_eq!(filter.evaluate(&post("I wish exports worked")), Some("wishlist".into()));
        assert_eq!(filter.evaluate(&post("hate it")), None);
        assert_eq!(filter.evaluate(&post("Lovely weather today")), None);

        let open = RelevanceFilter::from_path(&dir.path().join("missing.yaml")).expect("default");
        assert_eq!(open.evaluate(&post("anything")), Some(RelevanceFilter::MATCH_ANY.into()));
        assert_eq!(open.evaluate(&post("  ")), None);
    }

    #[tokio::test]
    async fn filter_marks_relevant_posts() {
        let store = EventStore::open_in_memory().await.expect("store");
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("a.json"),
            format!(
                r#"{{"posts": [{}, {}]}}"#,
                post_json("p1", "Invoices hurt"),
                post_json("p2", "   ")
            ),
        )
        .expect("write");
        fetch_posts(&store, &scope(1), dir.path()).await.expect("fetch");

        let report = filter_posts(&store, &scope(1), &RelevanceFilter::default())
            .await
            .expect("filter");
        assert_eq!(report.processed, 2);
        assert_eq!(report.filtered, 1);
        assert_eq!(store.count(Table::FilteredPosts).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn extraction_distinguishes_new_reseen_and_reworded_events() {
        let store = EventStore::open_in_memory().await.expect("store");
        let locks = ClusterLocks::new();
        let config = ExtractConfig::default();
        let extractor = Extractor {
            config: &config,
            locks: &locks,
        };
        let dir = tempdir().expect("tempdir");
        let bundle = |tag: &str, events: &str| {
            format!(r#"{{"extractor_version": "{tag}", "pain_events": [{events}]}}"#)
        };

        fs::write(
            dir.path().join("1.json"),
            bundle(
                "v1",
                r#"{"post_id": "p1", "community": "r/excel", "problem": "CSV exports break every single day", "frequency": "daily", "sentiment": ["frustrated"]},
                   {"post_id": "p2", "problem": ""}"#,
            ),
        )
        .expect("write");
        let first = extractor.run(&store, &scope(1), dir.path()).await.expect("pass 1");
        assert_eq!(first.pain_events_saved, 1);
        assert_eq!(first.malformed, 1);

        let mut event = store.pain_events().await.expect("events").remove(0);
        let home = cluster(1, vec![1.0, 0.0], 1);
        event.cluster_id = Some(home.id);
        event.embedding = Some(vec![1.0, 0.0]);
        let mut tx = store.begin().await.expect("begin");
        tx.upsert_cluster(&home).await.expect("cluster");
        tx.update_pain_event(&event).await.expect("event");
        tx.commit().await.expect("commit");

        fs::write(
            dir.path().join("2.json"),
            bundle(
                "v2",
                r#"{"post_id": "p1", "problem": "CSV exports break every single day!", "frequency": "daily"},
                   {"post_id": "p3", "problem": "Payroll approvals get lost"}"#,
            ),
        )
        .expect("write");
        let second = extractor.run(&store, &scope(2), dir.path()).await.expect("pass 2");
        assert_eq!(second.files_skipped, 1);
        assert_eq!(second.reextracted, 1);
        assert_eq!(second.pain_events_saved, 1);

        let events = store.pain_events().await.expect("events");
        let reworded = events.iter().find(|e| e.id == event.id).expect("same event");
        assert!(reworded.needs_recluster);
        assert!(reworded.cluster_id.is_none());
        assert!(reworded.embedding.is_none());
        assert_eq!(reworded.last_seen_pass, 2);
        assert_eq!(reworded.problem, "CSV exports break every single day!");
        let other = events.iter().find(|e| e.post_id == "p3").expect("new event");
        assert_eq!(other.community, UNKNOWN_COMMUNITY);

        let emptied = &store.clusters().await.expect("clusters")[0];
        assert_eq!(emptied.member_count, 0);
        assert!(emptied.is_dormant());

        fs::write(
            dir.path().join("3.json"),
            bundle("v3", r#"{"post_id": "p1", "problem": "csv exports   break every single day!"}"#),
        )
        .expect("write");
        let third = extractor.run(&store, &scope(3), dir.path()).await.expect("pass 3");
        assert_eq!(third.reseen, 1);
        assert_eq!(third.pain_events_saved, 0);
        assert_eq!(store.count(Table::PainEvents).await.expect("count"), 2);
    }

    #[test]
    fn event_keys_depend_on_post_and_wording() {
        assert_eq!(event_key("p1", "a b"), event_key("p1", "a b"));
        assert_ne!(event_key("p1", "a b"), event_key("p2", "a b"));
        assert_eq!(event_key("p1", "x").len(), 64);
    }
}
