//! Assigns pain events to clusters of semantically similar complaints.
//!
//! Each run resolves the events that are not yet placed (new, re-extracted, or every
//! active event in process-all mode) against the current cluster set. Embeddings are
//! fetched concurrently; assignment itself is sequential so later events in the batch
//! see the clusters created by earlier ones. All writes of a run land in one transaction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use pof_adapters::{EmbeddingError, EmbeddingProvider};
use pof_core::{Cluster, ClusterStatus, DescriptorProfile, LifecycleStage, PainEvent, RunScope};
use pof_storage::EventStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::stage::{Stage, StageError};
use crate::vector::{add_to_mean, cosine_similarity, remove_from_mean};

/// One exclusive lock per cluster id; centroid mutation happens only while holding it.
#[derive(Debug, Default)]
pub struct ClusterLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, cluster_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks
                .entry(cluster_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Locks several clusters at once, always in id order.
    pub async fn acquire_all(&self, ids: &[Uuid]) -> Vec<OwnedMutexGuard<()>> {
        let ids: BTreeSet<Uuid> = ids.iter().copied().collect();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.acquire(id).await);
        }
        guards
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterReport {
    pub clusters_created: usize,
    pub clusters_updated: usize,
    pub events_assigned: usize,
    pub events_unchanged: usize,
    pub deferred: usize,
    pub embedding_failures: usize,
    pub malformed: usize,
    pub near_ties: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Choice {
    index: Option<usize>,
    similarity: f32,
    near_tie: bool,
}

pub struct ClusterEngine {
    config: ClusterConfig,
    provider: Arc<dyn EmbeddingProvider>,
    locks: Arc<ClusterLocks>,
}

impl ClusterEngine {
    pub fn new(
        config: ClusterConfig,
        provider: Arc<dyn EmbeddingProvider>,
        locks: Arc<ClusterLocks>,
    ) -> Self {
        Self {
            config,
            provider,
            locks,
        }
    }

    pub async fn run(
        &self,
        store: &EventStore,
        scope: &RunScope,
    ) -> Result<ClusterReport, StageError> {
        let mut report = ClusterReport::default();
        let events = store.pain_events().await?;
        let mut clusters = store.clusters().await?;

        let mut candidates = Vec::new();
        for event in events.into_iter().filter(|e| is_candidate(e, scope)) {
            if event.problem.trim().is_empty() {
                warn!(event_id = %event.id, "skipping pain event without problem text");
                report.malformed += 1;
                continue;
            }
            candidates.push(event);
        }
        if candidates.is_empty() {
            debug!("no pain events awaiting clustering");
            return Ok(report);
        }

        let pending = candidates
            .iter()
            .filter(|e| e.embedding.is_none())
            .map(|e| (e.id, e.normalized_text()))
            .collect::<Vec<_>>();
        let mut fresh = self.embed_all(pending).await?;

        let now = Utc::now();
        let mut created: BTreeSet<Uuid> = BTreeSet::new();
        let mut touched: BTreeSet<Uuid> = BTreeSet::new();
        let mut changed_events = Vec::new();

        for mut event in candidates {
            let had_embedding = event.embedding.is_some();
            let embedding = match fresh.remove(&event.id) {
                Some(Ok(vector)) => vector,
                Some(Err(err)) => {
                    warn!(event_id = %event.id, error = %err, "deferring pain event");
                    report.embedding_failures += 1;
                    report.deferred += 1;
                    continue;
                }
                None => match event.embedding.clone() {
                    Some(vector) => vector,
                    None => {
                        report.deferred += 1;
                        continue;
                    }
                },
            };
            if embedding.is_empty() || embedding.iter().any(|v| !v.is_finite()) {
                warn!(event_id = %event.id, "skipping pain event with unusable embedding");
                report.malformed += 1;
                continue;
            }

            let current = event
                .cluster_id
                .filter(|_| event.is_active() && had_embedding)
                .and_then(|id| clusters.iter().position(|c| c.id == id));
            let choice = self.choose(&clusters, &event, &embedding);
            if choice.near_tie {
                report.near_ties += 1;
            }
            if current.is_some() && choice.index == current {
                report.events_unchanged += 1;
                continue;
            }

            let target = match choice.index {
                Some(index) => index,
                None => {
                    let id = Uuid::new_v4();
                    clusters.push(Cluster {
                        id,
                        description: event.problem.clone(),
                        centroid: Vec::new(),
                        member_count: 0,
                        active_count: 0,
                        status: ClusterStatus::Active,
                        profile: DescriptorProfile::default(),
                        last_reinforced_pass: scope.pass_no,
                        created_at: now,
                        updated_at: now,
                    });
                    created.insert(id);
                    clusters.len() - 1
                }
            };

            let mut lock_ids = vec![clusters[target].id];
            lock_ids.extend(current.map(|index| clusters[index].id));
            let _guards = self.locks.acquire_all(&lock_ids).await;

            if let Some(index) = current {
                let old = &mut clusters[index];
                if let Some(previous) = event.embedding.as_deref() {
                    remove_from_mean(&mut old.centroid, old.active_count, previous);
                }
                old.active_count = (old.active_count - 1).max(0);
                old.member_count = (old.member_count - 1).max(0);
                old.profile.remove(&event);
                if old.active_count == 0 {
                    old.status = ClusterStatus::Dormant;
                }
                old.updated_at = now;
                touched.insert(old.id);
                debug!(event_id = %event.id, from = %old.id, "moving pain event out of cluster");
            }

            let cluster = &mut clusters[target];
            if !add_to_mean(&mut cluster.centroid, cluster.active_count, &embedding) {
                warn!(
                    event_id = %event.id,
                    cluster_id = %cluster.id,
                    dimensions = embedding.len(),
                    centroid_dimensions = cluster.centroid.len(),
                    "embedding dimension differs from centroid, kept centroid"
                );
            }
            cluster.active_count += 1;
            cluster.member_count += 1;
            cluster.profile.add(&event);
            cluster.status = ClusterStatus::Active;
            cluster.last_reinforced_pass = scope.pass_no;
            cluster.updated_at = now;
            touched.insert(cluster.id);
            debug!(
                event_id = %event.id,
                cluster_id = %cluster.id,
                similarity = choice.similarity,
                "assigned pain event"
            );

            event.cluster_id = Some(cluster.id);
            event.embedding = Some(embedding);
            event.needs_recluster = false;
            event.lifecycle_stage = LifecycleStage::Active;
            changed_events.push(event);
            report.events_assigned += 1;
        }

        if touched.is_empty() && changed_events.is_empty() {
            return Ok(report);
        }

        let mut tx = store.begin().await?;
        for cluster in clusters.iter().filter(|c| touched.contains(&c.id)) {
            tx.upsert_cluster(cluster).await?;
        }
        for event in &changed_events {
            tx.update_pain_event(event).await?;
        }
        tx.commit().await?;

        report.clusters_created = created.len();
        report.clusters_updated = touched.difference(&created).count();
        info!(
            created = report.clusters_created,
            updated = report.clusters_updated,
            assigned = report.events_assigned,
            deferred = report.deferred,
            "cluster assignment committed"
        );
        Ok(report)
    }

    async fn embed_all(
        &self,
        pending: Vec<(Uuid, String)>,
    ) -> Result<HashMap<Uuid, Result<Vec<f32>, EmbeddingError>>, StageError> {
        let semaphore = Arc::new(Semaphore::new(self.config.embedding_concurrency));
        let mut tasks = JoinSet::new();
        for (id, text) in pending {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (id, provider.embed(&text).await)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (id, result) =
                joined.map_err(|err| anyhow::anyhow!("embedding task panicked: {err}"))?;
            if let Err(EmbeddingError::Unavailable(message)) = &result {
                tasks.abort_all();
                return Err(StageError::Unavailable {
                    stage: Stage::Cluster,
                    message: message.clone(),
                });
            }
            results.insert(id, result);
        }
        Ok(results)
    }

    fn choose(&self, clusters: &[Cluster], event: &PainEvent, embedding: &[f32]) -> Choice {
        let mut eligible = Vec::new();
        for (index, cluster) in clusters.iter().enumerate() {
            let similarity = cosine_similarity(embedding, &cluster.centroid);
            if similarity < self.config.similarity_threshold {
                continue;
            }
            if self.config.descriptor_gate
                && similarity < self.config.descriptor_override_similarity
                && cluster.profile.excludes(event, &self.config.positive_sentiment_tags)
            {
                debug!(
                    event_id = %event.id,
                    cluster_id = %cluster.id,
                    similarity,
                    "descriptor conflict"
                );
                continue;
            }
            eligible.push((index, similarity));
        }

        let Some(best) = eligible.iter().map(|(_, s)| *s).max_by(f32::total_cmp) else {
            return Choice {
                index: None,
                similarity: 0.0,
                near_tie: false,
            };
        };
        let contenders = eligible
            .into_iter()
            .filter(|(_, s)| best - *s <= self.config.tie_margin)
            .collect::<Vec<_>>();
        let near_tie = contenders.len() > 1;

        let winner = contenders.iter().copied().max_by(|(a, sa), (b, sb)| {
            let (ca, cb) = (&clusters[*a], &clusters[*b]);
            ca.active_count
                .cmp(&cb.active_count)
                .then(sa.total_cmp(sb))
                .then(cb.created_at.cmp(&ca.created_at))
                .then(cb.id.cmp(&ca.id))
        });
        if near_tie {
            warn!(
                event_id = %event.id,
                candidates = contenders.len(),
                best_similarity = best,
                "near-tie between clusters"
            );
        }
        match winner {
            Some((index, similarity)) => Choice {
                index: Some(index),
                similarity,
                near_tie,
            },
            None => Choice {
                index: None,
                similarity: 0.0,
                near_tie,
            },
        }
    }
}

/// Unplaced events stay candidates in every lifecycle stage until an embedding lands.
fn is_candidate(event: &PainEvent, scope: &RunScope) -> bool {
    if event.needs_recluster || event.cluster_id.is_none() {
        return true;
    }
    event.is_active() && scope.is_full()
}
