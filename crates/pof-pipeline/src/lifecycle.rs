//! Active/orphan transitions for pain events and the cluster bookkeeping that follows them.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use pof_core::{Cluster, ClusterStatus, DescriptorProfile, LifecycleStage, PainEvent, RunScope};
use pof_storage::EventStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LifecycleConfig;
use crate::stage::StageError;
use crate::vector::{add_to_mean, cosine_similarity, mean, remove_from_mean};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleReport {
    pub orphaned: usize,
    pub reactivated: usize,
    /// Clusters that lost their last active member in this pass.
    pub dormant_clusters: usize,
    pub active_events: i64,
    pub total_events: i64,
    pub retention_rate: f64,
}

pub struct LifecycleTracker {
    config: LifecycleConfig,
}

impl LifecycleTracker {
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    /// Latest pass in which the event, or the cluster it belongs to, was confirmed.
    pub fn corroboration_pass(event: &PainEvent, cluster: Option<&Cluster>) -> i64 {
        let reinforced = cluster.map(|c| c.last_reinforced_pass).unwrap_or(i64::MIN);
        event.last_seen_pass.max(reinforced)
    }

    pub async fn run(
        &self,
        store: &EventStore,
        scope: &RunScope,
    ) -> Result<LifecycleReport, StageError> {
        let mut report = LifecycleReport::default();
        let mut tx = store.begin().await?;
        let mut events = tx.pain_events().await?;
        let originals: BTreeMap<Uuid, Cluster> =
            tx.clusters().await?.into_iter().map(|c| (c.id, c)).collect();
        let mut clusters = originals.clone();

        let mut changed = Vec::new();
        for (index, event) in events.iter_mut().enumerate() {
            let corroborated =
                Self::corroboration_pass(event, event.cluster_id.and_then(|id| originals.get(&id)));
            let cluster = event.cluster_id.and_then(|id| clusters.get_mut(&id));
            match event.lifecycle_stage {
                LifecycleStage::Active
                    if scope.pass_no - corroborated >= self.config.staleness_window =>
                {
                    event.lifecycle_stage = LifecycleStage::Orphan;
                    if let Some(cluster) = cluster {
                        if let Some(vector) = event.embedding.as_deref() {
                            remove_from_mean(&mut cluster.centroid, cluster.active_count, vector);
                        }
                        cluster.active_count = (cluster.active_count - 1).max(0);
                    }
                    debug!(event_id = %event.id, corroborated, "pain event orphaned");
                    report.orphaned += 1;
                    changed.push(index);
                }
                LifecycleStage::Orphan if corroborated >= scope.pass_no => {
                    event.lifecycle_stage = LifecycleStage::Active;
                    if let Some(cluster) = cluster {
                        if let Some(vector) = event.embedding.as_deref() {
                            if !add_to_mean(&mut cluster.centroid, cluster.active_count, vector) {
                                warn!(
                                    event_id = %event.id,
                                    cluster_id = %cluster.id,
                                    dimensions = vector.len(),
                                    centroid_dimensions = cluster.centroid.len(),
                                    "embedding dimension differs from centroid, kept centroid"
                                );
                            }
                        }
                        cluster.active_count += 1;
                    }
                    debug!(event_id = %event.id, "pain event reactivated");
                    report.reactivated += 1;
                    changed.push(index);
                }
                _ => {}
            }
        }

        let mut members: HashMap<Uuid, Vec<&PainEvent>> = HashMap::new();
        for event in &events {
            if let Some(id) = event.cluster_id {
                members.entry(id).or_default().push(event);
            }
        }

        let now = Utc::now();
        let mut dirty = Vec::new();
        for (id, cluster) in clusters.iter_mut() {
            let all = members.get(id).map(Vec::as_slice).unwrap_or(&[]);
            reconcile(cluster, all);
            let original = &originals[id];
            if cluster != original {
                if original.status == ClusterStatus::Active && cluster.is_dormant() {
                    info!(cluster_id = %id, "cluster went dormant");
                    report.dormant_clusters += 1;
                }
                cluster.updated_at = now;
                dirty.push(*id);
            }
        }

        for index in &changed {
            tx.update_pain_event(&events[*index]).await?;
        }
        for id in &dirty {
            tx.upsert_cluster(&clusters[id]).await?;
        }
        let retention = tx.retention_rate().await?;
        tx.commit().await?;

        report.active_events = retention.active;
        report.total_events = retention.total;
        report.retention_rate = retention.percent();
        info!(
            orphaned = report.orphaned,
            reactivated = report.reactivated,
            dormant = report.dormant_clusters,
            retention = report.retention_rate,
            "lifecycle pass committed"
        );
        Ok(report)
    }
}

/// Bring counts, profile, status and description in line with the cluster's members.
fn reconcile(cluster: &mut Cluster, members: &[&PainEvent]) {
    let active: Vec<&PainEvent> = members.iter().copied().filter(|e| e.is_active()).collect();

    if active.len() as i64 != cluster.active_count {
        warn!(
            cluster_id = %cluster.id,
            tracked = cluster.active_count,
            actual = active.len(),
            "active count drifted, recomputing centroid"
        );
        if let Some(exact) = mean(active.iter().filter_map(|e| e.embedding.as_deref())) {
            cluster.centroid = exact;
        }
    }
    cluster.active_count = active.len() as i64;
    cluster.member_count = members.len() as i64;

    let mut profile = DescriptorProfile::default();
    for event in &active {
        profile.add(event);
    }
    cluster.profile = profile;

    cluster.status = if active.is_empty() {
        ClusterStatus::Dormant
    } else {
        ClusterStatus::Active
    };

    let mut nearest: Option<(&PainEvent, f32)> = None;
    for event in active.iter().copied() {
        let Some(vector) = event.embedding.as_deref() else {
            continue;
        };
        let similarity = cosine_similarity(vector, &cluster.centroid);
        if nearest.map(|(_, best)| similarity > best).unwrap_or(true) {
            nearest = Some((event, similarity));
        }
    }
    if let Some((event, _)) = nearest {
        cluster.description = event.problem.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cluster, event, seed};
    use pof_core::ProcessingMode;

    fn scope(pass_no: i64) -> RunScope {
        RunScope::new(pass_no, ProcessingMode::Incremental, None)
    }

    fn member(seq: i64, of: &Cluster, vector: Vec<f32>) -> PainEvent {
        let mut e = event(seq, &format!("problem {seq}"));
        e.cluster_id = Some(of.id);
        e.embedding = Some(vector);
        e
    }

    #[tokio::test]
    async fn stale_events_orphan_and_never_come_back_on_their_own() {
        let store = EventStore::open_in_memory().await.expect("store");
        let c = cluster(1, vec![0.5, 0.5], 2);
        seed(
            &store,
            &[c.clone()],
            &[member(1, &c, vec![1.0, 0.0]), member(2, &c, vec![0.0, 1.0])],
        )
        .await;
        let tracker = LifecycleTracker::new(LifecycleConfig { staleness_window: 2 });

        let report = tracker.run(&store, &scope(2)).await.expect("pass 2");
        assert_eq!(report.orphaned, 0);
        assert_eq!(report.retention_rate, 100.0);

        let report = tracker.run(&store, &scope(3)).await.expect("pass 3");
        assert_eq!(report.orphaned, 2);
        assert_eq!(report.dormant_clusters, 1);
        assert_eq!(report.retention_rate, 0.0);

        let dormant = &store.clusters().await.expect("clusters")[0];
        assert!(dormant.is_dormant());
        assert_eq!(dormant.member_count, 2);
        assert_eq!(dormant.active_count, 0);
        assert!(!dormant.centroid.is_empty());

        for pass in 4..7 {
            let report = tracker.run(&store, &scope(pass)).await.expect("later pass");
            assert_eq!(report.reactivated, 0);
            assert_eq!(report.active_events, 0);
        }
        assert_eq!(store.pain_events().await.expect("events").len(), 2);
    }

    #[tokio::test]
    async fn reinforcement_keeps_old_members_alive() {
        let store = EventStore::open_in_memory().await.expect("store");
        let mut c = cluster(1, vec![1.0, 0.0], 1);
        c.last_reinforced_pass = 5;
        seed(&store, &[c.clone()], &[member(1, &c, vec![1.0, 0.0])]).await;

        let report = LifecycleTracker::new(LifecycleConfig { staleness_window: 1 })
            .run(&store, &scope(5))
            .await
            .expect("pass");
        assert_eq!(report.orphaned, 0);
        assert_eq!(report.active_events, 1);
    }

    #[tokio::test]
    async fn orphan_seen_this_pass_rejoins_its_cluster() {
        let store = EventStore::open_in_memory().await.expect("store");
        let mut c = cluster(1, vec![1.0, 0.0], 1);
        c.last_reinforced_pass = 4;
        let stay = member(1, &c, vec![1.0, 0.0]);
        let mut back = member(2, &c, vec![0.0, 1.0]);
        back.lifecycle_stage = LifecycleStage::Orphan;
        back.last_seen_pass = 4;
        seed(&store, &[c.clone()], &[stay, back]).await;

        let report = LifecycleTracker::new(LifecycleConfig::default())
            .run(&store, &scope(4))
            .await
            .expect("pass");
        assert_eq!(report.reactivated, 1);
        assert_eq!(report.retention_rate, 100.0);

        let revived = &store.clusters().await.expect("clusters")[0];
        assert_eq!(revived.active_count, 2);
        assert_eq!(revived.centroid, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn reactivation_with_a_foreign_dimension_keeps_the_centroid() {
        let store = EventStore::open_in_memory().await.expect("store");
        let mut c = cluster(1, vec![1.0, 0.0], 1);
        c.last_reinforced_pass = 4;
        let mut back = member(2, &c, vec![0.0, 0.0, 1.0]);
        back.lifecycle_stage = LifecycleStage::Orphan;
        back.last_seen_pass = 4;
        seed(&store, &[c.clone()], &[member(1, &c, vec![1.0, 0.0]), back]).await;

        let report = LifecycleTracker::new(LifecycleConfig::default())
            .run(&store, &scope(4))
            .await
            .expect("pass");
        assert_eq!(report.reactivated, 1);

        let kept = &store.clusters().await.expect("clusters")[0];
        assert_eq!(kept.active_count, 2);
        assert_eq!(kept.centroid, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn seven_of_ten_active_is_seventy_percent() {
        let store = EventStore::open_in_memory().await.expect("store");
        let events: Vec<PainEvent> = (0..10)
            .map(|i| {
                let mut e = event(i, "unclustered");
                if i >= 7 {
                    e.lifecycle_stage = LifecycleStage::Orphan;
                    e.last_seen_pass = 0;
                }
                e
            })
            .collect();
        seed(&store, &[], &events).await;

        let report = LifecycleTracker::new(LifecycleConfig::default())
            .run(&store, &scope(1))
            .await
            .expect("pass");
        assert_eq!(report.active_events, 7);
        assert_eq!(report.total_events, 10);
        assert_eq!(report.retention_rate, 70.0);
    }

    #[test]
    fn description_follows_the_member_nearest_the_centroid() {
        let mut c = cluster(1, vec![0.9, 0.1], 2);
        let far = member(1, &c, vec![0.0, 1.0]);
        let mut near = member(2, &c, vec![1.0, 0.0]);
        near.problem = "closest complaint".into();
        reconcile(&mut c, &[&far, &near]);
        assert_eq!(c.description, "closest complaint");
        assert_eq!(c.status, ClusterStatus::Active);
    }
}
