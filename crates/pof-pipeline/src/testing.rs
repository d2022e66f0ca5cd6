use std::collections::BTreeSet;

use chrono::{Duration, TimeZone, Utc};
use pof_core::{Cluster, ClusterStatus, DescriptorProfile, Frequency, LifecycleStage, PainEvent};
use pof_storage::EventStore;
use uuid::Uuid;

pub(crate) fn event(seq: i64, problem: &str) -> PainEvent {
    let created = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(seq);
    PainEvent {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("event-{seq}").as_bytes()),
        event_key: format!("key-{seq}"),
        post_id: format!("post-{seq}"),
        community: "r/smallbusiness".into(),
        problem: problem.into(),
        workaround: None,
        frequency: Frequency::Unspecified,
        sentiment: BTreeSet::new(),
        embedding: None,
        lifecycle_stage: LifecycleStage::Active,
        cluster_id: None,
        needs_recluster: false,
        last_seen_pass: 1,
        created_at: created,
        last_seen_at: created,
    }
}

pub(crate) fn cluster(seq: i64, centroid: Vec<f32>, active_count: i64) -> Cluster {
    let created = Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap() + Duration::seconds(seq);
    Cluster {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("cluster-{seq}").as_bytes()),
        description: format!("cluster {seq}"),
        centroid,
        member_count: active_count,
        active_count,
        status: if active_count > 0 {
            ClusterStatus::Active
        } else {
            ClusterStatus::Dormant
        },
        profile: DescriptorProfile::default(),
        last_reinforced_pass: 1,
        created_at: created,
        updated_at: created,
    }
}

pub(crate) async fn seed(store: &EventStore, clusters: &[Cluster], events: &[PainEvent]) {
    let mut tx = store.begin().await.expect("begin");
    for c in clusters {
        tx.upsert_cluster(c).await.expect("cluster");
    }
    for e in events {
        tx.insert_pain_event(e).await.expect("event");
    }
    tx.commit().await.expect("commit");
}
