//! Turns every live cluster into a scored opportunity with an itemised breakdown.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use pof_core::{Cluster, Opportunity, PainEvent, RunScope, ScoreBreakdown, SignalContribution};
use pof_storage::EventStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::stage::StageError;

pub const ACTIVE_MEMBERS: &str = "active_members";
pub const SOURCE_DIVERSITY: &str = "source_diversity";
pub const SENTIMENT_INTENSITY: &str = "sentiment_intensity";
pub const FREQUENCY: &str = "frequency";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringReport {
    pub opportunities_scored: usize,
    pub clusters_skipped_dormant: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreCard {
    pub total: f64,
    pub breakdown: ScoreBreakdown,
}

pub struct OpportunityScorer {
    config: ScoringConfig,
}

impl OpportunityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Score one cluster from its active members. Members must be in id order.
    pub fn score(&self, members: &[&PainEvent], pass_no: i64) -> ScoreCard {
        let weights = &self.config.weights;
        let count = members.len().max(1) as f64;

        let active = members
            .iter()
            .map(|m| {
                if m.last_seen_pass == pass_no {
                    self.config.current_pass_weight
                } else {
                    self.config.prior_pass_weight
                }
            })
            .sum::<f64>();
        let communities = members.iter().map(|m| m.community.as_str()).collect::<BTreeSet<_>>();
        let intensity = members.iter().map(|m| self.member_intensity(m)).sum::<f64>() / count;
        let cadence = members
            .iter()
            .map(|m| self.config.frequency_cadence.get(&m.frequency).copied().unwrap_or(0.0))
            .sum::<f64>()
            / count;

        let mut breakdown = BTreeMap::new();
        for (name, raw, weight) in [
            (ACTIVE_MEMBERS, active, weights.active_members),
            (SOURCE_DIVERSITY, communities.len() as f64, weights.source_diversity),
            (SENTIMENT_INTENSITY, intensity, weights.sentiment_intensity),
            (FREQUENCY, cadence, weights.frequency),
        ] {
            breakdown.insert(
                name.to_string(),
                SignalContribution {
                    raw,
                    weight,
                    contribution: raw * weight,
                },
            );
        }
        let total = breakdown.values().map(|s| s.contribution).sum();
        ScoreCard { total, breakdown }
    }

    fn member_intensity(&self, member: &PainEvent) -> f64 {
        if member.sentiment.is_empty() {
            return 0.0;
        }
        let sum = member
            .sentiment
            .iter()
            .map(|tag| {
                self.config
                    .sentiment_severity
                    .get(tag)
                    .copied()
                    .unwrap_or(self.config.unknown_tag_severity)
            })
            .sum::<f64>();
        sum / member.sentiment.len() as f64
    }

    pub async fn run(
        &self,
        store: &EventStore,
        scope: &RunScope,
    ) -> Result<ScoringReport, StageError> {
        let mut report = ScoringReport::default();
        let mut tx = store.begin().await?;
        let events = tx.pain_events().await?;
        let clusters = tx.clusters().await?;

        let mut members: BTreeMap<Uuid, Vec<&PainEvent>> = BTreeMap::new();
        for event in events.iter().filter(|e| e.is_active()) {
            if let Some(id) = event.cluster_id {
                members.entry(id).or_default().push(event);
            }
        }
        for list in members.values_mut() {
            list.sort_by_key(|e| e.id);
        }

        let now = Utc::now();
        for cluster in &clusters {
            let active = members.get(&cluster.id).map(Vec::as_slice).unwrap_or(&[]);
            if cluster.is_dormant() || active.is_empty() {
                report.clusters_skipped_dormant += 1;
                continue;
            }
            let card = self.score(active, scope.pass_no);
            let id = Opportunity::id_for_cluster(cluster.id);
            let existing = tx.opportunity(id).await?;
            let opportunity = Opportunity {
                id,
                cluster_id: cluster.id,
                name: opportunity_name(cluster),
                description: cluster.description.clone(),
                total_score: card.total,
                breakdown: card.breakdown,
                recommendation: existing.as_ref().and_then(|o| o.recommendation),
                scored_pass: scope.pass_no,
                created_at: existing.as_ref().map(|o| o.created_at).unwrap_or(now),
                updated_at: now,
            };
            tx.upsert_opportunity(&opportunity).await?;
            tx.append_score_history(scope.run_id, &opportunity).await?;
            debug!(opportunity_id = %id, score = opportunity.total_score, "opportunity scored");
            report.opportunities_scored += 1;
        }
        tx.commit().await?;

        info!(
            scored = report.opportunities_scored,
            skipped_dormant = report.clusters_skipped_dormant,
            "scoring committed"
        );
        Ok(report)
    }
}

/// Short display name: the first few words of the cluster description.
fn opportunity_name(cluster: &Cluster) -> String {
    let words: Vec<&str> = cluster.description.split_whitespace().collect();
    if words.len() <= 8 {
        words.join(" ")
    } else {
        format!("{}...", words[..8].join(" "))
    }
}
