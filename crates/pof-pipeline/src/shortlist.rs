//! Records a shortlist decision for every opportunity scored in the current pass.

use std::cmp::Ordering;

use chrono::Utc;
use pof_core::{ReasonCode, Recommendation, RecommendationOutcome, RunScope, ShortlistEntry};
use pof_storage::{EventStore, RankedOpportunity};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ShortlistConfig;
use crate::stage::StageError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortlistReport {
    pub shortlist_count: usize,
    pub rejected_too_small: usize,
    pub rejected_low_score: usize,
    pub overflow: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub opportunity_id: Uuid,
    pub recommendation: Recommendation,
    /// 1-based position on the shortlist, for `pursue` decisions only.
    pub rank: Option<i64>,
}

pub struct ShortlistDecision {
    config: ShortlistConfig,
}

impl ShortlistDecision {
    pub fn new(config: ShortlistConfig) -> Self {
        Self { config }
    }

    /// One decision per candidate: size gate, score gate, then the capped ranking.
    pub fn decide(&self, candidates: &[RankedOpportunity]) -> Vec<Decision> {
        let cfg = &self.config;
        let mut decisions = Vec::with_capacity(candidates.len());
        let mut qualified = Vec::new();

        for candidate in candidates {
            let opportunity = &candidate.opportunity;
            let score = opportunity.total_score;
            let recommendation = if candidate.active_count < cfg.min_active_members {
                Recommendation {
                    outcome: RecommendationOutcome::Abandon,
                    reason: ReasonCode::ClusterTooSmall,
                    threshold: cfg.min_active_members as f64,
                    observed: candidate.active_count as f64,
                }
            } else if score < cfg.min_total_score {
                let outcome = if score >= cfg.min_total_score * cfg.research_ratio {
                    RecommendationOutcome::Research
                } else {
                    RecommendationOutcome::Abandon
                };
                Recommendation {
                    outcome,
                    reason: ReasonCode::ScoreBelowThreshold,
                    threshold: cfg.min_total_score,
                    observed: score,
                }
            } else {
                qualified.push(candidate);
                continue;
            };
            decisions.push(Decision {
                opportunity_id: opportunity.id,
                recommendation,
                rank: None,
            });
        }

        qualified.sort_by(|a, b| {
            b.opportunity
                .total_score
                .partial_cmp(&a.opportunity.total_score)
                .unwrap_or(Ordering::Equal)
                .then(a.opportunity.id.cmp(&b.opportunity.id))
        });
        for (position, candidate) in qualified.into_iter().enumerate() {
            let score = candidate.opportunity.total_score;
            let (recommendation, rank) = if position < cfg.max_shortlist {
                (
                    Recommendation {
                        outcome: RecommendationOutcome::Pursue,
                        reason: ReasonCode::MeetsThresholds,
                        threshold: cfg.min_total_score,
                        observed: score,
                    },
                    Some(position as i64 + 1),
                )
            } else {
                (
                    Recommendation {
                        outcome: RecommendationOutcome::Research,
                        reason: ReasonCode::ShortlistFull,
                        threshold: cfg.max_shortlist as f64,
                        observed: (position + 1) as f64,
                    },
                    None,
                )
            };
            decisions.push(Decision {
                opportunity_id: candidate.opportunity.id,
                recommendation,
                rank,
            });
        }
        decisions
    }

    pub async fn run(
        &self,
        store: &EventStore,
        scope: &RunScope,
    ) -> Result<ShortlistReport, StageError> {
        let mut report = ShortlistReport::default();
        let mut tx = store.begin().await?;
        let candidates = tx.scored_opportunities(scope.pass_no).await?;
        let decisions = self.decide(&candidates);

        let now = Utc::now();
        for decision in &decisions {
            let Some(candidate) = candidates
                .iter()
                .find(|c| c.opportunity.id == decision.opportunity_id)
            else {
                continue;
            };
            let mut opportunity = candidate.opportunity.clone();
            opportunity.recommendation = Some(decision.recommendation);
            opportunity.updated_at = now;
            tx.upsert_opportunity(&opportunity).await?;

            match (decision.recommendation.reason, decision.rank) {
                (ReasonCode::MeetsThresholds, Some(rank)) => {
                    tx.insert_shortlist_entry(
                        scope.run_id,
                        &ShortlistEntry {
                            pass_no: scope.pass_no,
                            opportunity_id: opportunity.id,
                            rank,
                            rule: ReasonCode::MeetsThresholds,
                            threshold: self.config.min_total_score,
                        },
                    )
                    .await?;
                    report.shortlist_count += 1;
                }
                (ReasonCode::ClusterTooSmall, _) => report.rejected_too_small += 1,
                (ReasonCode::ScoreBelowThreshold, _) => report.rejected_low_score += 1,
                (ReasonCode::ShortlistFull, _) => report.overflow += 1,
                (ReasonCode::MeetsThresholds, None) => {}
            }
            debug!(
                opportunity_id = %opportunity.id,
                recommendation = %decision.recommendation,
                "shortlist decision"
            );
        }
        tx.commit().await?;

        info!(
            shortlisted = report.shortlist_count,
            too_small = report.rejected_too_small,
            low_score = report.rejected_low_score,
            overflow = report.overflow,
            "shortlist committed"
        );
        Ok(report)
    }
}
