//! Core domain model for POF: pain events, clusters, opportunities and run scope.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pof-core";

/// Namespace for deterministic v5 ids derived from content keys.
pub const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_9b3d_4c57_8e21_d0a9_5f47_b3c2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! str_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// How often the complaining user hits the problem, as reported by extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Occasional,
    #[default]
    Unspecified,
}

str_enum!(Frequency, "frequency", {
    Daily => "daily",
    Weekly => "weekly",
    Occasional => "occasional",
    Unspecified => "unspecified",
});

impl Frequency {
    pub const ALL: [Frequency; 4] = [
        Frequency::Daily,
        Frequency::Weekly,
        Frequency::Occasional,
        Frequency::Unspecified,
    ];

    /// Cadences that cannot describe the same recurring problem.
    pub fn excludes(&self, other: Frequency) -> bool {
        matches!(
            (self, other),
            (Frequency::Daily, Frequency::Occasional) | (Frequency::Occasional, Frequency::Daily)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    #[default]
    Active,
    Orphan,
}

str_enum!(LifecycleStage, "lifecycle stage", {
    Active => "active",
    Orphan => "orphan",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    #[default]
    Active,
    Dormant,
}

str_enum!(ClusterStatus, "cluster status", {
    Active => "active",
    Dormant => "dormant",
});

/// Raw item handed over by the external fetchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub community: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn text(&self) -> String {
        format!("{} {}", self.title, self.body).trim().to_string()
    }
}

/// A single normalized complaint extracted from a source post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PainEvent {
    pub id: Uuid,
    pub event_key: String,
    pub post_id: String,
    pub community: String,
    pub problem: String,
    pub workaround: Option<String>,
    pub frequency: Frequency,
    pub sentiment: BTreeSet<String>,
    pub embedding: Option<Vec<f32>>,
    pub lifecycle_stage: LifecycleStage,
    pub cluster_id: Option<Uuid>,
    pub needs_recluster: bool,
    pub last_seen_pass: i64,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl PainEvent {
    pub fn is_active(&self) -> bool {
        self.lifecycle_stage == LifecycleStage::Active
    }

    /// Text handed to the embedding provider.
    pub fn normalized_text(&self) -> String {
        normalize_text(&self.problem)
    }

    pub fn polarity(&self, positive_tags: &BTreeSet<String>) -> Polarity {
        Polarity::of_tags(self.sentiment.iter().map(String::as_str), positive_tags)
    }
}

pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
    Neutral,
}

impl Polarity {
    pub fn of_tags<'a>(
        tags: impl IntoIterator<Item = &'a str>,
        positive_tags: &BTreeSet<String>,
    ) -> Self {
        let mut positive = 0usize;
        let mut negative = 0usize;
        for tag in tags {
            if positive_tags.contains(tag) {
                positive += 1;
            } else {
                negative += 1;
            }
        }
        Self::from_counts(positive, negative)
    }

    pub fn from_counts(positive: usize, negative: usize) -> Self {
        match positive.cmp(&negative) {
            std::cmp::Ordering::Greater => Polarity::Positive,
            std::cmp::Ordering::Less => Polarity::Negative,
            std::cmp::Ordering::Equal => Polarity::Neutral,
        }
    }

    pub fn opposes(&self, other: Polarity) -> bool {
        matches!(
            (self, other),
            (Polarity::Positive, Polarity::Negative) | (Polarity::Negative, Polarity::Positive)
        )
    }
}

/// Descriptor counts over a cluster's active members.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DescriptorProfile {
    pub frequency: BTreeMap<Frequency, u32>,
    pub sentiment: BTreeMap<String, u32>,
}

impl DescriptorProfile {
    pub fn add(&mut self, event: &PainEvent) {
        *self.frequency.entry(event.frequency).or_default() += 1;
        for tag in &event.sentiment {
            *self.sentiment.entry(tag.clone()).or_default() += 1;
        }
    }

    pub fn remove(&mut self, event: &PainEvent) {
        decrement(&mut self.frequency, &event.frequency);
        for tag in &event.sentiment {
            decrement(&mut self.sentiment, tag);
        }
    }

    /// Most common specified cadence; `None` when unspecified dominates or on a tie.
    pub fn dominant_frequency(&self) -> Option<Frequency> {
        let mut best: Option<(Frequency, u32)> = None;
        let mut tied = false;
        for (freq, count) in &self.frequency {
            if *freq == Frequency::Unspecified || *count == 0 {
                continue;
            }
            match best {
                Some((_, best_count)) if *count == best_count => tied = true,
                Some((_, best_count)) if *count < best_count => {}
                _ => {
                    best = Some((*freq, *count));
                    tied = false;
                }
            }
        }
        if tied {
            None
        } else {
            best.map(|(freq, _)| freq)
        }
    }

    pub fn polarity(&self, positive_tags: &BTreeSet<String>) -> Polarity {
        let mut positive = 0usize;
        let mut negative = 0usize;
        for (tag, count) in &self.sentiment {
            if positive_tags.contains(tag) {
                positive += *count as usize;
            } else {
                negative += *count as usize;
            }
        }
        Polarity::from_counts(positive, negative)
    }

    /// True when the event's descriptors cannot plausibly describe this profile.
    pub fn excludes(&self, event: &PainEvent, positive_tags: &BTreeSet<String>) -> bool {
        let cadence_conflict = self
            .dominant_frequency()
            .map(|dominant| dominant.excludes(event.frequency))
            .unwrap_or(false);
        cadence_conflict || self.polarity(positive_tags).opposes(event.polarity(positive_tags))
    }
}

fn decrement<K: Ord + Clone>(map: &mut BTreeMap<K, u32>, key: &K) {
    if let Some(count) = map.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// A group of semantically similar pain events describing one recurring problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub description: String,
    pub centroid: Vec<f32>,
    pub member_count: i64,
    pub active_count: i64,
    pub status: ClusterStatus,
    pub profile: DescriptorProfile,
    pub last_reinforced_pass: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn is_dormant(&self) -> bool {
        self.status == ClusterStatus::Dormant
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationOutcome {
    Pursue,
    Research,
    Abandon,
}

str_enum!(RecommendationOutcome, "recommendation", {
    Pursue => "pursue",
    Research => "research",
    Abandon => "abandon",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    MeetsThresholds,
    ClusterTooSmall,
    ScoreBelowThreshold,
    ShortlistFull,
}

str_enum!(ReasonCode, "reason code", {
    MeetsThresholds => "meets_thresholds",
    ClusterTooSmall => "cluster_too_small",
    ScoreBelowThreshold => "score_below_threshold",
    ShortlistFull => "shortlist_full",
});

impl ReasonCode {
    /// Fixed wording quoted by report generation.
    pub fn describe(&self) -> &'static str {
        match self {
            ReasonCode::MeetsThresholds => "meets all shortlist thresholds",
            ReasonCode::ClusterTooSmall => "cluster too small",
            ReasonCode::ScoreBelowThreshold => "score below threshold",
            ReasonCode::ShortlistFull => "shortlist full",
        }
    }
}

/// Structured shortlist outcome: what was decided, which rule decided it, and the numbers compared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub outcome: RecommendationOutcome,
    pub reason: ReasonCode,
    pub threshold: f64,
    pub observed: f64,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({} vs {})",
            self.outcome,
            self.reason.describe(),
            self.observed,
            self.threshold
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalContribution {
    pub raw: f64,
    pub weight: f64,
    pub contribution: f64,
}

pub type ScoreBreakdown = BTreeMap<String, SignalContribution>;

/// A scored product idea attached to exactly one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
    pub description: String,
    pub total_score: f64,
    pub breakdown: ScoreBreakdown,
    pub recommendation: Option<Recommendation>,
    pub scored_pass: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Opportunity {
    /// One stable opportunity per cluster.
    pub fn id_for_cluster(cluster_id: Uuid) -> Uuid {
        Uuid::new_v5(&ID_NAMESPACE, format!("opportunity:{cluster_id}").as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortlistEntry {
    pub pass_no: i64,
    pub opportunity_id: Uuid,
    pub rank: i64,
    pub rule: ReasonCode,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Incremental,
    ProcessAll,
}

str_enum!(ProcessingMode, "processing mode", {
    Incremental => "incremental",
    ProcessAll => "process_all",
});

/// Which slice of the store a run works on, threaded through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunScope {
    pub run_id: Uuid,
    pub pass_no: i64,
    pub mode: ProcessingMode,
    /// Start of the last successful run; `None` means everything is in scope.
    pub watermark: Option<DateTime<Utc>>,
}

impl RunScope {
    pub fn new(pass_no: i64, mode: ProcessingMode, last_success: Option<DateTime<Utc>>) -> Self {
        let watermark = match mode {
            ProcessingMode::Incremental => last_success,
            ProcessingMode::ProcessAll => None,
        };
        Self {
            run_id: Uuid::new_v4(),
            pass_no,
            mode,
            watermark,
        }
    }

    pub fn is_full(&self) -> bool {
        self.mode == ProcessingMode::ProcessAll
    }

    pub fn includes(&self, at: DateTime<Utc>) -> bool {
        self.watermark.map(|w| at > w).unwrap_or(true)
    }
}

/// Fraction of all pain events currently active. Derived on demand, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetentionRate {
    pub active: i64,
    pub total: i64,
}

impl RetentionRate {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.active * 100) as f64 / self.total as f64
    }
}
