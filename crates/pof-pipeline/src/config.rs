use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use pof_adapters::{BackoffPolicy, EmbeddingSettings, ProviderKind};
use pof_core::Frequency;
use serde::Deserialize;

/// Everything a run needs: store location, inbox layout and the knobs of every stage.
///
/// Loaded from an optional `pof.yaml` at the workspace root, then overridden from the
/// environment. Every field has a default, so an empty file is a valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_url: String,
    #[serde(skip)]
    pub workspace_root: PathBuf,
    pub inbox_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub relevance_rules: PathBuf,
    pub embedding: EmbeddingSettings,
    pub stage_backoff: BackoffPolicy,
    pub extract: ExtractConfig,
    pub cluster: ClusterConfig,
    pub lifecycle: LifecycleConfig,
    pub scoring: ScoringConfig,
    pub shortlist: ShortlistConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            workspace_root: PathBuf::from("."),
            inbox_dir: PathBuf::from("inbox"),
            reports_dir: PathBuf::from("reports"),
            relevance_rules: PathBuf::from("rules/relevance.yaml"),
            embedding: EmbeddingSettings::default(),
            stage_backoff: BackoffPolicy::default(),
            extract: ExtractConfig::default(),
            cluster: ClusterConfig::default(),
            lifecycle: LifecycleConfig::default(),
            scoring: ScoringConfig::default(),
            shortlist: ShortlistConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Jaro-Winkler similarity above which a new extraction from the same post replaces an old one.
    pub reextraction_similarity: f64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            reextraction_similarity: 0.92,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub similarity_threshold: f32,
    pub tie_margin: f32,
    pub descriptor_gate: bool,
    /// Similarity at which a descriptor conflict no longer blocks assignment.
    pub descriptor_override_similarity: f32,
    pub embedding_concurrency: usize,
    pub positive_sentiment_tags: BTreeSet<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.78,
            tie_margin: 0.02,
            descriptor_gate: true,
            descriptor_override_similarity: 0.95,
            embedding_concurrency: 8,
            positive_sentiment_tags: ["satisfied", "happy", "relieved", "grateful", "positive"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Passes without corroboration after which an active event turns orphan.
    pub staleness_window: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { staleness_window: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub active_members: f64,
    pub source_diversity: f64,
    pub sentiment_intensity: f64,
    pub frequency: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            active_members: 1.0,
            source_diversity: 2.0,
            sentiment_intensity: 5.0,
            frequency: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    pub current_pass_weight: f64,
    pub prior_pass_weight: f64,
    pub sentiment_severity: BTreeMap<String, f64>,
    pub unknown_tag_severity: f64,
    pub frequency_cadence: BTreeMap<Frequency, f64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let sentiment_severity = [
            ("desperate", 1.0),
            ("angry", 0.9),
            ("frustrated", 0.8),
            ("overwhelmed", 0.7),
            ("annoyed", 0.5),
            ("confused", 0.4),
            ("curious", 0.2),
            ("neutral", 0.1),
        ]
        .into_iter()
        .map(|(tag, severity)| (tag.to_string(), severity))
        .collect();
        let frequency_cadence = [
            (Frequency::Daily, 1.0),
            (Frequency::Weekly, 0.6),
            (Frequency::Occasional, 0.3),
            (Frequency::Unspecified, 0.1),
        ]
        .into_iter()
        .collect();
        Self {
            weights: ScoringWeights::default(),
            current_pass_weight: 1.0,
            prior_pass_weight: 0.5,
            sentiment_severity,
            unknown_tag_severity: 0.3,
            frequency_cadence,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShortlistConfig {
    pub min_active_members: i64,
    pub min_total_score: f64,
    /// Fraction of `min_total_score` that still earns `research` instead of `abandon`.
    pub research_ratio: f64,
    pub max_shortlist: usize,
}

impl Default for ShortlistConfig {
    fn default() -> Self {
        Self {
            min_active_members: 8,
            min_total_score: 10.0,
            research_ratio: 0.75,
            max_shortlist: 10,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(Path::new("."))
    }

    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("pof.yaml");
        let mut config: PipelineConfig = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            PipelineConfig::default()
        };
        config.workspace_root = workspace_root.to_path_buf();
        if config.database_url.is_empty() {
            let db = workspace_root.join("pof.db");
            config.database_url = format!("sqlite://{}?mode=rwc", db.display());
        }
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(kind) = std::env::var("POF_EMBEDDING_PROVIDER") {
            self.embedding.provider = match kind.as_str() {
                "http" => ProviderKind::Http,
                _ => ProviderKind::Hashing,
            };
        }
        if let Ok(url) = std::env::var("POF_EMBEDDING_URL") {
            self.embedding.url = url;
        }
        if let Ok(key) = std::env::var("POF_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("POF_EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(dims) = std::env::var("POF_EMBEDDING_DIMENSIONS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.embedding.dimensions = dims;
        }
        if let Some(secs) = std::env::var("POF_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.embedding.timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.cluster;
        ensure!(
            (-1.0..=1.0).contains(&c.similarity_threshold),
            "cluster.similarity_threshold must be within [-1, 1]"
        );
        ensure!(c.tie_margin >= 0.0, "cluster.tie_margin must be non-negative");
        ensure!(c.embedding_concurrency >= 1, "cluster.embedding_concurrency must be at least 1");
        ensure!(
            self.lifecycle.staleness_window >= 1,
            "lifecycle.staleness_window must be at least 1"
        );

        let s = &self.scoring;
        let weights = [
            s.weights.active_members,
            s.weights.source_diversity,
            s.weights.sentiment_intensity,
            s.weights.frequency,
            s.current_pass_weight,
            s.prior_pass_weight,
            s.unknown_tag_severity,
        ];
        ensure!(
            weights.iter().all(|w| w.is_finite() && *w >= 0.0),
            "scoring weights must be finite and non-negative"
        );
        ensure!(
            s.sentiment_severity
                .values()
                .chain(s.frequency_cadence.values())
                .all(|v| v.is_finite() && *v >= 0.0),
            "scoring severities and cadences must be finite and non-negative"
        );

        let sl = &self.shortlist;
        ensure!(sl.min_active_members >= 0, "shortlist.min_active_members must be non-negative");
        ensure!(
            (0.0..=1.0).contains(&sl.research_ratio),
            "shortlist.research_ratio must be within [0, 1]"
        );
        ensure!(sl.max_shortlist >= 1, "shortlist.max_shortlist must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&self.extract.reextraction_similarity),
            "extract.reextraction_similarity must be within [0, 1]"
        );
        Ok(())
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn posts_inbox(&self) -> PathBuf {
        self.resolve(&self.inbox_dir).join("posts")
    }

    pub fn extractions_inbox(&self) -> PathBuf {
        self.resolve(&self.inbox_dir).join("extractions")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.resolve(&self.reports_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_observed_pipeline_behaviour() {
        let config = PipelineConfig::default();
        assert_eq!(config.cluster.similarity_threshold, 0.78);
        assert_eq!(config.cluster.tie_margin, 0.02);
        assert_eq!(config.lifecycle.staleness_window, 3);
        assert_eq!(config.shortlist.min_active_members, 8);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("pof.yaml"),
            "database_url: sqlite://custom.db\nlifecycle:\n  staleness_window: 1\nscoring:\n  weights:\n    frequency: 2.5\n",
        )
        .expect("write");

        let config = PipelineConfig::load(dir.path()).expect("load");
        assert_eq!(config.lifecycle.staleness_window, 1);
        assert_eq!(config.scoring.weights.frequency, 2.5);
        assert_eq!(config.scoring.weights.source_diversity, 2.0);
        assert_eq!(config.shortlist.max_shortlist, 10);
        assert_eq!(config.posts_inbox(), dir.path().join("inbox").join("posts"));
    }

    #[test]
    fn negative_weights_are_rejected() {
        let mut config = PipelineConfig::default();
        config.scoring.weights.sentiment_intensity = -1.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.lifecycle.staleness_window = 0;
        assert!(config.validate().is_err());
    }
}
