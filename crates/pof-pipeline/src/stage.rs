use std::fmt;
use std::str::FromStr;

use pof_storage::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Filter,
    Extract,
    Cluster,
    Score,
    Shortlist,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Fetch,
        Stage::Filter,
        Stage::Extract,
        Stage::Cluster,
        Stage::Score,
        Stage::Shortlist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Filter => "filter",
            Stage::Extract => "extract",
            Stage::Cluster => "cluster",
            Stage::Score => "score",
            Stage::Shortlist => "shortlist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage `{s}`"))
    }
}

/// Which stages a run executes: the full chain or a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageSelector {
    #[default]
    All,
    Only(Stage),
}

impl StageSelector {
    pub fn stages(&self) -> Vec<Stage> {
        match self {
            StageSelector::All => Stage::ALL.to_vec(),
            StageSelector::Only(stage) => vec![*stage],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageSelector::All => "all",
            StageSelector::Only(stage) => stage.as_str(),
        }
    }
}

impl FromStr for StageSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            Ok(StageSelector::All)
        } else {
            s.parse().map(StageSelector::Only)
        }
    }
}

/// Failure of a whole stage. Per-item problems never surface here; they are counted in the
/// stage report.
#[derive(Debug, Error)]
pub enum StageError {
    /// A dependency the stage cannot work without is down. Retried with backoff.
    #[error("{stage} stage dependency unavailable: {message}")]
    Unavailable { stage: Stage, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Unavailable { .. })
    }
}
