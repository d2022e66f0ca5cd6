//! Contracts for POF's external collaborators: the embedding provider and the inbox
//! bundles written by the fetchers and the extraction layer.

pub mod embedding;
pub mod retry;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pof_core::{Frequency, Post};
use pof_storage::sha256_hex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use embedding::{
    provider_from_settings, EmbeddingError, EmbeddingProvider, EmbeddingSettings,
    FixtureEmbeddingProvider, HashingEmbeddingProvider, HttpEmbeddingProvider, ProviderKind,
};
pub use retry::BackoffPolicy;

pub const CRATE_NAME: &str = "pof-adapters";

/// Posts handed over by a platform fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostBundle {
    #[serde(default)]
    pub source: Option<String>,
    pub posts: Vec<Post>,
}

/// Structured complaints produced by the extraction layer for a batch of posts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionBundle {
    #[serde(default)]
    pub extractor_version: Option<String>,
    pub pain_events: Vec<ExtractedPainEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPainEvent {
    pub post_id: String,
    #[serde(default)]
    pub community: Option<String>,
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub workaround: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub sentiment: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl ExtractedPainEvent {
    /// Unknown cadence labels degrade to `unspecified` instead of failing the bundle.
    pub fn frequency(&self) -> Frequency {
        match self.frequency.as_deref().map(str::trim) {
            None | Some("") => Frequency::Unspecified,
            Some(raw) => raw.to_ascii_lowercase().parse().unwrap_or_else(|_| {
                warn!(post_id = %self.post_id, frequency = raw, "unknown frequency descriptor");
                Frequency::Unspecified
            }),
        }
    }

    pub fn sentiment_tags(&self) -> std::collections::BTreeSet<String> {
        self.sentiment
            .iter()
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// A parsed inbox file together with its content address.
#[derive(Debug, Clone)]
pub struct InboxFile<T> {
    pub path: PathBuf,
    pub content_hash: String,
    pub payload: T,
}

/// JSON files directly under `dir`, in name order. A missing directory is an empty inbox.
pub fn list_inbox(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = fs::read_dir(dir)
        .with_context(|| format!("reading inbox {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().map(|e| e == "json").unwrap_or(false))
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

pub fn load_inbox_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<InboxFile<T>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let payload = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(InboxFile {
        path: path.to_path_buf(),
        content_hash: sha256_hex(&bytes),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn inbox_lists_json_files_in_name_order() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("b.json"), "{}").expect("write");
        fs::write(dir.path().join("a.json"), "{}").expect("write");
        fs::write(dir.path().join("notes.txt"), "skip").expect("write");

        let files = list_inbox(dir.path()).expect("list");
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
        assert!(list_inbox(dir.path().join("missing")).expect("list").is_empty());
    }

    #[test]
    fn extraction_bundle_tolerates_sparse_events() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("batch.json");
        fs::write(
            &path,
            r#"{"pain_events": [
                {"post_id": "p1", "problem": "Exports break", "frequency": "Daily", "sentiment": [" Frustrated ", ""]},
                {"post_id": "p2", "problem": "Slow sync", "frequency": "monthly"},
                {"post_id": "p3"}
            ]}"#,
        )
        .expect("write");

        let file: InboxFile<ExtractionBundle> = load_inbox_file(&path).expect("load");
        let events = &file.payload.pain_events;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].frequency(), Frequency::Daily);
        assert_eq!(events[0].sentiment_tags().into_iter().collect::<Vec<_>>(), vec!["frustrated"]);
        assert_eq!(events[1].frequency(), Frequency::Unspecified);
        assert!(events[2].problem.is_empty());
        assert_eq!(file.content_hash.len(), 64);
    }
}
