//! Similarity-searchable term store.
//!
//! Every curated `source -> target` pair becomes one document whose content is
//! `source=target`, identified by the source term. The whole store lives in
//! memory and is persisted as a single checksummed JSON file.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ai::{Embedder, GeneratorError};
use crate::backup::{write_atomic, BackupError};

pub const STORE_FILE_NAME: &str = "terms.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("term store unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },
    #[error("embedding request failed: {0}")]
    Embedding(#[from] GeneratorError),
    #[error("embedding has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("failed to serialize term store: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write term store: {0}")]
    Write(#[from] BackupError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermDocument {
    /// Source-language term; unique within the store.
    pub id: String,
    /// `source=target`.
    pub content: String,
    pub embedding: Vec<f32>,
}

impl TermDocument {
    pub fn content_for(source: &str, target: &str) -> String {
        format!("{source}={target}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument<'a> {
    pub document: &'a TermDocument,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub skipped_empty: usize,
    pub batches: usize,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    format_version: u32,
    dimensions: Option<usize>,
    checksum: String,
    documents: Vec<TermDocument>,
}

#[derive(Debug, Default)]
pub struct TermStore {
    documents: BTreeMap<String, TermDocument>,
    dimensions: Option<usize>,
}

impl TermStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn get(&self, id: &str) -> Option<&TermDocument> {
        self.documents.get(id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &TermDocument> {
        self.documents.values()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        self.dimensions = None;
    }

    /// Inserts or replaces the document with the same identity. Returns the
    /// replaced document, if any.
    pub fn upsert(&mut self, document: TermDocument) -> Result<Option<TermDocument>, StoreError> {
        let actual = document.embedding.len();
        match self.dimensions {
            Some(expected) if expected != actual => {
                return Err(StoreError::DimensionMismatch { expected, actual })
            }
            _ => self.dimensions = Some(actual),
        }

        let previous = self.delete(&document.id);
        self.documents.insert(document.id.clone(), document);
        Ok(previous)
    }

    pub fn delete(&mut self, id: &str) -> Option<TermDocument> {
        let removed = self.documents.remove(id);
        if self.documents.is_empty() {
            self.dimensions = None;
        }
        removed
    }

    /// Indexes a curated translation map. Entries are embedded in batches of
    /// at most `batch_size` so a single embedding request stays under the
    /// provider's payload limit. Entries with an empty source are skipped.
    pub async fn rebuild<I>(
        &mut self,
        curated: I,
        embedder: &dyn Embedder,
        batch_size: usize,
    ) -> Result<RebuildSummary, StoreError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut summary = RebuildSummary::default();
        let mut pending: Vec<(String, String)> = Vec::new();
        for (source, target) in curated {
            if source.trim().is_empty() {
                summary.skipped_empty += 1;
                continue;
            }
            let content = TermDocument::content_for(&source, &target);
            pending.push((source, content));
        }

        let batch_size = batch_size.max(1);
        let total = pending.len();
        for batch in pending.chunks(batch_size) {
            let contents: Vec<String> = batch.iter().map(|(_, content)| content.clone()).collect();
            let embeddings = embedder.embed(&contents).await?;
            if embeddings.len() != batch.len() {
                return Err(StoreError::Embedding(GeneratorError::InvalidResponse(format!(
                    "expected {} embeddings, received {}",
                    batch.len(),
                    embeddings.len()
                ))));
            }

            for ((id, content), embedding) in batch.iter().cloned().zip(embeddings) {
                let replaced = self.upsert(TermDocument {
                    id,
                    content,
                    embedding,
                })?;
                if replaced.is_some() {
                    summary.replaced += 1;
                } else {
                    summary.inserted += 1;
                }
            }

            summary.batches += 1;
            debug!(
                "indexed batch {} ({}/{} terms)",
                summary.batches,
                summary.inserted + summary.replaced,
                total
            );
        }

        info!(
            "term store rebuilt: {} inserted, {} replaced, {} skipped",
            summary.inserted, summary.replaced, summary.skipped_empty
        );
        Ok(summary)
    }

    /// Returns up to `k` documents scoring strictly above `floor`, most
    /// similar first.
    pub fn nearest(&self, query: &[f32], k: usize, floor: f32) -> Vec<ScoredDocument<'_>> {
        if k == 0 || self.documents.is_empty() {
            return Vec::new();
        }
        if self.dimensions != Some(query.len()) {
            warn!(
                "query embedding has {} dimensions but the store holds {:?}; was the index built with another embedding model?",
                query.len(),
                self.dimensions
            );
            return Vec::new();
        }

        let mut scored: Vec<ScoredDocument<'_>> = self
            .documents
            .values()
            .map(|document| ScoredDocument {
                document,
                score: cosine_similarity(query, &document.embedding),
            })
            .filter(|scored| scored.score > floor)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        scored.truncate(k);
        scored
    }

    pub fn persist(&self, dir: &Path) -> Result<PathBuf, StoreError> {
        let documents: Vec<TermDocument> = self.documents.values().cloned().collect();
        let file = StoreFile {
            format_version: FORMAT_VERSION,
            dimensions: self.dimensions,
            checksum: checksum(&documents),
            documents,
        };

        let path = dir.join(STORE_FILE_NAME);
        let bytes = serde_json::to_vec(&file)?;
        write_atomic(&path, &bytes)?;
        info!("term store persisted to {} ({} terms)", path.display(), self.len());
        Ok(path)
    }

    /// Opens a persisted store. Missing, unreadable or tampered files are
    /// reported as [`StoreError::Unavailable`].
    pub fn load(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(STORE_FILE_NAME);
        let unavailable = |reason: String| StoreError::Unavailable {
            path: path.clone(),
            reason,
        };

        if !path.is_file() {
            return Err(unavailable("store file does not exist".into()));
        }

        let bytes = fs::read(&path).map_err(|err| unavailable(err.to_string()))?;
        let file: StoreFile = serde_json::from_slice(&bytes)
            .map_err(|err| unavailable(format!("corrupt store file: {err}")))?;

        if file.format_version != FORMAT_VERSION {
            return Err(unavailable(format!(
                "unsupported format version {}",
                file.format_version
            )));
        }
        if checksum(&file.documents) != file.checksum {
            return Err(unavailable("checksum mismatch".into()));
        }

        let mut store = TermStore::new();
        for document in file.documents {
            if file.dimensions != Some(document.embedding.len()) {
                return Err(unavailable(format!(
                    "document '{}' has {} dimensions, header says {:?}",
                    document.id,
                    document.embedding.len(),
                    file.dimensions
                )));
            }
            store
                .upsert(document)
                .map_err(|err| unavailable(err.to_string()))?;
        }

        info!("term store loaded from {} ({} terms)", path.display(), store.len());
        Ok(store)
    }
}

fn checksum(documents: &[TermDocument]) -> String {
    let mut hasher = Sha256::new();
    for document in documents {
        hasher.update(document.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(document.content.as_bytes());
        hasher.update([0u8]);
        for value in &document.embedding {
            hasher.update(value.to_le_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
