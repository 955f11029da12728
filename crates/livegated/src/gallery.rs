use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use livegate_core::{Identity, IdentityResolver, SubjectId};

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid gallery {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One enrolled subject: `{ "subject": "alice", "embedding": [..] }`.
#[derive(Debug, Clone, Deserialize)]
pub struct GalleryEntry {
    pub subject: SubjectId,
    pub embedding: Vec<f32>,
}

/// Nearest-neighbour matcher over enrolled embeddings.
#[derive(Debug)]
pub struct GalleryResolver {
    entries: Vec<GalleryEntry>,
    tolerance: f32,
    min_accuracy: f32,
}

impl GalleryResolver {
    pub fn new(entries: Vec<GalleryEntry>, tolerance: f32, min_accuracy: f32) -> Self {
        Self {
            entries,
            tolerance,
            min_accuracy,
        }
    }

    pub fn load(path: &Path, tolerance: f32, min_accuracy: f32) -> Result<Self, GalleryError> {
        let text = std::fs::read_to_string(path).map_err(|source| GalleryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<GalleryEntry> =
            serde_json::from_str(&text).map_err(|source| GalleryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::info!(path = %path.display(), subjects = entries.len(), "gallery loaded");
        Ok(Self::new(entries, tolerance, min_accuracy))
    }

    pub fn subject_count(&self) -> usize {
        self.entries.len()
    }
}

impl IdentityResolver for GalleryResolver {
    fn resolve(&self, embedding: &[f32]) -> Identity {
        let nearest = self
            .entries
            .iter()
            .filter(|e| e.embedding.len() == embedding.len() && !embedding.is_empty())
            .map(|e| (e, euclidean(&e.embedding, embedding)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let Some((entry, distance)) = nearest else {
            return Identity::Unknown;
        };
        let accuracy = (1.0 - distance) * 100.0;
        if distance > self.tolerance || accuracy < self.min_accuracy {
            return Identity::Unknown;
        }
        Identity::Known {
            subject: entry.subject.clone(),
            accuracy,
        }
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
