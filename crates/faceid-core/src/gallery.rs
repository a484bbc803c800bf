//! Embedding gallery — the static reference set of labeled embeddings.
//!
//! Loaded once at startup from a JSON artifact and read-only afterwards.
//! Entry order is the file order and is the matcher's tie-break order.

use crate::types::{GalleryEntry, NO_FACE, UNKNOWN};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery file not found: {0}")]
    NotFound(String),
    #[error("failed to read gallery {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed gallery artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("gallery has no entries")]
    Empty,
    #[error("entry {index} has an empty label")]
    EmptyLabel { index: usize },
    #[error("entry {index} uses reserved label {label:?}")]
    ReservedLabel { index: usize, label: String },
    #[error("entry {index} ({label}) has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("entry {index} ({label}) contains a non-finite value")]
    NonFinite { index: usize, label: String },
}

/// On-disk gallery layout.
#[derive(Deserialize)]
struct GalleryFile {
    #[serde(default)]
    model_version: Option<String>,
    entries: Vec<GalleryEntry>,
}

/// Validated, ordered gallery of labeled embeddings.
#[derive(Debug, Clone)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    dim: usize,
    model_version: Option<String>,
}

impl Gallery {
    /// Build a gallery from entries, enforcing a uniform, non-zero dimension.
    pub fn new(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        let first = entries.first().ok_or(GalleryError::Empty)?;
        let dim = first.embedding.len();

        for (index, entry) in entries.iter().enumerate() {
            if entry.label.trim().is_empty() {
                return Err(GalleryError::EmptyLabel { index });
            }
            if entry.label == NO_FACE || entry.label == UNKNOWN {
                return Err(GalleryError::ReservedLabel {
                    index,
                    label: entry.label.clone(),
                });
            }
            if entry.embedding.len() != dim || dim == 0 {
                return Err(GalleryError::DimensionMismatch {
                    index,
                    label: entry.label.clone(),
                    expected: dim,
                    actual: entry.embedding.len(),
                });
            }
            if entry.embedding.iter().any(|v| !v.is_finite()) {
                return Err(GalleryError::NonFinite {
                    index,
                    label: entry.label.clone(),
                });
            }
        }

        Ok(Self { entries, dim, model_version: None })
    }

    /// Parse a gallery from its JSON artifact text.
    pub fn from_json(text: &str) -> Result<Self, GalleryError> {
        let file: GalleryFile = serde_json::from_str(text)?;
        let mut gallery = Self::new(file.entries)?;
        gallery.model_version = file.model_version;
        Ok(gallery)
    }

    /// Load a gallery artifact from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GalleryError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GalleryError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| GalleryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let gallery = Self::from_json(&text)?;

        tracing::info!(
            path = %path.display(),
            entries = gallery.len(),
            dim = gallery.dim(),
            model_version = ?gallery.model_version,
            "loaded embedding gallery"
        );

        Ok(gallery)
    }

    /// Verify that the gallery matches the embedder's output dimension.
    pub fn ensure_dimension(&self, expected: usize) -> Result<(), GalleryError> {
        if self.dim != expected {
            return Err(GalleryError::DimensionMismatch {
                index: 0,
                label: self.entries[0].label.clone(),
                expected,
                actual: self.dim,
            });
        }
        Ok(())
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }
}
