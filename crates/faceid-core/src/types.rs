use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome string emitted when the detector finds no face.
pub const NO_FACE: &str = "No-Face";
/// Outcome string emitted when the matcher rejects every gallery entry.
pub const UNKNOWN: &str = "unknown";

/// Bounding box of a detected face in source image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.distance_to(&other.values)
    }

    /// Euclidean distance to a raw vector (e.g. a gallery entry).
    pub fn distance_to(&self, other: &[f32]) -> f32 {
        self.values
            .iter()
            .zip(other.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A labeled reference embedding in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub label: String,
    pub embedding: Vec<f32>,
}

impl GalleryEntry {
    pub fn new(label: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self { label: label.into(), embedding }
    }
}

/// Terminal identification outcome for one request.
///
/// On the wire this is a bare string: `"No-Face"`, `"unknown"`, or the
/// matched gallery label. The gallery loader rejects labels that collide
/// with the two reserved values, so the mapping is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Outcome {
    NoFace,
    Identity(String),
    Unknown,
}

impl Outcome {
    pub fn as_str(&self) -> &str {
        match self {
            Outcome::NoFace => NO_FACE,
            Outcome::Identity(label) => label,
            Outcome::Unknown => UNKNOWN,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Outcome> for String {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Identity(label) => label,
            other => other.as_str().to_string(),
        }
    }
}

impl From<String> for Outcome {
    fn from(s: String) -> Self {
        match s.as_str() {
            NO_FACE => Outcome::NoFace,
            UNKNOWN => Outcome::Unknown,
            _ => Outcome::Identity(s),
        }
    }
}
