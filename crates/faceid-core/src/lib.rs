//! faceid-core — Face identification primitives.
//!
//! Holds the embedding gallery and the nearest-neighbor matcher, plus the
//! detection and embedding collaborators (SCRFD and ArcFace, both running
//! via ONNX Runtime for CPU inference) behind small traits so the pipeline
//! stages can be driven by fakes in tests.

pub mod crop;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use detector::{DetectedFace, FaceDetector, ScrfdDetector};
pub use gallery::Gallery;
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use recognizer::{ArcFaceEmbedder, FaceEmbedder};
pub use types::{BoundingBox, Embedding, GalleryEntry, Outcome};

/// Default directory for ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/faceid/models")
}
