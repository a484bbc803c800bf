use crate::broker::TransportError;
use crate::config::ConfigError;
use crate::message::MessageError;
use faceid_core::crop::CropError;
use faceid_core::detector::DetectorError;
use faceid_core::recognizer::RecognizerError;
use thiserror::Error;

/// Failure while a stage handles one message.
///
/// Validation failures are the sender's fault and never retried.
/// Configuration failures cannot succeed on retry either. Collaborator and
/// transport failures are retryable: the idempotency claim is released and
/// the delivery is handed back to the broker.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Validation(#[from] MessageError),
    #[error("invalid image: {0}")]
    InvalidImage(#[source] CropError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("face detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("face embedding failed: {0}")]
    Embedder(#[from] RecognizerError),
    #[error("embedding has dimension {actual}, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("failed to encode face crop: {0}")]
    Crop(#[source] CropError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("{failed} of {total} records in the batch failed")]
    BatchFailed { failed: usize, total: usize },
}

impl StageError {
    /// Whether redelivering the same message may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::Detector(_)
                | StageError::Embedder(_)
                | StageError::DimensionMismatch { .. }
                | StageError::Transport(_)
                | StageError::BatchFailed { .. }
        )
    }

    /// HTTP-style status code for the synchronous entry point.
    pub fn status_code(&self) -> u16 {
        match self {
            StageError::Validation(_) | StageError::InvalidImage(_) => 400,
            _ => 500,
        }
    }
}
