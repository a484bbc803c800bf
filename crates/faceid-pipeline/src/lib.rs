//! faceid-pipeline — Two-stage asynchronous identification pipeline.
//!
//! The detection stage turns a raw image request into either a `No-Face`
//! result or a face-crop message; the recognition stage turns face-crop
//! messages into identification results. Stages only talk through a
//! [`Broker`], which is assumed to deliver at least once and in no
//! particular order, so both stages suppress duplicates with an
//! [`IdempotencyGuard`].

pub mod broker;
pub mod config;
pub mod detection;
pub mod error;
pub mod idempotency;
pub mod message;
pub mod recognition;

pub use broker::{Broker, Delivery, MemoryBroker, MessageId, TransportError};
pub use config::{ChannelConfig, ConfigError};
pub use detection::{DetectionOutcome, DetectionStage, InvocationResponse};
pub use error::StageError;
pub use idempotency::{Claim, GuardConfig, IdempotencyGuard};
pub use message::{FaceCropMessage, IdentificationResult, MessageError, Request};
pub use recognition::{BatchReport, ItemFailure, RecognitionStage};
