//! Detection stage worker.
//!
//! Consumes raw image requests and emits exactly one of: an
//! `IdentificationResult` with outcome `No-Face` on the response channel,
//! or a `FaceCropMessage` on the crop channel. Duplicate deliveries of a
//! request id emit nothing.

use crate::broker::{Broker, MessageId};
use crate::config::ChannelConfig;
use crate::error::StageError;
use crate::idempotency::IdempotencyGuard;
use crate::message::{FaceCropMessage, IdentificationResult, Request};
use faceid_core::crop;
use faceid_core::{FaceDetector, Outcome};
use serde_json::json;
use std::sync::Arc;

/// What the stage did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// No face found; a `No-Face` result was sent to the response channel.
    NoFace,
    /// A face crop was forwarded to the recognition stage.
    Forwarded { message_id: MessageId },
    /// The request id was already processed (or in flight); nothing emitted.
    Duplicate,
}

/// Response of the synchronous entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

impl InvocationResponse {
    fn ok(body: serde_json::Value) -> Self {
        Self { status_code: 200, body }
    }

    fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            body: json!({ "error": message.into() }),
        }
    }
}

pub struct DetectionStage<D> {
    detector: D,
    guard: Arc<IdempotencyGuard>,
    broker: Arc<dyn Broker>,
    channels: ChannelConfig,
}

impl<D: FaceDetector> DetectionStage<D> {
    pub fn new(
        detector: D,
        guard: Arc<IdempotencyGuard>,
        broker: Arc<dyn Broker>,
        channels: ChannelConfig,
    ) -> Self {
        Self { detector, guard, broker, channels }
    }

    /// Handle one validated request.
    ///
    /// Retryable errors leave the request id unclaimed so the broker's
    /// redelivery can try again; every other outcome marks it processed.
    pub fn handle_request(&mut self, req: Request) -> Result<DetectionOutcome, StageError> {
        let crop_channel = self.channels.crop_channel()?.to_string();
        let response_channel = self.channels.response_channel()?.to_string();

        let Some(claim) = self.guard.claim(&req.request_id) else {
            tracing::info!(request_id = %req.request_id, "duplicate request suppressed");
            return Ok(DetectionOutcome::Duplicate);
        };

        tracing::info!(request_id = %req.request_id, filename = %req.filename, "processing request");
        let result = self.process(req, &crop_channel, &response_channel);

        match &result {
            Err(e) if e.is_retryable() => drop(claim),
            _ => claim.commit(),
        }
        result
    }

    /// Handle a queued request body.
    pub fn handle_message(&mut self, body: &str) -> Result<DetectionOutcome, StageError> {
        let req = Request::parse(body)?;
        self.handle_request(req)
    }

    /// Synchronous entry point: always answers with a status code and a
    /// JSON body, `{"error": ...}` on failure.
    pub fn handle_invocation(&mut self, body: Option<&str>) -> InvocationResponse {
        let Some(body) = body.filter(|b| !b.trim().is_empty()) else {
            tracing::debug!("no event body");
            return InvocationResponse::error(400, "Missing request body");
        };

        let req = match Request::parse(body) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!(error = %e, "rejecting request");
                return InvocationResponse::error(400, e.to_string());
            }
        };
        let request_id = req.request_id.clone();

        match self.handle_request(req) {
            Ok(DetectionOutcome::NoFace) => InvocationResponse::ok(json!({
                "message": "No face detected",
                "request_id": request_id,
            })),
            Ok(DetectionOutcome::Forwarded { message_id }) => InvocationResponse::ok(json!({
                "message": "Face detected and forwarded",
                "request_id": request_id,
                "message_id": message_id,
            })),
            Ok(DetectionOutcome::Duplicate) => InvocationResponse::ok(json!({
                "message": "Duplicate request suppressed",
                "request_id": request_id,
            })),
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "detection failed");
                InvocationResponse::error(e.status_code(), e.to_string())
            }
        }
    }

    fn process(
        &mut self,
        req: Request,
        crop_channel: &str,
        response_channel: &str,
    ) -> Result<DetectionOutcome, StageError> {
        let image = crop::decode_rgb(&req.image_bytes).map_err(StageError::InvalidImage)?;
        tracing::debug!(
            request_id = %req.request_id,
            width = image.width(),
            height = image.height(),
            "decoded image"
        );

        let Some(face) = self.detector.detect(&image)? else {
            tracing::info!(request_id = %req.request_id, "no face detected, sending No-Face result");
            let result = IdentificationResult::new(req.request_id, Outcome::NoFace);
            self.broker.publish(response_channel, result.to_json())?;
            return Ok(DetectionOutcome::NoFace);
        };

        tracing::debug!(
            request_id = %req.request_id,
            confidence = face.confidence,
            "face detected"
        );

        let normalized = crop::normalize_crop(&face.crop).map_err(StageError::Crop)?;
        let face_image_bytes = crop::encode_jpeg(&normalized).map_err(StageError::Crop)?;

        let message = FaceCropMessage {
            request_id: req.request_id,
            filename: Some(req.filename),
            face_image_bytes,
        };
        let message_id = self.broker.publish(crop_channel, message.to_json())?;
        tracing::info!(
            request_id = %message.request_id,
            message_id = %message_id,
            "face crop forwarded"
        );

        Ok(DetectionOutcome::Forwarded { message_id })
    }
}
