//! Recognition stage worker.
//!
//! Consumes batches of face-crop records. Each record is handled on its
//! own: malformed records are skipped, duplicates suppressed, and records
//! whose embedding or publish failed are reported back by message id so
//! only they are redelivered.

use crate::broker::{Broker, Delivery, MessageId};
use crate::config::ChannelConfig;
use crate::error::StageError;
use crate::idempotency::IdempotencyGuard;
use crate::message::{FaceCropMessage, IdentificationResult};
use faceid_core::crop;
use faceid_core::gallery::GalleryError;
use faceid_core::{EuclideanMatcher, FaceEmbedder, Gallery, Matcher};
use std::sync::Arc;

/// A record whose processing failed and should be redelivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub message_id: MessageId,
    pub error: String,
}

/// Per-batch accounting.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    /// Results emitted, in batch order.
    pub identified: Vec<IdentificationResult>,
    /// Malformed or invalid records dropped without retry.
    pub skipped: usize,
    pub duplicates: usize,
    pub failures: Vec<ItemFailure>,
}

impl BatchReport {
    pub fn failed_message_ids(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.message_id.as_str())
    }

    /// Collapse into all-or-nothing semantics for transports without
    /// partial batch failure support.
    pub fn into_result(self) -> Result<Self, StageError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(StageError::BatchFailed {
                failed: self.failures.len(),
                total: self.total,
            })
        }
    }
}

pub struct RecognitionStage<E, M = EuclideanMatcher> {
    embedder: E,
    matcher: M,
    gallery: Arc<Gallery>,
    guard: Arc<IdempotencyGuard>,
    broker: Arc<dyn Broker>,
    channels: ChannelConfig,
}

impl<E: FaceEmbedder, M: Matcher> RecognitionStage<E, M> {
    /// Fails if the gallery dimension differs from the embedder's output.
    pub fn new(
        embedder: E,
        matcher: M,
        gallery: Arc<Gallery>,
        guard: Arc<IdempotencyGuard>,
        broker: Arc<dyn Broker>,
        channels: ChannelConfig,
    ) -> Result<Self, GalleryError> {
        gallery.ensure_dimension(embedder.dimension())?;
        Ok(Self { embedder, matcher, gallery, guard, broker, channels })
    }

    /// Process a batch of face-crop deliveries.
    ///
    /// Only a missing response channel fails the whole batch; everything
    /// else is isolated per record.
    pub fn handle_batch(&mut self, records: &[Delivery]) -> Result<BatchReport, StageError> {
        let response_channel = self.channels.response_channel()?.to_string();
        let mut report = BatchReport { total: records.len(), ..Default::default() };

        for record in records {
            let message = match FaceCropMessage::parse(&record.body) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(message_id = %record.message_id, error = %e, "skipping malformed record");
                    report.skipped += 1;
                    continue;
                }
            };
            let request_id = message.request_id.clone();
            tracing::debug!(request_id = %request_id, message_id = %record.message_id, "processing record");

            match self.handle_record(message, &response_channel) {
                Ok(Some(result)) => report.identified.push(result),
                Ok(None) => report.duplicates += 1,
                Err(e) if e.is_retryable() => {
                    tracing::error!(request_id = %request_id, message_id = %record.message_id, error = %e, "record failed");
                    report.failures.push(ItemFailure {
                        message_id: record.message_id.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(request_id = %request_id, error = %e, "dropping invalid record");
                    report.skipped += 1;
                }
            }
        }

        tracing::info!(
            total = report.total,
            identified = report.identified.len(),
            skipped = report.skipped,
            duplicates = report.duplicates,
            failed = report.failures.len(),
            "batch complete"
        );
        Ok(report)
    }

    /// Returns `Ok(None)` for a suppressed duplicate.
    fn handle_record(
        &mut self,
        message: FaceCropMessage,
        response_channel: &str,
    ) -> Result<Option<IdentificationResult>, StageError> {
        let Some(claim) = self.guard.claim(&message.request_id) else {
            tracing::info!(request_id = %message.request_id, "duplicate record suppressed");
            return Ok(None);
        };

        let result = self.identify(message, response_channel);
        match &result {
            Err(e) if e.is_retryable() => drop(claim),
            _ => claim.commit(),
        }
        result.map(Some)
    }

    fn identify(
        &mut self,
        message: FaceCropMessage,
        response_channel: &str,
    ) -> Result<IdentificationResult, StageError> {
        let face = crop::decode_rgb(&message.face_image_bytes).map_err(StageError::InvalidImage)?;
        let embedding = self.embedder.embed(&face)?;
        if embedding.dim() != self.gallery.dim() {
            return Err(StageError::DimensionMismatch {
                expected: self.gallery.dim(),
                actual: embedding.dim(),
            });
        }

        let matched = self.matcher.compare(&embedding, &self.gallery);
        tracing::debug!(
            request_id = %message.request_id,
            distance = ?matched.distance,
            outcome = %matched.outcome,
            "matched embedding"
        );

        let result = IdentificationResult::new(message.request_id, matched.outcome);
        self.broker.publish(response_channel, result.to_json())?;
        tracing::info!(request_id = %result.request_id, outcome = %result.outcome, "identification sent");
        Ok(result)
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }
}

impl<E: FaceEmbedder> RecognitionStage<E, EuclideanMatcher> {
    /// Shorthand with the Euclidean matcher and an optional distance cutoff.
    pub fn with_max_distance(
        embedder: E,
        max_distance: Option<f32>,
        gallery: Arc<Gallery>,
        guard: Arc<IdempotencyGuard>,
        broker: Arc<dyn Broker>,
        channels: ChannelConfig,
    ) -> Result<Self, GalleryError> {
        Self::new(embedder, EuclideanMatcher::new(max_distance), gallery, guard, broker, channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use faceid_core::recognizer::RecognizerError;
    use faceid_core::{Embedding, GalleryEntry, Outcome};
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;

    const RESPONSES: &str = "responses";

    fn outcomes(report: &BatchReport) -> Vec<(&str, &Outcome)> {
        report
            .identified
            .iter()
            .map(|r| (r.request_id.as_str(), &r.outcome))
            .collect()
    }

    /// Embeds a crop as `[r, g] / 25.5` of its top-left pixel, so black maps
    /// near `[0, 0]` and white near `[10, 10]`.
    #[derive(Default)]
    struct ColorEmbedder {
        fail_for_red: bool,
        calls: usize,
    }

    impl FaceEmbedder for ColorEmbedder {
        fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
            self.calls += 1;
            let [r, g, _] = face.get_pixel(0, 0).0;
            if self.fail_for_red && r > 200 && g < 50 {
                return Err(RecognizerError::InferenceFailed("red faces crash the model".into()));
            }
            Ok(Embedding::new(vec![r as f32 / 25.5, g as f32 / 25.5]))
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn gallery() -> Arc<Gallery> {
        Arc::new(
            Gallery::new(vec![
                GalleryEntry::new("alice", vec![0.0, 0.0]),
                GalleryEntry::new("bob", vec![10.0, 10.0]),
            ])
            .unwrap(),
        )
    }

    fn stage(embedder: ColorEmbedder) -> (RecognitionStage<ColorEmbedder>, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new([RESPONSES], 5));
        let stage = RecognitionStage::with_max_distance(
            embedder,
            None,
            gallery(),
            Arc::new(IdempotencyGuard::default()),
            broker.clone(),
            ChannelConfig { crop_channel: None, response_channel: Some(RESPONSES.into()) },
        )
        .unwrap();
        (stage, broker)
    }

    fn record(message_id: &str, request_id: &str, color: [u8; 3]) -> Delivery {
        let face = crop::encode_jpeg(&RgbImage::from_pixel(16, 16, Rgb(color))).unwrap();
        let msg = FaceCropMessage {
            request_id: request_id.into(),
            filename: None,
            face_image_bytes: face,
        };
        Delivery::new(message_id, msg.to_json())
    }

    #[test]
    fn test_batch_identifies_each_record() {
        let (mut stage, broker) = stage(ColorEmbedder::default());
        let report = stage
            .handle_batch(&[record("m1", "r1", [0, 0, 0]), record("m2", "r2", [255, 255, 255])])
            .unwrap();

        assert_eq!(
            outcomes(&report),
            vec![
                ("r1", &Outcome::Identity("alice".into())),
                ("r2", &Outcome::Identity("bob".into())),
            ]
        );
        let sent = broker.try_receive_batch(RESPONSES, 10).unwrap();
        assert_eq!(sent.len(), 2);
        let first = IdentificationResult::parse(&sent[0].body).unwrap();
        assert_eq!(first, IdentificationResult::new("r1", Outcome::Identity("alice".into())));
    }

    #[test]
    fn test_malformed_record_does_not_block_siblings() {
        let (mut stage, _broker) = stage(ColorEmbedder::default());
        let bad = Delivery::new("m2", r#"{"face_image":"AAEC"}"#);
        let report = stage
            .handle_batch(&[record("m1", "r1", [0, 0, 0]), bad, record("m3", "r3", [255, 255, 255])])
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert!(report.failures.is_empty());
        let ids: Vec<_> = report.identified.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r3"]);
    }

    #[test]
    fn test_non_json_record_is_skipped() {
        let (mut stage, _broker) = stage(ColorEmbedder::default());
        let report = stage.handle_batch(&[Delivery::new("m1", "not json")]).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(stage.embedder.calls, 0);
    }

    #[test]
    fn test_embedding_failure_reported_per_record() {
        let (mut stage, broker) = stage(ColorEmbedder { fail_for_red: true, calls: 0 });
        let report = stage
            .handle_batch(&[
                record("m1", "r1", [0, 0, 0]),
                record("m2", "r2", [255, 0, 0]),
                record("m3", "r3", [255, 255, 255]),
            ])
            .unwrap();

        assert_eq!(report.failed_message_ids().collect::<Vec<_>>(), vec!["m2"]);
        assert_eq!(report.identified.len(), 2);
        assert_eq!(broker.try_receive_batch(RESPONSES, 10).unwrap().len(), 2);
        // The failed request id stays unclaimed for redelivery.
        assert!(!stage.guard.seen("r2"));
        assert!(stage.guard.seen("r1"));

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, StageError::BatchFailed { failed: 1, total: 3 }));
    }

    #[test]
    fn test_duplicate_records_suppressed() {
        let (mut stage, broker) = stage(ColorEmbedder::default());
        let report = stage
            .handle_batch(&[record("m1", "r1", [0, 0, 0]), record("m2", "r1", [0, 0, 0])])
            .unwrap();
        assert_eq!(report.identified.len(), 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(stage.embedder.calls, 1);

        // Redelivery in a later batch is suppressed too.
        let report = stage.handle_batch(&[record("m1", "r1", [0, 0, 0])]).unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(broker.try_receive_batch(RESPONSES, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_undecodable_face_is_skipped_not_retried() {
        let (mut stage, _broker) = stage(ColorEmbedder::default());
        let msg = FaceCropMessage {
            request_id: "r1".into(),
            filename: None,
            face_image_bytes: b"garbage".to_vec(),
        };
        let report = stage.handle_batch(&[Delivery::new("m1", msg.to_json())]).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_missing_response_channel_fails_batch() {
        let mut stage = RecognitionStage::with_max_distance(
            ColorEmbedder::default(),
            None,
            gallery(),
            Arc::new(IdempotencyGuard::default()),
            Arc::new(MemoryBroker::new([RESPONSES], 5)),
            ChannelConfig::default(),
        )
        .unwrap();
        let err = stage.handle_batch(&[record("m1", "r1", [0, 0, 0])]).unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(!err.is_retryable());
        assert_eq!(stage.embedder.calls, 0);
    }

    #[test]
    fn test_max_distance_maps_to_unknown() {
        let broker = Arc::new(MemoryBroker::new([RESPONSES], 5));
        let mut stage = RecognitionStage::with_max_distance(
            ColorEmbedder::default(),
            Some(1.0),
            gallery(),
            Arc::new(IdempotencyGuard::default()),
            broker,
            ChannelConfig::new("crops", RESPONSES),
        )
        .unwrap();
        // Mid-grey embeds near [5, 5]: far from both entries.
        let report = stage.handle_batch(&[record("m1", "r1", [128, 128, 128])]).unwrap();
        assert_eq!(report.identified[0].outcome, Outcome::Unknown);
    }

    #[test]
    fn test_gallery_dimension_checked_at_construction() {
        struct WideEmbedder;
        impl FaceEmbedder for WideEmbedder {
            fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, RecognizerError> {
                Ok(Embedding::new(vec![0.0; 512]))
            }
            fn dimension(&self) -> usize {
                512
            }
        }
        let result = RecognitionStage::with_max_distance(
            WideEmbedder,
            None,
            gallery(),
            Arc::new(IdempotencyGuard::default()),
            Arc::new(MemoryBroker::new([RESPONSES], 5)),
            ChannelConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_every_record_gets_one_outcome() {
        let (mut stage, broker) = stage(ColorEmbedder::default());
        let records: Vec<_> = (0..6)
            .map(|i| record(&format!("m{i}"), &format!("r{i}"), [i * 40, i * 40, i * 40]))
            .collect();
        stage.handle_batch(&records).unwrap();
        let sent: HashSet<String> = broker
            .try_receive_batch(RESPONSES, 100)
            .unwrap()
            .into_iter()
            .map(|d| IdentificationResult::parse(&d.body).unwrap().request_id)
            .collect();
        assert_eq!(sent.len(), 6);
    }
}
