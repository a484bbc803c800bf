//! Stage worker threads.
//!
//! Each stage owns its collaborators and runs on a dedicated OS thread,
//! since inference is synchronous and may be slow. Workers pull from the
//! broker, and hand retryable failures back with a nack so the message is
//! redelivered.

use faceid_core::{FaceDetector, FaceEmbedder, Matcher};
use faceid_pipeline::{Delivery, DetectionStage, MemoryBroker, RecognitionStage};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Spawn the detection stage, consuming one request at a time from `topic`.
pub fn spawn_detection_worker<D>(
    mut stage: DetectionStage<D>,
    broker: Arc<MemoryBroker>,
    topic: String,
) -> std::io::Result<JoinHandle<()>>
where
    D: FaceDetector + Send + 'static,
{
    std::thread::Builder::new()
        .name("faceid-detect".into())
        .spawn(move || {
            tracing::info!(topic = %topic, "detection worker started");
            loop {
                let batch = match broker.receive_batch_blocking(&topic, 1) {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(error = %e, "detection worker stopping");
                        break;
                    }
                };
                for delivery in batch {
                    match stage.handle_message(&delivery.body) {
                        Ok(outcome) => {
                            tracing::debug!(message_id = %delivery.message_id, ?outcome, "request handled");
                        }
                        Err(e) if e.is_retryable() => {
                            tracing::warn!(message_id = %delivery.message_id, error = %e, "request failed; redelivering");
                            redeliver(&broker, &topic, delivery);
                        }
                        Err(e) => {
                            tracing::error!(message_id = %delivery.message_id, error = %e, "request rejected");
                        }
                    }
                }
            }
            tracing::info!("detection worker exiting");
        })
}

/// Spawn the recognition stage, consuming batches of up to `batch_size`.
pub fn spawn_recognition_worker<E, M>(
    mut stage: RecognitionStage<E, M>,
    broker: Arc<MemoryBroker>,
    channel: String,
    batch_size: usize,
) -> std::io::Result<JoinHandle<()>>
where
    E: FaceEmbedder + Send + 'static,
    M: Matcher + Send + 'static,
{
    std::thread::Builder::new()
        .name("faceid-recognize".into())
        .spawn(move || {
            tracing::info!(channel = %channel, batch_size, "recognition worker started");
            loop {
                let batch = match broker.receive_batch_blocking(&channel, batch_size) {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(error = %e, "recognition worker stopping");
                        break;
                    }
                };
                match stage.handle_batch(&batch) {
                    Ok(report) => {
                        let failed: HashSet<&str> = report.failed_message_ids().collect();
                        for delivery in batch.iter().filter(|d| failed.contains(d.message_id.as_str())) {
                            redeliver(&broker, &channel, delivery.clone());
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, records = batch.len(), "batch failed");
                        if e.is_retryable() {
                            for delivery in batch {
                                redeliver(&broker, &channel, delivery);
                            }
                        }
                    }
                }
            }
            tracing::info!("recognition worker exiting");
        })
}

fn redeliver(broker: &MemoryBroker, channel: &str, delivery: Delivery) {
    if let Err(e) = broker.nack(channel, delivery) {
        tracing::error!(channel, error = %e, "failed to hand delivery back");
    }
}
