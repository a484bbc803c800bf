use anyhow::Result;
use faceid_core::{ArcFaceEmbedder, Gallery, ScrfdDetector};
use faceid_pipeline::{DetectionStage, IdempotencyGuard, MemoryBroker, RecognitionStage};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod feed;
mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("faceidd starting");

    // Fail fast: configuration, gallery and models before serving anything.
    let config = config::Config::load()?;
    let gallery = Arc::new(Gallery::load(&config.gallery_path)?);
    let detector = ScrfdDetector::load(&config.scrfd_model_path())?;
    let embedder = ArcFaceEmbedder::load(&config.arcface_model_path())?;

    let broker = Arc::new(MemoryBroker::new(
        [
            config.topic.clone(),
            config.crop_channel.clone(),
            config.response_channel.clone(),
        ],
        config.max_receives,
    ));

    // One guard per stage worker; never shared between them.
    let detection = DetectionStage::new(
        detector,
        Arc::new(IdempotencyGuard::new(config.guard_config())),
        broker.clone(),
        config.channels(),
    );
    let recognition = RecognitionStage::with_max_distance(
        embedder,
        config.max_distance,
        gallery,
        Arc::new(IdempotencyGuard::new(config.guard_config())),
        broker.clone(),
        config.channels(),
    )?;

    if config.max_distance.is_none() {
        tracing::warn!("FACEID_MAX_DISTANCE unset; every face will match its nearest gallery entry");
    }

    worker::spawn_detection_worker(detection, broker.clone(), config.topic.clone())?;
    worker::spawn_recognition_worker(
        recognition,
        broker.clone(),
        config.crop_channel.clone(),
        config.batch_size,
    )?;

    tokio::spawn(feed::publish_stdin(broker.clone(), config.topic.clone()));
    tokio::spawn(feed::write_responses(broker.clone(), config.response_channel.clone()));

    tracing::info!(
        topic = %config.topic,
        crops = %config.crop_channel,
        responses = %config.response_channel,
        "faceidd ready"
    );

    tokio::signal::ctrl_c().await?;
    let dead = broker.dead_letters();
    if !dead.is_empty() {
        tracing::warn!(count = dead.len(), "exiting with dead-lettered messages");
    }
    tracing::info!("faceidd shutting down");

    Ok(())
}
