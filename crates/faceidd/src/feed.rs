//! Inbound event source and response sink for the daemon.
//!
//! Requests arrive as JSON lines on stdin and are published onto the
//! inbound topic unchanged; the detection stage validates them. Results
//! from the response channel are written to stdout as JSON lines, so logs
//! go to stderr.

use faceid_pipeline::{Broker, MemoryBroker};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Publish each non-empty stdin line onto `topic` until EOF.
pub async fn publish_stdin(broker: Arc<MemoryBroker>, topic: String) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0usize;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match broker.publish(&topic, line.to_string()) {
            Ok(message_id) => {
                published += 1;
                tracing::debug!(topic = %topic, message_id = %message_id, "request published");
            }
            Err(e) => tracing::error!(topic = %topic, error = %e, "failed to publish request"),
        }
    }

    tracing::info!(published, "stdin closed; no more requests will be read");
    Ok(())
}

/// Write every result on `channel` to stdout, one JSON object per line.
pub async fn write_responses(broker: Arc<MemoryBroker>, channel: String) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    loop {
        let batch = match broker.receive_batch(&channel, 32).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "response channel closed");
                return Ok(());
            }
        };
        for delivery in batch {
            stdout.write_all(delivery.body.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        stdout.flush().await?;
    }
}
