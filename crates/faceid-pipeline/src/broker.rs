//! Message broker abstraction and an in-memory at-least-once implementation.
//!
//! Stages only publish through [`Broker`]; consuming is driven by whoever
//! owns the worker loop. [`MemoryBroker`] keeps one unbounded tokio channel
//! per named queue. A consumer that fails a delivery hands it back with
//! [`MemoryBroker::nack`], which redelivers it until `max_receives` is
//! reached and then parks it in the dead-letter list.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

pub type MessageId = String;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("channel closed: {0}")]
    Closed(String),
}

/// Outbound side of the message transport.
pub trait Broker: Send + Sync {
    /// Enqueue `body` on `channel`, returning the broker's message id.
    fn publish(&self, channel: &str, body: String) -> Result<MessageId, TransportError>;
}

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub body: String,
    /// How many times this message has been handed to a consumer.
    pub receive_count: u32,
}

impl Delivery {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            receive_count: 0,
        }
    }
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

/// In-process broker with named queues and redelivery.
pub struct MemoryBroker {
    queues: HashMap<String, MemoryQueue>,
    max_receives: u32,
    dead_letters: Mutex<Vec<(String, Delivery)>>,
}

impl MemoryBroker {
    pub fn new<I, S>(channels: I, max_receives: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queues = channels
            .into_iter()
            .map(|name| {
                let (tx, rx) = mpsc::unbounded_channel();
                (name.into(), MemoryQueue { tx, rx: tokio::sync::Mutex::new(rx) })
            })
            .collect();
        Self {
            queues,
            max_receives: max_receives.max(1),
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    fn queue(&self, channel: &str) -> Result<&MemoryQueue, TransportError> {
        self.queues
            .get(channel)
            .ok_or_else(|| TransportError::UnknownChannel(channel.to_string()))
    }

    fn enqueue(&self, channel: &str, delivery: Delivery) -> Result<(), TransportError> {
        self.queue(channel)?
            .tx
            .send(delivery)
            .map_err(|_| TransportError::Closed(channel.to_string()))
    }

    /// Block the current (non-async) thread until at least one delivery is
    /// available, then drain up to `max` without waiting further.
    pub fn receive_batch_blocking(
        &self,
        channel: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, TransportError> {
        let mut rx = self.queue(channel)?.rx.blocking_lock();
        let first = rx
            .blocking_recv()
            .ok_or_else(|| TransportError::Closed(channel.to_string()))?;
        Ok(drain(&mut rx, first, max))
    }

    /// Async variant of [`receive_batch_blocking`](Self::receive_batch_blocking).
    pub async fn receive_batch(
        &self,
        channel: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, TransportError> {
        let mut rx = self.queue(channel)?.rx.lock().await;
        let first = rx
            .recv()
            .await
            .ok_or_else(|| TransportError::Closed(channel.to_string()))?;
        Ok(drain(&mut rx, first, max))
    }

    /// Take whatever is queued right now, up to `max`.
    pub fn try_receive_batch(
        &self,
        channel: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, TransportError> {
        let queue = self.queue(channel)?;
        let Ok(mut rx) = queue.rx.try_lock() else {
            return Ok(Vec::new());
        };
        match rx.try_recv() {
            Ok(first) => Ok(drain(&mut rx, first, max)),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Hand a failed delivery back for redelivery.
    pub fn nack(&self, channel: &str, delivery: Delivery) -> Result<(), TransportError> {
        if delivery.receive_count >= self.max_receives {
            tracing::warn!(
                channel,
                message_id = %delivery.message_id,
                receive_count = delivery.receive_count,
                "max receives reached; moving to dead-letter list"
            );
            self.dead_letters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((channel.to_string(), delivery));
            return Ok(());
        }
        tracing::debug!(channel, message_id = %delivery.message_id, "redelivering");
        self.enqueue(channel, delivery)
    }

    /// Deliveries that exhausted their receive budget, with their channel.
    pub fn dead_letters(&self) -> Vec<(String, Delivery)> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Broker for MemoryBroker {
    fn publish(&self, channel: &str, body: String) -> Result<MessageId, TransportError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.enqueue(channel, Delivery::new(message_id.clone(), body))?;
        tracing::debug!(channel, message_id = %message_id, "published message");
        Ok(message_id)
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Delivery>, first: Delivery, max: usize) -> Vec<Delivery> {
    let mut batch = vec![first];
    while batch.len() < max.max(1) {
        match rx.try_recv() {
            Ok(d) => batch.push(d),
            Err(_) => break,
        }
    }
    for d in &mut batch {
        d.receive_count += 1;
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_receive() {
        let broker = MemoryBroker::new(["q"], 3);
        let id = broker.publish("q", "hello".into()).unwrap();
        let batch = broker.try_receive_batch("q", 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, id);
        assert_eq!(batch[0].body, "hello");
        assert_eq!(batch[0].receive_count, 1);
        assert!(broker.try_receive_batch("q", 10).unwrap().is_empty());
    }

    #[test]
    fn test_batch_respects_max() {
        let broker = MemoryBroker::new(["q"], 3);
        for i in 0..5 {
            broker.publish("q", format!("m{i}")).unwrap();
        }
        assert_eq!(broker.try_receive_batch("q", 3).unwrap().len(), 3);
        assert_eq!(broker.try_receive_batch("q", 3).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_channel() {
        let broker = MemoryBroker::new(["q"], 3);
        assert!(matches!(
            broker.publish("other", "x".into()),
            Err(TransportError::UnknownChannel(c)) if c == "other"
        ));
    }

    #[test]
    fn test_nack_redelivers_then_dead_letters() {
        let broker = MemoryBroker::new(["q"], 2);
        broker.publish("q", "flaky".into()).unwrap();

        let d = broker.try_receive_batch("q", 1).unwrap().remove(0);
        broker.nack("q", d).unwrap();
        let d = broker.try_receive_batch("q", 1).unwrap().remove(0);
        assert_eq!(d.receive_count, 2);
        broker.nack("q", d).unwrap();

        assert!(broker.try_receive_batch("q", 1).unwrap().is_empty());
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, "q");
        assert_eq!(dead[0].1.body, "flaky");
    }

    #[test]
    fn test_blocking_receive_from_thread() {
        let broker = std::sync::Arc::new(MemoryBroker::new(["q"], 3));
        let consumer = {
            let broker = std::sync::Arc::clone(&broker);
            std::thread::spawn(move || broker.receive_batch_blocking("q", 4).unwrap())
        };
        broker.publish("q", "x".into()).unwrap();
        let batch = consumer.join().unwrap();
        assert_eq!(batch[0].body, "x");
    }

    #[tokio::test]
    async fn test_async_receive() {
        let broker = MemoryBroker::new(["q"], 3);
        broker.publish("q", "a".into()).unwrap();
        broker.publish("q", "b".into()).unwrap();
        let batch = broker.receive_batch("q", 10).await.unwrap();
        assert_eq!(batch.iter().map(|d| d.body.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
