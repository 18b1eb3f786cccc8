//! # Topic-Routed Broker
//!
//! A volatile, process-local publish/subscribe registry. Producers (the HTTP
//! ingestion path) and consumers (the ingestion listener) only share a topic
//! name and a routing key; neither knows the other exists.
//!
//! ## Delivery model:
//! - Every subscriber owns its own bounded queue, so two subscribers on the same
//!   key both see every envelope.
//! - Publishing never blocks. A subscriber whose queue is full misses that
//!   envelope and the publisher is told with `GatewayError::QueueFull`.
//! - Nothing is retained. A subscriber only sees envelopes published after it
//!   subscribed.
//!
//! ## Locking:
//! One `RwLock` guards both the topic map and the closed flag, so every
//! "is it closed? then act" sequence is atomic. The lock is never held across
//! an `.await`.

use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// A published message as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct TopicEntry {
    subscribers: Vec<mpsc::Sender<Envelope>>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicEntry>,
    closed: bool,
}

pub struct Broker {
    state: RwLock<BrokerState>,
    queue_capacity: usize,
}

fn topic_key(topic: &str, routing_key: &str) -> String {
    format!("{}:{}", topic, routing_key)
}

impl Broker {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: RwLock::new(BrokerState::default()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Deliver `payload` to every current subscriber of `(topic, routing_key)`.
    ///
    /// Subscribers that went away are pruned here. If at least one live queue was
    /// full the call returns `QueueFull`, but the others still received the
    /// envelope.
    pub fn publish(&self, topic: &str, routing_key: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
        let key = topic_key(topic, routing_key);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(GatewayError::Closed);
        }

        let entry = state.topics.entry(key.clone()).or_default();
        let envelope = Envelope {
            topic: topic.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            timestamp: Utc::now(),
        };

        let mut saturated = 0usize;
        entry.subscribers.retain(|subscriber| match subscriber.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                saturated += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if entry.subscribers.is_empty() {
            debug!(topic = %key, "Published with no subscribers, envelope dropped");
        }

        if saturated > 0 {
            warn!(topic = %key, saturated, "Subscriber queue full, envelope not delivered");
            return Err(GatewayError::QueueFull(key));
        }
        Ok(())
    }

    /// Start receiving envelopes published to `(topic, routing_key)` from now on.
    pub fn subscribe(&self, topic: &str, routing_key: &str) -> Result<Subscription, GatewayError> {
        let key = topic_key(topic, routing_key);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(GatewayError::Closed);
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        state.topics.entry(key.clone()).or_default().subscribers.push(tx);
        debug!(topic = %key, "Subscriber added");

        Ok(Subscription {
            key,
            inner: ReceiverStream::new(rx),
        })
    }

    /// Idempotent. Drops every delivery queue so subscribers see end-of-stream.
    pub fn close(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        state.closed = true;
        state.topics.clear();
        debug!("Broker closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).closed
    }

    pub fn topic_count(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).topics.len()
    }
}

/// Stream of envelopes for one subscriber. Ends when the broker closes.
pub struct Subscription {
    key: String,
    inner: ReceiverStream<Envelope>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inner.next().await
    }
}

impl Stream for Subscription {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
