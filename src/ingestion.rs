//! # Ingestion Listener
//!
//! Routes transcription results produced off-connection (the HTTP upload path)
//! back into the owning device's live session.
//!
//! ```text
//! POST /api/v1/audio/stream -> Broker("transcription.results", "") -> listener -> Hub -> Session
//! ```
//!
//! A result for a device that is not connected is logged and discarded. There is
//! no retry or buffering.

use crate::broker::{Broker, Envelope};
use crate::error::GatewayError;
use crate::hub::Hub;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const TRANSCRIPTION_TOPIC: &str = "transcription.results";
/// Results are published unaddressed; the device id inside the payload routes them.
pub const TRANSCRIPTION_ROUTING_KEY: &str = "";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionMessage {
    pub session_id: String,
    pub user_id: u64,
    pub device_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Forwarded,
    Discarded,
}

pub struct IngestionListener {
    broker: Arc<Broker>,
    hub: Hub,
}

impl IngestionListener {
    pub fn new(broker: Arc<Broker>, hub: Hub) -> Self {
        Self { broker, hub }
    }

    /// Subscribe and spawn the delivery loop. The task ends when the broker closes.
    pub fn start(self) -> Result<JoinHandle<()>, GatewayError> {
        let mut subscription = self.broker.subscribe(TRANSCRIPTION_TOPIC, TRANSCRIPTION_ROUTING_KEY)?;
        info!(topic = %subscription.key(), "Ingestion listener subscribed");

        Ok(tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                self.deliver(&envelope).await;
            }
            info!("Ingestion listener stopped");
        }))
    }

    pub async fn deliver(&self, envelope: &Envelope) -> Delivery {
        let message: TranscriptionMessage = match serde_json::from_slice(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Undecodable transcription message");
                return Delivery::Discarded;
            }
        };

        if !message.success || message.text.trim().is_empty() {
            debug!(
                device_id = %message.device_id,
                error = message.error.as_deref().unwrap_or(""),
                "Skipping unsuccessful or empty transcription"
            );
            return Delivery::Discarded;
        }

        let Some(session) = self.hub.session_for_device(&message.device_id).await else {
            info!(device_id = %message.device_id, "Device not connected, transcription discarded");
            return Delivery::Discarded;
        };

        match session.forward_inbound(message.text) {
            Ok(()) => {
                debug!(device_id = %message.device_id, session_id = %message.session_id, "Transcription forwarded");
                Delivery::Forwarded
            }
            Err(e) => {
                warn!(device_id = %message.device_id, error = %e, "Transcription not forwarded");
                Delivery::Discarded
            }
        }
    }
}
