//! # Transcription Module
//!
//! Speech-to-text is delegated to a cloud service behind the `Transcriber` port.
//! The gateway never decodes audio itself; it forwards raw PCM bytes and gets
//! text back.
//!
//! ## Two entry points:
//! - **transcribe**: one complete utterance, used for binary frames arriving on a
//!   device's live connection
//! - **transcribe_stream**: chunks arriving over time, used by the HTTP upload
//!   path. The default implementation collects every chunk and then calls
//!   `transcribe`, which is all a batch-only backend can do.

pub mod google;

use crate::error::GatewayError;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use google::GoogleSpeechClient;

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one complete clip. Silence yields an empty string, not an error.
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, GatewayError>;

    /// Transcribe audio delivered in chunks; returns once the sender is dropped.
    async fn transcribe_stream(&self, mut chunks: mpsc::Receiver<Vec<u8>>) -> Result<String, GatewayError> {
        let mut audio = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            audio.extend_from_slice(&chunk);
        }
        self.transcribe(audio).await
    }
}
