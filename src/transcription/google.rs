//! Google Cloud Speech-to-Text adapter (`speech:recognize`).

use super::Transcriber;
use crate::error::GatewayError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_SPEECH_BASE_URL: &str = "https://speech.googleapis.com";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionConfig {
    encoding: &'static str,
    sample_rate_hertz: u32,
    language_code: String,
    audio_channel_count: u32,
}

#[derive(Debug, Serialize)]
struct RecognitionAudio {
    content: String,
}

#[derive(Debug, Serialize)]
struct RecognizeRequest {
    config: RecognitionConfig,
    audio: RecognitionAudio,
}

#[derive(Debug, Default, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognitionResult>,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Sends 16-bit little-endian mono PCM to Google Speech and returns the best
/// transcript.
pub struct GoogleSpeechClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    language_code: String,
    sample_rate_hertz: u32,
}

impl GoogleSpeechClient {
    pub fn new(api_key: &str, base_url: &str, language_code: &str, sample_rate_hertz: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            language_code: language_code.to_string(),
            sample_rate_hertz,
        }
    }

    fn build_request(&self, audio: &[u8]) -> RecognizeRequest {
        RecognizeRequest {
            config: RecognitionConfig {
                encoding: "LINEAR16",
                sample_rate_hertz: self.sample_rate_hertz,
                language_code: self.language_code.clone(),
                audio_channel_count: 1,
            },
            audio: RecognitionAudio {
                content: STANDARD.encode(audio),
            },
        }
    }
}

fn best_transcript(response: RecognizeResponse) -> String {
    response
        .results
        .into_iter()
        .flat_map(|result| result.alternatives)
        .map(|alternative| alternative.transcript)
        .find(|transcript| !transcript.trim().is_empty())
        .unwrap_or_default()
}

#[async_trait]
impl Transcriber for GoogleSpeechClient {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, GatewayError> {
        if audio.is_empty() {
            return Ok(String::new());
        }

        let url = format!("{}/v1/speech:recognize", self.base_url);
        let response = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&self.build_request(&audio))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream(format!("speech returned {}: {}", status, body)));
        }

        let body: RecognizeResponse = response.json().await?;
        let transcript = best_transcript(body);
        debug!(bytes = audio.len(), chars = transcript.len(), "Speech recognized");
        Ok(transcript)
    }
}
