//! Streaming audio upload: `POST /api/v1/audio/stream`.
//!
//! The request body is raw PCM. It is forwarded to the transcriber in 4 KB
//! chunks while it is still arriving, and the resulting text is both returned
//! to the caller and published for the device's live session.

use crate::error::{AppError, AppResult};
use crate::ingestion::{TranscriptionMessage, TRANSCRIPTION_ROUTING_KEY, TRANSCRIPTION_TOPIC};
use crate::session::SessionIdentity;
use crate::state::AppState;
use actix_web::{http::header::CONTENT_TYPE, web, HttpRequest, HttpResponse};
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHUNK_SIZE: usize = 4096;
const CHUNK_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamAudioResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

fn is_audio_content_type(content_type: &str) -> bool {
    content_type.starts_with("audio/") || content_type.starts_with("application/octet-stream")
}

/// Feed the request body to `chunks` until it ends, the size limit is hit or
/// the duration cap passes. Dropping `chunks` tells the transcriber the audio
/// is complete.
async fn pump_body(
    payload: &mut web::Payload,
    chunks: mpsc::Sender<Vec<u8>>,
    max_bytes: usize,
    max_duration: Duration,
) -> AppResult<usize> {
    let started = Instant::now();
    let mut received = 0usize;

    while let Some(item) = payload.next().await {
        let bytes = item.map_err(|e| AppError::BadRequest(format!("failed to read audio body: {}", e)))?;

        received += bytes.len();
        if received > max_bytes {
            return Err(AppError::PayloadTooLarge(format!(
                "audio body exceeds {} bytes",
                max_bytes
            )));
        }

        for chunk in bytes.chunks(CHUNK_SIZE) {
            if chunks.send(chunk.to_vec()).await.is_err() {
                // Transcriber stopped listening; it will report why.
                return Ok(received);
            }
        }

        if started.elapsed() > max_duration {
            info!(received, "Audio upload reached the duration cap, stopping");
            break;
        }
    }

    Ok(received)
}

pub async fn stream_audio(
    req: HttpRequest,
    mut payload: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let started_at = Utc::now();

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !is_audio_content_type(content_type) {
        return Err(AppError::BadRequest(
            "Invalid content type. Expected audio/* or application/octet-stream".to_string(),
        ));
    }

    let identity = SessionIdentity::from_headers(|name| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    })
    .map_err(AppError::BadRequest)?;

    let _permit = state
        .upload_slots
        .clone()
        .try_acquire_owned()
        .map_err(|_| AppError::TooManyRequests("Too many concurrent uploads".to_string()))?;

    let limits = state.get_config().ingestion;
    let session_id = Uuid::new_v4().simple().to_string();
    info!(
        session_id = %session_id,
        device_id = %identity.device_id,
        user_id = identity.user_id,
        "Starting audio upload"
    );

    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE_CAPACITY);
    let pump = pump_body(
        &mut payload,
        chunk_tx,
        limits.max_request_bytes,
        Duration::from_secs(limits.max_audio_duration_secs),
    );
    let transcriber = state.transcriber.clone();
    let transcription = async move { transcriber.transcribe_stream(chunk_rx).await.map_err(AppError::from) };

    let deadline = Instant::now() + Duration::from_secs(limits.transcription_timeout_secs);
    let (received, text) = match timeout_at(deadline, async { tokio::try_join!(pump, transcription) }).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(session_id = %session_id, "Transcription timed out");
            return Err(AppError::Timeout("Transcription timeout".to_string()));
        }
    };
    debug!(session_id = %session_id, bytes = received, "Audio upload transcribed");

    let message = TranscriptionMessage {
        session_id: session_id.clone(),
        user_id: identity.user_id,
        device_id: identity.device_id.clone(),
        text: text.clone(),
        timestamp: started_at,
        success: true,
        error: None,
    };

    // Publishing is best effort; the caller still gets the transcript.
    match serde_json::to_vec(&message) {
        Ok(body) => match state.broker.publish(TRANSCRIPTION_TOPIC, TRANSCRIPTION_ROUTING_KEY, body) {
            Ok(()) => {
                state.transcription_published();
                debug!(session_id = %session_id, "Transcription published");
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to publish transcription"),
        },
        Err(e) => warn!(session_id = %session_id, error = %e, "Failed to encode transcription"),
    }

    Ok(HttpResponse::Ok().json(StreamAudioResponse {
        success: true,
        message: "Audio processed successfully".to_string(),
        session_id,
        text,
    }))
}
