//! # Configuration Management
//!
//! Loads gateway configuration from, lowest priority first:
//! 1. Default values (the `Default` impls below)
//! 2. Configuration file (`config.toml`, optional)
//! 3. Environment variables with the `APP_` prefix and `__` between section and
//!    field (`APP_SESSION__PING_PERIOD_SECS=15`)
//! 4. Deployment-platform variables: `HOST`, `PORT`, `WS_PORT`, and the API key
//!    as `GEMINI_API_KEY` or `GOOGLE_API_KEY`
//!
//! ## Sections:
//! - **server**: HTTP and device WebSocket listeners
//! - **session**: per-connection queue sizes and keepalive timing
//! - **broker**: subscriber queue size
//! - **ingestion**: limits for the HTTP audio upload path
//! - **upstream**: cloud LLM and speech services
//! - **history**: where finished conversations are stored
//!
//! Field names contain underscores themselves, which is why the section
//! separator is a double underscore.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::conversation::gemini::{DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL};
use crate::transcription::google::DEFAULT_SPEECH_BASE_URL;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub broker: BrokerConfig,
    pub ingestion: IngestionConfig,
    pub upstream: UpstreamConfig,
    pub history: HistoryConfig,
}

/// Listener addresses. `port` serves the HTTP API, `ws_port` the devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ws_port: 8081,
        }
    }
}

/// Per-device connection tuning.
///
/// ## Timing rules:
/// - The device must send *something* within `pong_wait_secs` or it is dropped.
/// - A ping is requested after `ping_period_secs` of silence, so `pong_wait_secs`
///   must be longer than `ping_period_secs` or healthy devices time out.
/// - Every single write gets `write_wait_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub outbound_queue_capacity: usize,
    pub inbound_queue_capacity: usize,
    pub reply_queue_capacity: usize,
    pub ping_period_secs: u64,
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            inbound_queue_capacity: 10,
            reply_queue_capacity: 10,
            ping_period_secs: 30,
            pong_wait_secs: 60,
            write_wait_secs: 10,
            max_message_size: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { queue_capacity: 100 }
    }
}

/// Limits for `POST /api/v1/audio/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub max_request_bytes: usize,
    pub max_audio_duration_secs: u64,
    pub transcription_timeout_secs: u64,
    pub max_concurrent_uploads: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 10 * 1024 * 1024,
            max_audio_duration_secs: 60,
            transcription_timeout_secs: 30,
            max_concurrent_uploads: 10,
        }
    }
}

/// Cloud services. One API key is shared by Gemini and Speech-to-Text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub api_key: String,
    pub llm_model: String,
    pub llm_base_url: String,
    pub speech_base_url: String,
    pub language_code: String,
    pub sample_rate_hertz: u32,
    pub system_prompt: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            llm_model: DEFAULT_GEMINI_MODEL.to_string(),
            llm_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            speech_base_url: DEFAULT_SPEECH_BASE_URL.to_string(),
            language_code: "id-ID".to_string(),
            sample_rate_hertz: 16000,
            system_prompt: "You are a friendly talking doll. Answer in short, warm sentences \
                            in the same language the child speaks."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub directory: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            directory: ".".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__WS_PORT=9001`: device listener port
    /// - `APP_SESSION__OUTBOUND_QUEUE_CAPACITY=512`
    /// - `APP_UPSTREAM__LANGUAGE_CODE=en-US`
    /// - `GEMINI_API_KEY=...`: shared key for the cloud services
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(ws_port) = env::var("WS_PORT") {
            settings = settings.set_override("server.ws_port", ws_port)?;
        }

        if let Some(key) = ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
            .iter()
            .find_map(|name| env::var(name).ok().filter(|value| !value.trim().is_empty()))
        {
            settings = settings.set_override("upstream.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.ws_port == 0 {
            return Err(anyhow::anyhow!("Device WebSocket port cannot be 0"));
        }

        if self.server.ws_port == self.server.port {
            return Err(anyhow::anyhow!("HTTP and device WebSocket ports must differ"));
        }

        let session = &self.session;
        if session.outbound_queue_capacity == 0
            || session.inbound_queue_capacity == 0
            || session.reply_queue_capacity == 0
        {
            return Err(anyhow::anyhow!("Session queue capacities must be greater than 0"));
        }

        if session.ping_period_secs == 0 || session.pong_wait_secs == 0 || session.write_wait_secs == 0 {
            return Err(anyhow::anyhow!("Session timings must be greater than 0"));
        }

        if session.pong_wait_secs <= session.ping_period_secs {
            return Err(anyhow::anyhow!(
                "pong_wait_secs ({}) must be greater than ping_period_secs ({})",
                session.pong_wait_secs,
                session.ping_period_secs
            ));
        }

        if session.max_message_size == 0 {
            return Err(anyhow::anyhow!("Max message size must be greater than 0"));
        }

        if self.broker.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Broker queue capacity must be greater than 0"));
        }

        let ingestion = &self.ingestion;
        if ingestion.max_request_bytes == 0 || ingestion.max_concurrent_uploads == 0 {
            return Err(anyhow::anyhow!("Ingestion limits must be greater than 0"));
        }

        if ingestion.max_audio_duration_secs == 0 || ingestion.transcription_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Ingestion durations must be greater than 0"));
        }

        if self.upstream.sample_rate_hertz == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial update such as `{"session": {"ping_period_secs": 15}}`.
    ///
    /// Only `server`, `session` and `ingestion` can change at runtime. Sessions
    /// and uploads started after the update see the new values. The result is
    /// validated before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)?;
            }
            if let Some(ws_port) = server.get("ws_port").and_then(|v| v.as_u64()) {
                self.server.ws_port = u16::try_from(ws_port)?;
            }
        }

        if let Some(session) = partial_config.get("session") {
            let field = |name: &str| session.get(name).and_then(|v| v.as_u64());
            if let Some(value) = field("outbound_queue_capacity") {
                self.session.outbound_queue_capacity = value as usize;
            }
            if let Some(value) = field("inbound_queue_capacity") {
                self.session.inbound_queue_capacity = value as usize;
            }
            if let Some(value) = field("reply_queue_capacity") {
                self.session.reply_queue_capacity = value as usize;
            }
            if let Some(value) = field("ping_period_secs") {
                self.session.ping_period_secs = value;
            }
            if let Some(value) = field("pong_wait_secs") {
                self.session.pong_wait_secs = value;
            }
            if let Some(value) = field("write_wait_secs") {
                self.session.write_wait_secs = value;
            }
            if let Some(value) = field("max_message_size") {
                self.session.max_message_size = value as usize;
            }
        }

        if let Some(ingestion) = partial_config.get("ingestion") {
            let field = |name: &str| ingestion.get(name).and_then(|v| v.as_u64());
            if let Some(value) = field("max_request_bytes") {
                self.ingestion.max_request_bytes = value as usize;
            }
            if let Some(value) = field("max_audio_duration_secs") {
                self.ingestion.max_audio_duration_secs = value;
            }
            if let Some(value) = field("transcription_timeout_secs") {
                self.ingestion.transcription_timeout_secs = value;
            }
            if let Some(value) = field("max_concurrent_uploads") {
                self.ingestion.max_concurrent_uploads = value as usize;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Copy safe to show over HTTP: the API key is masked.
    pub fn redacted(&self) -> AppConfig {
        let mut config = self.clone();
        if !config.upstream.api_key.is_empty() {
            config.upstream.api_key = "********".to_string();
        }
        config
    }
}
