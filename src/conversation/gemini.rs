//! Gemini `generateContent` adapter for the `Llm` port.
//!
//! The REST API is stateless, so the chat keeps its own transcript and resends
//! it on every turn. A turn is only recorded once the model has answered.

use super::orchestrator::seed_history;
use super::{ChatMessage, ChatSession, Llm, Role};
use crate::error::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash-001";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    system_prompt: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str, base_url: &str, system_prompt: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.trim().to_string(),
            system_prompt: system_prompt.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model)
    }

    async fn generate(&self, transcript: &[ChatMessage]) -> Result<String, GatewayError> {
        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&build_request(transcript))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream(format!("gemini returned {}: {}", status, body)));
        }

        let body: GenerateContentResponse = response.json().await?;
        extract_reply(body)
    }
}

#[async_trait]
impl Llm for GeminiClient {
    async fn generate_chat(&self, history: Vec<ChatMessage>) -> Result<Box<dyn ChatSession>, GatewayError> {
        Ok(Box::new(GeminiChat {
            client: self.clone(),
            transcript: seed_history(&self.system_prompt, history),
        }))
    }
}

struct GeminiChat {
    client: GeminiClient,
    transcript: Vec<ChatMessage>,
}

#[async_trait]
impl ChatSession for GeminiChat {
    async fn send_message(&mut self, text: &str) -> Result<String, GatewayError> {
        self.transcript.push(ChatMessage::user(text));
        match self.client.generate(&self.transcript).await {
            Ok(reply) => {
                debug!(chars = reply.len(), "Gemini replied");
                self.transcript.push(ChatMessage::assistant(reply.clone()));
                Ok(reply)
            }
            Err(e) => {
                self.transcript.pop();
                Err(e)
            }
        }
    }

    fn history(&self) -> Result<Vec<ChatMessage>, GatewayError> {
        Ok(self
            .transcript
            .iter()
            .filter(|message| message.role != Role::System)
            .cloned()
            .collect())
    }
}

fn text_content(role: Option<&str>, text: &str) -> Content {
    Content {
        role: role.map(str::to_string),
        parts: vec![Part { text: text.to_string() }],
    }
}

fn build_request(transcript: &[ChatMessage]) -> GenerateContentRequest {
    let system: Vec<&str> = transcript
        .iter()
        .filter(|message| message.role == Role::System)
        .map(|message| message.content.as_str())
        .collect();

    let contents = transcript
        .iter()
        .filter_map(|message| match message.role {
            Role::User => Some(text_content(Some("user"), &message.content)),
            Role::Assistant => Some(text_content(Some("model"), &message.content)),
            Role::System => None,
        })
        .collect();

    GenerateContentRequest {
        system_instruction: (!system.is_empty()).then(|| text_content(None, &system.join("\n"))),
        contents,
    }
}

fn extract_reply(response: GenerateContentResponse) -> Result<String, GatewayError> {
    let text: String = response
        .candidates
        .into_iter()
        .find_map(|candidate| candidate.content)
        .map(|content| content.parts.into_iter().map(|part| part.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        return Err(GatewayError::Upstream("gemini returned no candidates".to_string()));
    }
    Ok(text)
}
