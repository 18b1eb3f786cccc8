//! # Conversation
//!
//! Ports and types for the per-user chat: the LLM port, the stateful chat
//! session it hands out, and the history store that carries a conversation from
//! one device session to the next.
//!
//! Adapters:
//! - `gemini`: the `Llm` port over the Gemini `generateContent` REST API
//! - `history`: the `HistoryStore` port over JSON files on disk

pub mod gemini;
pub mod history;
pub mod orchestrator;

use crate::error::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use gemini::GeminiClient;
pub use history::JsonFileHistoryStore;
pub use orchestrator::ConversationOrchestrator;

/// Who authored a message. Older history files call the assistant `doll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "doll")]
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// A language model that can open a chat seeded with prior history.
#[async_trait]
pub trait Llm: Send + Sync {
    async fn generate_chat(&self, history: Vec<ChatMessage>) -> Result<Box<dyn ChatSession>, GatewayError>;
}

/// One live chat. Owned by a single orchestrator task.
#[async_trait]
pub trait ChatSession: Send {
    async fn send_message(&mut self, text: &str) -> Result<String, GatewayError>;

    /// Everything exchanged so far, including the seed history.
    fn history(&self) -> Result<Vec<ChatMessage>, GatewayError>;
}

/// Persistence for finished conversations, keyed by user.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// `GatewayError::NotFound` when the user has no saved history yet.
    async fn load(&self, user_id: u64) -> Result<Vec<ChatMessage>, GatewayError>;

    /// Overwrites whatever was stored for the user.
    async fn save(&self, user_id: u64, messages: &[ChatMessage]) -> Result<(), GatewayError>;
}
