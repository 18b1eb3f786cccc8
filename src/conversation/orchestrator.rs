use super::{ChatMessage, HistoryStore, Llm};
use crate::error::GatewayError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Prefix for replies produced when the LLM call itself failed.
pub const ERROR_REPLY_PREFIX: &str = "ERROR: ";

/// Bridges a session's inbound text to a chat backend and back.
///
/// One `execute` call owns one conversation. History is loaded before the first
/// turn and written back once the session is cancelled.
#[derive(Clone)]
pub struct ConversationOrchestrator {
    llm: Arc<dyn Llm>,
    store: Arc<dyn HistoryStore>,
}

impl ConversationOrchestrator {
    pub fn new(llm: Arc<dyn Llm>, store: Arc<dyn HistoryStore>) -> Self {
        Self { llm, store }
    }

    pub async fn execute(
        &self,
        user_id: u64,
        mut inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        let (history, persist) = match self.store.load(user_id).await {
            Ok(history) => (history, true),
            Err(GatewayError::NotFound(_)) => {
                debug!(user_id, "No saved history, starting a new conversation");
                (Vec::new(), true)
            }
            Err(e) => {
                // Unreadable history must not be overwritten by a partial one.
                error!(user_id, error = %e, "Failed to load history, continuing without saving");
                (Vec::new(), false)
            }
        };

        let mut chat = self.llm.generate_chat(history).await?;
        info!(user_id, "Conversation started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = inbound.recv() => {
                    let Some(text) = message else {
                        debug!(user_id, "Inbound stream closed, waiting for session end");
                        cancel.cancelled().await;
                        break;
                    };

                    let reply = match chat.send_message(&text).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(user_id, error = %e, "LLM request failed");
                            format!("{}{}", ERROR_REPLY_PREFIX, e)
                        }
                    };

                    if outbound.send(reply).await.is_err() {
                        debug!(user_id, "Reply stream closed, waiting for session end");
                        cancel.cancelled().await;
                        break;
                    }
                }
            }
        }

        if !persist {
            return Ok(());
        }

        match chat.history() {
            Ok(messages) => {
                if let Err(e) = self.store.save(user_id, &messages).await {
                    error!(user_id, error = %e, "Failed to save history");
                } else {
                    info!(user_id, messages = messages.len(), "Conversation saved");
                }
            }
            Err(e) => error!(user_id, error = %e, "Failed to read chat history"),
        }

        Ok(())
    }
}

/// Seed history for a new chat: the system prompt (if any) followed by the
/// stored turns, with any stored system messages dropped in favour of the
/// current prompt.
pub fn seed_history(system_prompt: &str, stored: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut seeded = Vec::with_capacity(stored.len() + 1);
    if !system_prompt.trim().is_empty() {
        seeded.push(ChatMessage::system(system_prompt));
    }
    seeded.extend(
        stored
            .into_iter()
            .filter(|message| message.role != super::Role::System),
    );
    seeded
}
