use super::{ChatMessage, HistoryStore};
use crate::error::GatewayError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

/// Stores each user's conversation as `chat_history_{user_id}.json`.
pub struct JsonFileHistoryStore {
    directory: PathBuf,
}

impl JsonFileHistoryStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, user_id: u64) -> PathBuf {
        self.directory.join(format!("chat_history_{}.json", user_id))
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistoryStore {
    async fn load(&self, user_id: u64) -> Result<Vec<ChatMessage>, GatewayError> {
        let path = self.path_for(user_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(GatewayError::NotFound(format!("history for user {}", user_id)))
            }
            Err(e) => {
                return Err(GatewayError::Upstream(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        serde_json::from_slice(&data).map_err(|e| {
            GatewayError::Upstream(format!("failed to decode {}: {}", path.display(), e))
        })
    }

    async fn save(&self, user_id: u64, messages: &[ChatMessage]) -> Result<(), GatewayError> {
        let path = self.path_for(user_id);
        let data = serde_json::to_vec_pretty(messages)
            .map_err(|e| GatewayError::Upstream(format!("failed to encode history: {}", e)))?;

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| GatewayError::Upstream(format!("failed to create {}: {}", self.directory.display(), e)))?;

        // Write then rename so a crash never leaves a truncated file behind.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| GatewayError::Upstream(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| GatewayError::Upstream(format!("failed to replace {}: {}", path.display(), e)))?;

        debug!(user_id, path = %path.display(), "History written");
        Ok(())
    }
}
