use crate::errors::{AppError, AppResult};
use crate::models::StatusEntry;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory key/value board for transient UI status strings.
#[derive(Clone, Default)]
pub struct StatusBoard {
    entries: Arc<RwLock<HashMap<String, StatusEntry>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the first entry of a JSON object body. Further entries are
    /// ignored.
    pub async fn post(&self, body: &Value) -> AppResult<()> {
        let Some(object) = body.as_object() else {
            return Err(AppError::Cli("invalid json body".to_string()));
        };
        let Some((key, value)) = object.iter().next() else {
            return Err(AppError::Cli("empty key".to_string()));
        };
        if key.is_empty() {
            return Err(AppError::Cli("empty key".to_string()));
        }
        let Some(value) = value.as_str() else {
            return Err(AppError::Cli("invalid json body".to_string()));
        };

        if object.len() > 1 {
            tracing::debug!(key = %key, ignored = object.len() - 1, "status post carried extra entries");
        }
        self.save(key, value).await;
        Ok(())
    }

    pub async fn get(&self, keys: &[String]) -> BTreeMap<String, StatusEntry> {
        let entries = self.entries.read().await;
        keys.iter()
            .filter(|key| !key.is_empty())
            .filter_map(|key| entries.get(key).map(|entry| (key.clone(), entry.clone())))
            .collect()
    }

    pub async fn load(&self, key: &str) -> Option<StatusEntry> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn save(&self, key: &str, value: &str) {
        let entry = StatusEntry {
            value: value.to_string(),
            time: Utc::now().timestamp_millis(),
        };
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), entry);
    }
}
