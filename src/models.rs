use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchState {
    Loading,
    Completed,
    Failed,
}

impl FetchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelSettings {
    pub repo_key: Option<String>,
    pub lazy_load_enabled: bool,
    pub lazy_load_timeout_ms: u64,
    pub record_grace_ms: u64,
    pub gate_poll_interval_ms: u64,
    pub gate_availability_wait_ms: u64,
    pub gate_max_retry: u32,
    pub max_queue_len: Option<usize>,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            repo_key: None,
            lazy_load_enabled: true,
            lazy_load_timeout_ms: 5_000,
            record_grace_ms: 3_000,
            gate_poll_interval_ms: 100,
            gate_availability_wait_ms: 60_000,
            gate_max_retry: 10,
            max_queue_len: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFileStat {
    pub status: FetchState,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FinishedFileStat {
    pub status: FetchState,
    pub load_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LazyLoadStats {
    pub total_count: usize,
    pub loading_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub timeout_ms: u64,
    pub loading_files: BTreeMap<String, LoadingFileStat>,
    pub completed_files: BTreeMap<String, FinishedFileStat>,
    pub failed_files: BTreeMap<String, FinishedFileStat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GateSnapshot {
    pub resource_unavailable: bool,
    pub queue_len: usize,
    pub in_flight: usize,
    pub drain_running: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlRequest {
    pub stmt: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqlResponse {
    pub code: i32,
    pub msg: String,
    pub data: serde_json::Value,
}

impl SqlResponse {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            code: 0,
            msg: "success".to_string(),
            data,
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            code: 1,
            msg: msg.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeKind {
    Push,
    Update,
    Clear,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeEnvelope {
    pub id: String,
    pub kind: NoticeKind,
    pub message: String,
    pub ttl_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEntry {
    pub value: String,
    pub time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiReply {
    pub code: i32,
    pub msg: String,
    pub data: serde_json::Value,
}

impl ApiReply {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            code: 0,
            msg: String::new(),
            data,
        }
    }

    pub fn from_error(error: &crate::errors::AppError) -> Self {
        Self {
            code: -1,
            msg: error.to_string(),
            data: serde_json::json!({ "errorCode": error.code() }),
        }
    }
}
