use crate::models::{NoticeEnvelope, NoticeKind};
use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Best-effort user-facing notices. Implementations must never block or fail
/// the caller; delivery problems are swallowed.
pub trait NotificationSink: Send + Sync {
    fn push(&self, message: &str, ttl_ms: u64) -> String;
    fn update(&self, id: &str, message: &str, ttl_ms: u64);
    fn clear(&self, id: &str);
    fn push_error(&self, message: &str, ttl_ms: u64);
}

#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn push(&self, message: &str, ttl_ms: u64) -> String {
        let id = Uuid::new_v4().to_string();
        tracing::info!(notice_id = %id, ttl_ms, "{}", message);
        id
    }

    fn update(&self, id: &str, message: &str, ttl_ms: u64) {
        tracing::info!(notice_id = %id, ttl_ms, "{}", message);
    }

    fn clear(&self, id: &str) {
        tracing::debug!(notice_id = %id, "notice cleared");
    }

    fn push_error(&self, message: &str, ttl_ms: u64) {
        tracing::warn!(ttl_ms, "{}", message);
    }
}

#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<NoticeEnvelope>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoticeEnvelope> {
        self.sender.subscribe()
    }

    fn emit(&self, id: String, kind: NoticeKind, message: &str, ttl_ms: u64) {
        let envelope = NoticeEnvelope {
            id,
            kind,
            message: message.to_string(),
            ttl_ms,
            timestamp: Utc::now(),
        };
        // No subscribers is not an error for a notice.
        let _ = self.sender.send(envelope);
    }
}

impl NotificationSink for BroadcastNotifier {
    fn push(&self, message: &str, ttl_ms: u64) -> String {
        let id = Uuid::new_v4().to_string();
        self.emit(id.clone(), NoticeKind::Push, message, ttl_ms);
        id
    }

    fn update(&self, id: &str, message: &str, ttl_ms: u64) {
        self.emit(id.to_string(), NoticeKind::Update, message, ttl_ms);
    }

    fn clear(&self, id: &str) {
        self.emit(id.to_string(), NoticeKind::Clear, "", 0);
    }

    fn push_error(&self, message: &str, ttl_ms: u64) {
        self.emit(Uuid::new_v4().to_string(), NoticeKind::Error, message, ttl_ms);
    }
}
