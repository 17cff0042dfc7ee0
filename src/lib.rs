pub mod assets;
pub mod db;
pub mod errors;
pub mod gate;
pub mod kernel;
pub mod lazyload;
pub mod models;
pub mod notify;
pub mod settings;
pub mod status;

pub use crate::assets::AssetService;
pub use crate::db::{ExtraDatabase, SqliteResource};
pub use crate::errors::{AppError, AppResult};
pub use crate::gate::{GateOptions, ResourceHandle, SyncGate};
pub use crate::kernel::{Kernel, KernelDeps};
pub use crate::lazyload::{
    normalize_key, FetchError, FetchHints, IndexHandle, IndexedFile, LazyLoader, RemoteFetcher, RepoCache, RepoProvider,
};
pub use crate::models::{ApiReply, KernelSettings, LazyLoadStats, SqlRequest, SqlResponse};
pub use crate::notify::{BroadcastNotifier, NotificationSink, TracingNotifier};
pub use crate::settings::SettingsStore;
pub use crate::status::StatusBoard;

use serde::Serialize;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the JSON file subscriber under `<app_data_dir>/logs`. Fails if a
/// global subscriber is already set.
pub fn init_tracing(app_data_dir: &Path) -> Result<(), String> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "kernel.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

/// Wraps a kernel result in the `{code, msg, data}` envelope handed to clients.
pub fn to_api_reply<T: Serialize>(result: AppResult<T>) -> ApiReply {
    match result.and_then(|value| serde_json::to_value(value).map_err(AppError::from)) {
        Ok(data) => ApiReply::ok(data),
        Err(error) => {
            tracing::debug!(code = error.code(), error = %error, "request failed");
            ApiReply::from_error(&error)
        }
    }
}
