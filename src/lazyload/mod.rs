pub mod pool;
pub mod remote;

pub use pool::{Admission, FetchOutcome, Lookup, StatusPool};
pub use remote::{
    FetchError, FetchHints, IndexHandle, IndexedFile, RemoteFetcher, RepoCache, RepoProvider, HINT_FILE_PATH,
    HINT_PUSH_MSG, HINT_PUSH_MSG_TO_STATUS_BAR,
};

use crate::errors::{AppError, AppResult};
use crate::models::{FetchState, KernelSettings, LazyLoadStats};
use crate::notify::NotificationSink;
use serde_json::json;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::Duration;

const PROGRESS_NOTICE_TTL_MS: u64 = 5_000;
const FAILURE_NOTICE_TTL_MS: u64 = 3_000;
const SUCCESS_NOTICE_TTL_MS: u64 = 2_000;

/// Decodes a request path into a pool key: `+` reads as a space, percent
/// escapes are decoded and one leading `/` is dropped. Undecodable input is
/// kept as-is.
pub fn normalize_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    let decoded = match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(error) => {
            tracing::warn!(path = %raw, error = %error, "decode relative path failed");
            raw.to_string()
        }
    };
    match decoded.strip_prefix('/') {
        Some(stripped) => stripped.to_string(),
        None => decoded,
    }
}

/// Accepts only plain relative keys, so joining them onto a data directory
/// can never leave it.
pub fn contained_path(key: &str) -> AppResult<&Path> {
    let path = Path::new(key);
    let contained = !key.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if contained {
        Ok(path)
    } else {
        Err(AppError::Policy(format!("path {} escapes the data directory", key)))
    }
}

/// Single-flight loader for files missing from the local data directory.
#[derive(Clone)]
pub struct LazyLoader {
    pool: Arc<StatusPool>,
    repos: Arc<RepoCache>,
    notifier: Arc<dyn NotificationSink>,
    repo_key: Arc<RwLock<Option<String>>>,
    timeout_ms: Arc<AtomicU64>,
    record_grace: Duration,
}

impl LazyLoader {
    pub fn new(repos: Arc<RepoCache>, notifier: Arc<dyn NotificationSink>, settings: &KernelSettings) -> Self {
        Self {
            pool: Arc::new(StatusPool::new()),
            repos,
            notifier,
            repo_key: Arc::new(RwLock::new(settings.repo_key.clone())),
            timeout_ms: Arc::new(AtomicU64::new(settings.lazy_load_timeout_ms.max(1))),
            record_grace: Duration::from_millis(settings.record_grace_ms),
        }
    }

    pub fn set_repo_key(&self, repo_key: Option<String>) {
        let mut writer = self.repo_key.write().unwrap_or_else(PoisonError::into_inner);
        *writer = repo_key;
    }

    fn has_capability(&self) -> bool {
        self.repo_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }

    /// Zero is ignored so a bad settings patch cannot disable waiting.
    pub fn set_timeout(&self, timeout_ms: u64) {
        if timeout_ms > 0 {
            self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> LazyLoadStats {
        self.pool.stats(self.timeout_ms())
    }

    pub fn state_of(&self, raw_key: &str) -> Option<FetchState> {
        self.pool.state_of(&normalize_key(raw_key))
    }

    pub fn clear_terminal(&self) -> usize {
        self.pool.clear_terminal()
    }

    pub async fn try_fetch(&self, raw_key: &str) -> bool {
        self.fetch(raw_key).await.is_ok()
    }

    pub async fn fetch(&self, raw_key: &str) -> AppResult<()> {
        if !self.has_capability() {
            tracing::warn!(path = %raw_key, "lazy load skipped: data repo key is empty");
            return Err(AppError::ConfigMissing("data repo key is empty".to_string()));
        }

        let key = normalize_key(raw_key);
        if let Err(error) = contained_path(&key) {
            tracing::warn!(path = %raw_key, "lazy load rejected: path escapes data directory");
            return Err(error);
        }

        let receiver = match self.pool.lookup(&key) {
            Lookup::Loading(receiver) => receiver,
            Lookup::Finished(outcome) => {
                tracing::debug!(key = %key, state = outcome.state().as_str(), "lazy load served from pool");
                return outcome_to_result(&key, outcome);
            }
            Lookup::Absent => match self.pool.admit(&key) {
                Admission::Admitted { generation, receiver } => {
                    tracing::debug!(key = %key, generation, "lazy load admitted");
                    self.spawn_fetch(key.clone(), generation);
                    receiver
                }
                Admission::Joined(receiver) => receiver,
                Admission::Finished(outcome) => return outcome_to_result(&key, outcome),
            },
        };

        self.wait_for_outcome(&key, receiver).await
    }

    async fn wait_for_outcome(&self, key: &str, mut receiver: watch::Receiver<FetchOutcome>) -> AppResult<()> {
        let timeout = Duration::from_millis(self.timeout_ms());
        let waited = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(FetchOutcome::is_terminal)
                .await
                .map(|outcome| outcome.clone())
        })
        .await;

        match waited {
            Ok(Ok(outcome)) => outcome_to_result(key, outcome),
            Ok(Err(_)) => {
                let last = receiver.borrow().clone();
                if last.is_terminal() {
                    return outcome_to_result(key, last);
                }
                tracing::warn!(key = %key, "lazy load record dropped before completion");
                Err(AppError::FetchFailed(format!("{}: record removed before completion", key)))
            }
            Err(_) => {
                tracing::warn!(
                    key = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "lazy load timed out waiting for file"
                );
                Err(AppError::Timeout(format!("timed out waiting for {}", key)))
            }
        }
    }

    fn spawn_fetch(&self, key: String, generation: u64) {
        let loader = self.clone();
        tokio::spawn(async move {
            let result = loader.run_fetch(&key).await;
            loader.pool.finish(&key, generation, result);
            loader.schedule_removal(&key, generation).await;
        });
    }

    async fn run_fetch(&self, key: &str) -> Result<(), String> {
        let repos = Arc::clone(&self.repos);
        let notifier = Arc::clone(&self.notifier);
        let owned_key = key.to_string();
        match tokio::task::spawn_blocking(move || fetch_blocking(&repos, notifier.as_ref(), &owned_key)).await {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(key = %key, error = %error, "lazy load task aborted");
                Err(format!("lazy load task aborted: {}", error))
            }
        }
    }

    async fn schedule_removal(&self, key: &str, generation: u64) {
        if !self.record_grace.is_zero() {
            tokio::time::sleep(self.record_grace).await;
        }
        self.pool.remove_if_generation(key, generation);
    }
}

fn outcome_to_result(key: &str, outcome: FetchOutcome) -> AppResult<()> {
    match outcome {
        FetchOutcome::Completed => Ok(()),
        FetchOutcome::Failed(error) => Err(AppError::FetchFailed(error)),
        FetchOutcome::Loading => Err(AppError::Internal(format!("{} is still loading", key))),
    }
}

fn fetch_blocking(repos: &RepoCache, notifier: &dyn NotificationSink, key: &str) -> Result<(), String> {
    let started = Instant::now();
    let repo = repos.get_or_open().map_err(|error| {
        tracing::error!(key = %key, error = %error, "init repository for lazy load failed");
        error.to_string()
    })?;

    let absolute_path = repo.data_path().join(key);
    let notice_id = notifier.push(&format!("downloading lazy file: {}", key), PROGRESS_NOTICE_TTL_MS);

    let mut hints = FetchHints::new();
    hints.insert(HINT_PUSH_MSG.to_string(), json!(HINT_PUSH_MSG_TO_STATUS_BAR));
    hints.insert(HINT_FILE_PATH.to_string(), json!(key));

    if let Err(error) = repo.fetch_into(&absolute_path, &hints) {
        notifier.clear(&notice_id);
        tracing::warn!(key = %key, error = %error, "lazy load file failed");
        if error.is_not_in_latest_index() {
            log_latest_index(repo.as_ref());
        }
        notifier.push_error(&format!("lazy load file failed: {}", error), FAILURE_NOTICE_TTL_MS);
        return Err(error.to_string());
    }

    let elapsed = started.elapsed();
    notifier.update(
        &notice_id,
        &format!("lazy file loaded: {} ({:.2}s)", key, elapsed.as_secs_f64()),
        SUCCESS_NOTICE_TTL_MS,
    );
    tracing::info!(key = %key, elapsed_ms = elapsed.as_millis() as u64, "lazy load file completed");
    Ok(())
}

fn log_latest_index(repo: &dyn RemoteFetcher) {
    let latest = match repo.latest() {
        Ok(latest) => latest,
        Err(error) => {
            tracing::error!(error = %error, "get latest index failed");
            return;
        }
    };
    match repo.list_files(&latest) {
        Ok(files) => {
            tracing::warn!(index = %latest.id, count = files.len(), "latest index contents");
            for file in files {
                tracing::warn!(index = %latest.id, path = %file.path, "latest index entry");
            }
        }
        Err(error) => tracing::error!(index = %latest.id, error = %error, "get latest files failed"),
    }
}
