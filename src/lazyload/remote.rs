use crate::errors::{AppError, AppResult};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub const HINT_PUSH_MSG: &str = "pushMsg";
pub const HINT_PUSH_MSG_TO_STATUS_BAR: &str = "statusBar";
pub const HINT_FILE_PATH: &str = "filePath";

static NOT_IN_LATEST_INDEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)not found in latest index").expect("valid not-in-index regex"));

pub type FetchHints = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("file [{0}] not found in latest index")]
    NotInLatestIndex(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FetchError {
    /// Repositories that only report plain messages are matched on text.
    pub fn is_not_in_latest_index(&self) -> bool {
        match self {
            Self::NotInLatestIndex(_) => true,
            Self::Other(error) => NOT_IN_LATEST_INDEX_RE.is_match(&format!("{:#}", error)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    pub path: String,
}

/// Content-addressed remote repository as seen by the lazy loader. All calls
/// are blocking and run on the blocking pool.
pub trait RemoteFetcher: Send + Sync {
    fn data_path(&self) -> &Path;
    fn fetch_into(&self, absolute_path: &Path, hints: &FetchHints) -> Result<(), FetchError>;
    fn latest(&self) -> anyhow::Result<IndexHandle>;
    fn list_files(&self, index: &IndexHandle) -> anyhow::Result<Vec<IndexedFile>>;
}

pub trait RepoProvider: Send + Sync {
    fn open(&self) -> anyhow::Result<Arc<dyn RemoteFetcher>>;
}

impl<F> RepoProvider for F
where
    F: Fn() -> anyhow::Result<Arc<dyn RemoteFetcher>> + Send + Sync,
{
    fn open(&self) -> anyhow::Result<Arc<dyn RemoteFetcher>> {
        self()
    }
}

pub struct RepoCache {
    provider: Arc<dyn RepoProvider>,
    repo: OnceCell<Arc<dyn RemoteFetcher>>,
}

impl RepoCache {
    pub fn new(provider: Arc<dyn RepoProvider>) -> Self {
        Self {
            provider,
            repo: OnceCell::new(),
        }
    }

    pub fn with_repo(repo: Arc<dyn RemoteFetcher>) -> Self {
        let opened = Arc::clone(&repo);
        let cache = Self::new(Arc::new(move || Ok::<_, anyhow::Error>(Arc::clone(&opened))));
        let _ = cache.repo.set(repo);
        cache
    }

    /// Opens the repository on first use. A failed open is not cached, the
    /// next caller tries again.
    pub fn get_or_open(&self) -> AppResult<Arc<dyn RemoteFetcher>> {
        self.repo
            .get_or_try_init(|| self.provider.open())
            .map(Arc::clone)
            .map_err(|error| AppError::FetchFailed(format!("init repository for lazy load failed: {}", error)))
    }

    pub fn is_open(&self) -> bool {
        self.repo.get().is_some()
    }
}
