use crate::assets::AssetService;
use crate::db::ExtraDatabase;
use crate::errors::AppResult;
use crate::gate::GateOptions;
use crate::lazyload::{LazyLoader, RepoCache, RepoProvider};
use crate::models::{KernelSettings, LazyLoadStats};
use crate::notify::NotificationSink;
use crate::settings::{SettingsStore, SETTINGS_FILE_NAME};
use crate::status::StatusBoard;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub const DATA_DIR_NAME: &str = "data";
pub const EXTRA_DB_RELATIVE_PATH: &str = "storage/extra.db";

/// Collaborators supplied by the host process.
#[derive(Clone)]
pub struct KernelDeps {
    pub repo_provider: Arc<dyn RepoProvider>,
    pub notifier: Arc<dyn NotificationSink>,
}

pub struct Kernel {
    settings: SettingsStore,
    loader: LazyLoader,
    assets: AssetService,
    extra_db: ExtraDatabase,
    status: StatusBoard,
    app_data_dir: PathBuf,
}

impl Kernel {
    /// Loads settings from `<app_data_dir>/kernel-settings.json` and builds the
    /// kernel from them.
    pub fn open(app_data_dir: PathBuf, deps: KernelDeps) -> AppResult<Arc<Self>> {
        let store = SettingsStore::load(&app_data_dir);
        Self::build(app_data_dir, store, deps)
    }

    pub fn new(app_data_dir: PathBuf, settings: KernelSettings, deps: KernelDeps) -> AppResult<Arc<Self>> {
        let store = SettingsStore::with_settings(app_data_dir.join(SETTINGS_FILE_NAME), settings);
        Self::build(app_data_dir, store, deps)
    }

    fn build(app_data_dir: PathBuf, store: SettingsStore, deps: KernelDeps) -> AppResult<Arc<Self>> {
        let settings = store.current();
        let extra_db = ExtraDatabase::open(
            &app_data_dir.join(EXTRA_DB_RELATIVE_PATH),
            GateOptions::from_settings(&settings),
        )?;

        let repos = Arc::new(RepoCache::new(deps.repo_provider));
        let loader = LazyLoader::new(repos, deps.notifier, &settings);
        let assets = AssetService::new(
            loader.clone(),
            app_data_dir.join(DATA_DIR_NAME),
            settings.lazy_load_enabled,
        );

        tracing::info!(
            data_dir = %app_data_dir.display(),
            lazy_load_enabled = settings.lazy_load_enabled,
            timeout_ms = settings.lazy_load_timeout_ms,
            "kernel initialized"
        );

        Ok(Arc::new(Self {
            settings: store,
            loader,
            assets,
            extra_db,
            status: StatusBoard::new(),
            app_data_dir,
        }))
    }

    pub fn app_data_dir(&self) -> &Path {
        &self.app_data_dir
    }

    pub fn loader(&self) -> &LazyLoader {
        &self.loader
    }

    pub fn assets(&self) -> &AssetService {
        &self.assets
    }

    pub fn extra_db(&self) -> &ExtraDatabase {
        &self.extra_db
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn settings(&self) -> KernelSettings {
        self.settings.current()
    }

    pub fn lazy_load_stats(&self) -> LazyLoadStats {
        self.loader.stats()
    }

    /// Runs a sync job with the extra database closed. Statements submitted
    /// meanwhile are queued and replayed in order once the job returns.
    pub async fn run_sync<Fut, T>(&self, job: Fut) -> AppResult<T>
    where
        Fut: Future<Output = AppResult<T>>,
    {
        let started = Instant::now();
        tracing::info!("sync started");
        let result = self.extra_db.gate().run_exclusive(job).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(elapsed_ms, "sync finished"),
            Err(error) => tracing::error!(elapsed_ms, error = %error, "sync failed"),
        }
        result
    }

    /// Applies a settings patch. Lazy-load values take effect immediately;
    /// gate timings apply on the next start.
    pub fn update_settings(&self, patch: Value) -> AppResult<KernelSettings> {
        let updated = self.settings.update(patch)?;
        self.loader.set_timeout(updated.lazy_load_timeout_ms);
        self.loader.set_repo_key(updated.repo_key.clone());
        self.assets.set_lazy_load_enabled(updated.lazy_load_enabled);
        Ok(updated)
    }

    pub async fn close(&self) -> AppResult<()> {
        tracing::info!("kernel closing");
        self.extra_db.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::{Kernel, KernelDeps};
    use crate::errors::AppError;
    use crate::lazyload::{FetchError, FetchHints, IndexHandle, IndexedFile, RemoteFetcher};
    use crate::models::{KernelSettings, SqlRequest};
    use crate::notify::TracingNotifier;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    struct EmptyRepo {
        data_path: PathBuf,
    }

    impl RemoteFetcher for EmptyRepo {
        fn data_path(&self) -> &Path {
            &self.data_path
        }

        fn fetch_into(&self, absolute_path: &Path, _hints: &FetchHints) -> Result<(), FetchError> {
            Err(FetchError::NotInLatestIndex(absolute_path.display().to_string()))
        }

        fn latest(&self) -> anyhow::Result<IndexHandle> {
            Ok(IndexHandle { id: "empty".to_string() })
        }

        fn list_files(&self, _index: &IndexHandle) -> anyhow::Result<Vec<IndexedFile>> {
            Ok(Vec::new())
        }
    }

    fn deps(data_path: PathBuf) -> KernelDeps {
        KernelDeps {
            repo_provider: Arc::new(move || {
                Ok::<_, anyhow::Error>(Arc::new(EmptyRepo {
                    data_path: data_path.clone(),
                }) as Arc<dyn RemoteFetcher>)
            }),
            notifier: Arc::new(TracingNotifier),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn update_settings_applies_runtime_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::new(dir.path().to_path_buf(), KernelSettings::default(), deps(dir.path().join("data")))
            .expect("kernel");

        let error = kernel.loader().fetch("assets/a.png").await.expect_err("no repo key");
        assert_eq!(error.code(), "CONFIG_MISSING");

        let updated = kernel
            .update_settings(json!({ "repoKey": "k", "lazyLoadTimeoutMs": 900, "lazyLoadEnabled": false }))
            .expect("update");
        assert_eq!(updated.lazy_load_timeout_ms, 900);
        assert_eq!(kernel.loader().timeout_ms(), 900);
        assert!(!kernel.assets().lazy_load_enabled());

        let error = kernel.loader().fetch("assets/a.png").await.expect_err("not in index");
        assert_eq!(error.code(), "FETCH_FAILED");
        assert_eq!(kernel.lazy_load_stats().failed_count, 1);

        let reopened = Kernel::open(dir.path().to_path_buf(), deps(dir.path().join("data"))).expect("reopen");
        assert_eq!(reopened.settings().repo_key.as_deref(), Some("k"));
        kernel.close().await.expect("close");
        reopened.close().await.expect("close reopened");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_sync_job_still_reopens_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = Kernel::new(dir.path().to_path_buf(), KernelSettings::default(), deps(dir.path().join("data")))
            .expect("kernel");

        let error = kernel
            .run_sync(async { Err::<(), _>(AppError::Io("network down".to_string())) })
            .await
            .expect_err("job fails");
        assert_eq!(error.code(), "IO_FAILURE");
        assert!(!kernel.extra_db().snapshot().resource_unavailable);

        let response = kernel
            .extra_db()
            .query(SqlRequest {
                stmt: "SELECT 1 AS one".to_string(),
                args: Vec::new(),
            })
            .await;
        assert_eq!(response.data, json!([{ "one": 1 }]));
        kernel.close().await.expect("close");
    }
}
