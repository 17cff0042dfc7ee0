use crate::errors::{AppError, AppResult};
use crate::lazyload::{contained_path, normalize_key, LazyLoader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Asset access on top of the lazy loader: local hits are served directly,
/// misses are fetched from the repository when lazy loading is enabled.
#[derive(Clone)]
pub struct AssetService {
    loader: LazyLoader,
    data_dir: PathBuf,
    enabled: Arc<AtomicBool>,
}

impl AssetService {
    pub fn new(loader: LazyLoader, data_dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            loader,
            data_dir: data_dir.into(),
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn lazy_load_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_lazy_load_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::Relaxed);
        if previous != enabled {
            tracing::info!(enabled, "lazy load toggled");
        }
    }

    pub async fn load_asset_on_demand(&self, asset_path: &str) -> AppResult<()> {
        let local = self.resolve(asset_path)?;
        if local.is_file() {
            return Ok(());
        }
        if !self.lazy_load_enabled() {
            return Err(AppError::NotFound(format!(
                "asset {} is not available locally and lazy load is disabled",
                asset_path
            )));
        }
        self.loader.fetch(asset_path).await
    }

    pub fn is_asset_cached(&self, asset_path: &str) -> bool {
        self.resolve(asset_path).map(|path| path.is_file()).unwrap_or(false)
    }

    pub fn clear_lazy_cache(&self) -> usize {
        let cleared = self.loader.clear_terminal();
        tracing::info!(cleared, "lazy load cache cleared");
        cleared
    }

    fn resolve(&self, asset_path: &str) -> AppResult<PathBuf> {
        let key = normalize_key(asset_path);
        Ok(self.data_dir.join(contained_path(&key)?))
    }
}
