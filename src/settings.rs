use crate::errors::{AppError, AppResult};
use crate::models::KernelSettings;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

pub const SETTINGS_FILE_NAME: &str = "kernel-settings.json";

#[derive(Clone)]
pub struct SettingsStore {
    path: PathBuf,
    current: Arc<RwLock<KernelSettings>>,
}

impl SettingsStore {
    /// Reads `<data_dir>/kernel-settings.json`. A missing file yields the
    /// defaults; an unreadable one is logged and replaced by the defaults.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(SETTINGS_FILE_NAME);
        let settings = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<KernelSettings>(&raw) {
                Ok(settings) => settings,
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "invalid settings file, using defaults");
                    KernelSettings::default()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => KernelSettings::default(),
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to read settings file, using defaults");
                KernelSettings::default()
            }
        };
        Self::with_settings(path, settings)
    }

    pub fn with_settings(path: PathBuf, settings: KernelSettings) -> Self {
        Self {
            path,
            current: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> KernelSettings {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Merges `patch` into the current settings and persists the result. The
    /// stored settings are left untouched when the merged value does not
    /// parse.
    pub fn update(&self, patch: Value) -> AppResult<KernelSettings> {
        if !patch.is_object() {
            return Err(AppError::Cli("settings patch must be a JSON object".to_string()));
        }

        let mut writer = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut merged = serde_json::to_value(&*writer)?;
        merge_json(&mut merged, patch);
        let updated: KernelSettings =
            serde_json::from_value(merged).map_err(|error| AppError::Cli(format!("invalid settings: {}", error)))?;

        self.persist(&updated)?;
        *writer = updated.clone();
        Ok(updated)
    }

    fn persist(&self, settings: &KernelSettings) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, body)?;
        tracing::debug!(path = %self.path.display(), "settings persisted");
        Ok(())
    }
}

fn merge_json(target: &mut Value, update: Value) {
    match (target, update) {
        (Value::Object(target_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
