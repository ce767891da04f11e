//! Persisted model artifacts, one JSON file per model kind.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::{FittedModel, ForecastResult, Horizon, ModelKind, ModelOrigin, TARGET_COLUMN};
use crate::error::{ModelError, NowcastError, Result};
use crate::table::TimeSeriesTable;

/// A fitted model together with where it came from.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub model: Arc<FittedModel>,
    pub origin: ModelOrigin,
}

impl ModelHandle {
    pub fn pretrained(model: Arc<FittedModel>) -> Self {
        Self {
            model,
            origin: ModelOrigin::Pretrained,
        }
    }

    pub fn refit(model: Arc<FittedModel>) -> Self {
        let fitted_at = model.summary().fitted_at;
        Self {
            model,
            origin: ModelOrigin::Refit { fitted_at },
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.model.kind()
    }

    pub fn forecast(
        &self,
        horizon: Horizon,
        context: Option<&TimeSeriesTable>,
    ) -> std::result::Result<ForecastResult, ModelError> {
        self.model.forecast(horizon, self.origin, context)
    }
}

/// Listing entry for one loaded model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub kind: ModelKind,
    pub description: &'static str,
    pub fitted_at: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub observations: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<ModelKind, Arc<FittedModel>>,
}

impl ModelRegistry {
    /// `<dir>/<kind>/pm2_5.json`
    pub fn artifact_path(dir: &Path, kind: ModelKind) -> PathBuf {
        dir.join(kind.dir_name()).join(format!("{TARGET_COLUMN}.json"))
    }

    /// Loads every artifact found under `dir`.
    ///
    /// Missing artifacts are skipped; unreadable ones are logged and skipped,
    /// so a single corrupt file never takes the other models down.
    #[tracing::instrument(skip_all, fields(dir = %dir.display()))]
    pub fn load_dir(dir: &Path) -> Self {
        let mut registry = Self::default();
        for kind in ModelKind::ALL {
            let path = Self::artifact_path(dir, kind);
            if !path.exists() {
                continue;
            }
            match Self::load_file(&path) {
                Ok(model) if model.kind() == kind => {
                    info!(model = %kind, last = %model.last_timestamp(), "Loaded model");
                    registry.insert(model);
                }
                Ok(model) => warn!(
                    path = %path.display(),
                    expected = %kind,
                    found = %model.kind(),
                    "Artifact holds the wrong model kind, skipping"
                ),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to load model, skipping"),
            }
        }
        if registry.is_empty() {
            warn!("No models loaded");
        }
        registry
    }

    fn load_file(path: &Path) -> Result<FittedModel> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn insert(&mut self, model: FittedModel) {
        self.models.insert(model.kind(), Arc::new(model));
    }

    pub fn get(&self, kind: ModelKind) -> Result<Arc<FittedModel>> {
        if self.models.is_empty() {
            return Err(NowcastError::NoModels);
        }
        self.models
            .get(&kind)
            .cloned()
            .ok_or(NowcastError::ModelUnavailable(kind))
    }

    /// Loaded kinds in display order.
    pub fn available(&self) -> Vec<ModelKind> {
        self.models.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn describe(&self) -> Vec<ModelInfo> {
        self.models
            .iter()
            .map(|(kind, model)| {
                let summary = model.summary();
                ModelInfo {
                    kind: *kind,
                    description: kind.description(),
                    fitted_at: summary.fitted_at,
                    last_timestamp: summary.last_timestamp,
                    observations: summary.observations,
                }
            })
            .collect()
    }

    /// Writes `model` to its artifact path under `dir`, returning the path.
    pub fn save(dir: &Path, model: &FittedModel) -> Result<PathBuf> {
        let path = Self::artifact_path(dir, model.kind());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec_pretty(model)?)?;
        info!(model = %model.kind(), path = %path.display(), "Saved model");
        Ok(path)
    }
}
