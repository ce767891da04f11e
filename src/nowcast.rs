//! Model selection with refit-on-fresh-data and fallback to the
//! pre-trained artifact.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::advisory::{ForecastAlert, ThresholdLine, threshold_lines};
use crate::aqi::AqiReading;
use crate::config::Settings;
use crate::error::{ModelError, NowcastError, Result};
use crate::models::{
    FittedModel, ForecastResult, Horizon, ModelHandle, ModelKind, ModelOrigin, ModelRegistry,
    TARGET_COLUMN,
};
use crate::station::StationStore;
use crate::table::TimeSeriesTable;

/// A forecast with everything the dashboard shows next to it.
#[derive(Debug, Clone, Serialize)]
pub struct Nowcast {
    pub forecast: ForecastResult,
    pub next_hour: AqiReading,
    pub alert: ForecastAlert,
    pub alert_message: String,
    pub thresholds: Vec<ThresholdLine>,
    /// Non-fatal problems met while producing the forecast.
    pub warnings: Vec<String>,
}

/// Outcome of one refit attempt. Failures are cached too, so a failing
/// refit is not retried on every request within the TTL.
type RefitOutcome = std::result::Result<Arc<FittedModel>, String>;

pub struct Nowcaster {
    registry: Arc<ModelRegistry>,
    store: Arc<StationStore>,
    refits: Cache<(ModelKind, DateTime<Utc>), RefitOutcome>,
    refit_enabled: bool,
    refit_budget: Duration,
    fit_window: usize,
}

impl Nowcaster {
    pub fn new(registry: Arc<ModelRegistry>, store: Arc<StationStore>, settings: &Settings) -> Self {
        Self {
            registry,
            store,
            refits: Cache::builder()
                .max_capacity(32)
                .time_to_live(settings.refit_ttl)
                .build(),
            refit_enabled: settings.refit_enabled,
            refit_budget: settings.refit_budget,
            fit_window: settings.fit_window_hours,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StationStore {
        &self.store
    }

    /// Forecasts `horizon` hours with `kind`.
    ///
    /// # Errors
    ///
    /// Only a missing model ([`NowcastError::ModelUnavailable`],
    /// [`NowcastError::NoModels`]) or a failing pre-trained forecast is
    /// fatal. Refit problems become warnings.
    #[tracing::instrument(skip(self), fields(model = %kind, horizon = horizon.get()))]
    pub async fn forecast(&self, kind: ModelKind, horizon: Horizon) -> Result<Nowcast> {
        let pretrained = self.registry.get(kind)?;
        let data = self.store.current().await;
        let mut warnings = data.warnings.clone();

        let frame = data.model_frame();
        let handle = self.select(kind, &pretrained, &frame, &mut warnings).await;

        let context = Some(&data.weather);
        let forecast = match handle.forecast(horizon, context) {
            Ok(forecast) => forecast,
            Err(e) if handle.origin != ModelOrigin::Pretrained => {
                warn!(error = %e, "Refit model failed to forecast, using pre-trained model");
                warnings.push(format!(
                    "Refit {kind} model could not forecast ({e}); using pre-trained model"
                ));
                ModelHandle::pretrained(pretrained).forecast(horizon, context)?
            }
            Err(e) => return Err(e.into()),
        };

        let next = forecast
            .next_hour()
            .ok_or_else(|| NowcastError::InvalidData("forecast is empty".into()))?;
        let next_hour = AqiReading::from_pm25(next.mean)?;
        let alert = ForecastAlert::from_forecast(&forecast)?;

        Ok(Nowcast {
            alert_message: alert.message(),
            forecast,
            next_hour,
            alert,
            thresholds: threshold_lines(),
            warnings,
        })
    }

    /// The model to forecast with: a refit copy when refitting is enabled,
    /// the data is newer than the artifact, and the refit succeeds.
    async fn select(
        &self,
        kind: ModelKind,
        pretrained: &Arc<FittedModel>,
        frame: &TimeSeriesTable,
        warnings: &mut Vec<String>,
    ) -> ModelHandle {
        let fallback = ModelHandle::pretrained(pretrained.clone());
        if !self.refit_enabled {
            return fallback;
        }
        let Some((latest, _)) = frame.last_observed(TARGET_COLUMN) else {
            return fallback;
        };
        if latest <= pretrained.last_timestamp() {
            debug!(%latest, "Data is not newer than the artifact, skipping refit");
            return fallback;
        }

        let outcome = self
            .refits
            .get_with((kind, latest), self.refit(pretrained.clone(), frame.clone()))
            .await;

        match outcome {
            Ok(model) => ModelHandle::refit(model),
            Err(reason) => {
                warnings.push(format!(
                    "Could not refit {kind} with latest data ({reason}); using pre-trained model"
                ));
                fallback
            }
        }
    }

    /// Fits `pretrained`'s spec on `frame` on the blocking pool, bounded by
    /// the refit budget.
    async fn refit(&self, pretrained: Arc<FittedModel>, frame: TimeSeriesTable) -> RefitOutcome {
        let kind = pretrained.kind();
        let spec = pretrained.spec();
        let window = self.fit_window;
        let outcome = fit_within(self.refit_budget, move || spec.fit(&frame, window)).await;

        match &outcome {
            Ok(model) => info!(model = %kind, last = %model.last_timestamp(), "Refit complete"),
            Err(reason) => warn!(model = %kind, %reason, "Refit failed"),
        }
        outcome
    }
}

/// Runs `fit` on the blocking pool. Errors, panics and overrunning `budget`
/// all become a failed outcome.
async fn fit_within<F>(budget: Duration, fit: F) -> RefitOutcome
where
    F: FnOnce() -> std::result::Result<FittedModel, ModelError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(fit);
    match tokio::time::timeout(budget, task).await {
        Ok(Ok(Ok(model))) => Ok(Arc::new(model)),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(join_err)) => Err(format!("refit task failed: {join_err}")),
        Err(_) => Err(format!(
            "refit exceeded the {}s budget",
            budget.as_secs_f64()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StationInfo;
    use crate::models::testing::station_table;
    use crate::models::{ArimaxSpec, MAX_HORIZON, ModelSpec};
    use chrono::TimeDelta;

    const AIR: [&str; 2] = [TARGET_COLUMN, "pm10"];
    const WEATHER: [&str; 3] = ["temperature_2m", "relative_humidity_2m", "wind_speed_10m"];

    fn store(data: &TimeSeriesTable) -> Arc<StationStore> {
        Arc::new(StationStore::new(
            StationInfo::default(),
            data.select(&AIR),
            data.select(&WEATHER),
            None,
            Duration::from_secs(300),
            30,
        ))
    }

    fn settings(refit_enabled: bool) -> Settings {
        Settings {
            refit_enabled,
            fit_window_hours: 24 * 14,
            ..Settings::default()
        }
    }

    fn nowcaster(models: Vec<FittedModel>, data: &TimeSeriesTable, refit: bool) -> Nowcaster {
        let mut registry = ModelRegistry::default();
        for model in models {
            registry.insert(model);
        }
        Nowcaster::new(Arc::new(registry), store(data), &settings(refit))
    }

    #[tokio::test]
    async fn test_refits_on_newer_data() {
        let data = station_table(24 * 20);
        let stale = data.truncate_after(data.last_timestamp().unwrap() - TimeDelta::hours(24));
        let pretrained = ModelSpec::default_for(ModelKind::Ets).fit(&stale, 24 * 14).unwrap();

        let nowcaster = nowcaster(vec![pretrained], &data, true);
        let nowcast = nowcaster
            .forecast(ModelKind::Ets, Horizon::default())
            .await
            .unwrap();

        assert!(matches!(nowcast.forecast.origin, ModelOrigin::Refit { .. }));
        assert!(nowcast.warnings.is_empty());
        assert_eq!(nowcast.forecast.len(), MAX_HORIZON);
        assert_eq!(
            nowcast.forecast.points[0].timestamp,
            data.last_timestamp().unwrap() + TimeDelta::hours(1)
        );
    }

    #[tokio::test]
    async fn test_failing_refit_falls_back_to_pretrained() {
        let data = station_table(24 * 20);
        // The artifact was trained with a regressor the live data lacks.
        let mut training = data.truncate_after(data.last_timestamp().unwrap() - TimeDelta::hours(24));
        for ts in training.timestamps().collect::<Vec<_>>() {
            let pm1 = training.get(ts, "pm10").map(|v| 0.6 * v);
            training.set(ts, "pm1", pm1);
        }
        let spec = ModelSpec::Arimax(ArimaxSpec {
            exog: vec!["pm1".into()],
            ..ArimaxSpec::default()
        });
        let pretrained = spec.fit(&training, 24 * 14).unwrap();
        let pretrained_last = pretrained.last_timestamp();

        let nowcaster = nowcaster(vec![pretrained], &data, true);
        let nowcast = nowcaster
            .forecast(ModelKind::Arimax, Horizon::new(3).unwrap())
            .await
            .unwrap();

        assert_eq!(nowcast.forecast.origin, ModelOrigin::Pretrained);
        assert_eq!(nowcast.warnings.len(), 1);
        assert!(nowcast.warnings[0].contains("pm1"));
        assert_eq!(
            nowcast.forecast.points[0].timestamp,
            pretrained_last + TimeDelta::hours(1)
        );

        // The failure is cached rather than retried.
        let again = nowcaster
            .forecast(ModelKind::Arimax, Horizon::new(3).unwrap())
            .await
            .unwrap();
        assert_eq!(again.warnings, nowcast.warnings);
    }

    #[tokio::test]
    async fn test_refit_over_budget_falls_back_to_pretrained() {
        let data = station_table(24 * 20);
        let stale = data.truncate_after(data.last_timestamp().unwrap() - TimeDelta::hours(24));
        let pretrained = ModelSpec::default_for(ModelKind::Ets).fit(&stale, 24 * 14).unwrap();
        let pretrained_last = pretrained.last_timestamp();

        let mut registry = ModelRegistry::default();
        registry.insert(pretrained);
        let nowcaster = Nowcaster::new(
            Arc::new(registry),
            store(&data),
            &Settings {
                refit_budget: Duration::ZERO,
                ..settings(true)
            },
        );
        let nowcast = nowcaster
            .forecast(ModelKind::Ets, Horizon::default())
            .await
            .unwrap();

        assert_eq!(nowcast.forecast.origin, ModelOrigin::Pretrained);
        assert_eq!(nowcast.warnings.len(), 1);
        assert!(nowcast.warnings[0].contains("budget"), "{:?}", nowcast.warnings);
        assert_eq!(
            nowcast.forecast.points[0].timestamp,
            pretrained_last + TimeDelta::hours(1)
        );
    }

    #[tokio::test]
    async fn test_panicking_fit_is_a_failed_refit() {
        let outcome = fit_within(Duration::from_secs(5), || panic!("singular matrix")).await;
        let reason = outcome.unwrap_err();
        assert!(reason.starts_with("refit task failed"), "{reason}");
    }

    #[tokio::test]
    async fn test_fit_error_is_reported() {
        let outcome = fit_within(Duration::from_secs(5), || {
            Err(ModelError::MissingColumn("pm1".into()))
        })
        .await;
        assert!(outcome.unwrap_err().contains("pm1"));
    }

    #[tokio::test]
    async fn test_every_kind_falls_back_when_data_is_too_short() {
        let full = station_table(24 * 20);
        let mut models = Vec::new();
        for kind in ModelKind::ALL {
            models.push(ModelSpec::default_for(kind).fit(&full, 24 * 14).unwrap());
        }
        // Two fresh hours after a long gap: refits see almost no data.
        let last = full.last_timestamp().unwrap();
        let mut fresh = TimeSeriesTable::new(full.columns().iter().map(String::as_str));
        for h in 1..=2 {
            let row = full.row(last).unwrap().to_vec();
            fresh.insert_row(last + TimeDelta::hours(h), row);
        }

        let nowcaster = Nowcaster::new(
            Arc::new({
                let mut registry = ModelRegistry::default();
                models.into_iter().for_each(|m| registry.insert(m));
                registry
            }),
            store(&fresh),
            &Settings {
                fit_window_hours: 24,
                ..settings(true)
            },
        );

        for kind in ModelKind::ALL {
            let nowcast = nowcaster.forecast(kind, Horizon::default()).await.unwrap();
            assert_eq!(nowcast.forecast.origin, ModelOrigin::Pretrained, "{kind}");
            assert_eq!(nowcast.warnings.len(), 1, "{kind}");
        }
    }

    #[tokio::test]
    async fn test_no_refit_when_data_is_not_newer() {
        let data = station_table(24 * 20);
        let pretrained = ModelSpec::default_for(ModelKind::Var).fit(&data, 24 * 14).unwrap();

        let nowcaster = nowcaster(vec![pretrained], &data, true);
        let nowcast = nowcaster
            .forecast(ModelKind::Var, Horizon::new(2).unwrap())
            .await
            .unwrap();
        assert_eq!(nowcast.forecast.origin, ModelOrigin::Pretrained);
        assert!(nowcast.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_refit_disabled_uses_pretrained() {
        let data = station_table(24 * 20);
        let stale = data.truncate_after(data.last_timestamp().unwrap() - TimeDelta::hours(6));
        let pretrained = ModelSpec::default_for(ModelKind::Arima).fit(&stale, 24 * 14).unwrap();

        let nowcaster = nowcaster(vec![pretrained], &data, false);
        let nowcast = nowcaster
            .forecast(ModelKind::Arima, Horizon::new(1).unwrap())
            .await
            .unwrap();
        assert_eq!(nowcast.forecast.origin, ModelOrigin::Pretrained);
        let expected = AqiReading::from_pm25(nowcast.forecast.points[0].mean).unwrap();
        assert_eq!(nowcast.next_hour, expected);
    }

    #[tokio::test]
    async fn test_missing_models_are_blocking() {
        let data = station_table(48);
        let empty = nowcaster(vec![], &data, true);
        assert!(matches!(
            empty.forecast(ModelKind::Ets, Horizon::default()).await,
            Err(NowcastError::NoModels)
        ));

        let ets = ModelSpec::default_for(ModelKind::Ets).fit(&data, 48).unwrap();
        let only_ets = nowcaster(vec![ets], &data, true);
        assert!(matches!(
            only_ets.forecast(ModelKind::Var, Horizon::default()).await,
            Err(NowcastError::ModelUnavailable(ModelKind::Var))
        ));
    }
}
