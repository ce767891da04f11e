//! API route handlers

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::AppState;
use crate::advisory::HealthRecommendations;
use crate::aqi::AqiReading;
use crate::config::StationInfo;
use crate::error::NowcastError;
use crate::models::{Horizon, ModelInfo, ModelKind};
use crate::nowcast::Nowcast;
use crate::output::{export_file_name, write_forecast_csv};
use crate::station::{CurrentConditions, HistoryPoint};

const DEFAULT_HISTORY_HOURS: usize = 48;
const MAX_HISTORY_HOURS: usize = 24 * 31;

/// JSON error body with the status it maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl From<NowcastError> for ApiError {
    fn from(err: NowcastError) -> Self {
        let status = match &err {
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            NowcastError::NoModels | NowcastError::ModelUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "Request failed");
        } else {
            warn!(status = %self.status, error = %self.message, "Rejected request");
        }
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "models": state.nowcaster.registry().available(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub default: Option<ModelKind>,
    pub models: Vec<ModelInfo>,
}

pub async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let registry = state.nowcaster.registry();
    Json(ModelsResponse {
        default: registry.available().first().copied(),
        models: registry.describe(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ForecastQuery {
    pub model: Option<String>,
    pub horizon: Option<usize>,
}

impl ForecastQuery {
    /// Requested model, else the first one loaded.
    fn resolve(&self, state: &AppState) -> ApiResult<(ModelKind, Horizon)> {
        let kind = match &self.model {
            Some(name) => name.parse::<ModelKind>()?,
            None => state
                .nowcaster
                .registry()
                .available()
                .first()
                .copied()
                .ok_or(NowcastError::NoModels)?,
        };
        let horizon = match self.horizon {
            Some(steps) => Horizon::new(steps)?,
            None => Horizon::default(),
        };
        Ok((kind, horizon))
    }
}

pub async fn forecast(
    State(state): State<AppState>,
    Query(query): Query<ForecastQuery>,
) -> ApiResult<Json<Nowcast>> {
    let (kind, horizon) = query.resolve(&state)?;
    Ok(Json(state.nowcaster.forecast(kind, horizon).await?))
}

pub async fn forecast_csv(
    State(state): State<AppState>,
    Query(query): Query<ForecastQuery>,
) -> ApiResult<Response> {
    let (kind, horizon) = query.resolve(&state)?;
    let nowcast = state.nowcaster.forecast(kind, horizon).await?;

    let mut body = Vec::new();
    write_forecast_csv(&mut body, &nowcast.forecast)?;
    let disposition = format!("attachment; filename=\"{}\"", export_file_name(Utc::now()));

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub hours: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub hours: usize,
    pub points: Vec<HistoryPoint>,
}

pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let hours = query.hours.unwrap_or(DEFAULT_HISTORY_HOURS);
    if !(1..=MAX_HISTORY_HOURS).contains(&hours) {
        return Err(ApiError::bad_request(format!(
            "hours must be between 1 and {MAX_HISTORY_HOURS}, got {hours}"
        )));
    }
    let data = state.nowcaster.store().current().await;
    Ok(Json(HistoryResponse {
        hours,
        points: data.history(hours),
    }))
}

#[derive(Debug, Serialize)]
pub struct ConditionsResponse {
    pub conditions: CurrentConditions,
    pub reading: AqiReading,
    pub recommendations: HealthRecommendations,
    pub refreshed_at: DateTime<Utc>,
    pub warnings: Vec<String>,
}

pub async fn conditions(State(state): State<AppState>) -> ApiResult<Json<ConditionsResponse>> {
    let data = state.nowcaster.store().current().await;
    let conditions = data
        .current_conditions()
        .map_err(|e| ApiError::unavailable(e.to_string()))?;
    let reading = AqiReading::from_pm25(conditions.pm25)?;

    Ok(Json(ConditionsResponse {
        recommendations: HealthRecommendations::for_category(reading.category),
        conditions,
        reading,
        refreshed_at: data.refreshed_at,
        warnings: data.warnings.clone(),
    }))
}

#[derive(Debug, Serialize)]
pub struct StationResponse {
    pub station: StationInfo,
    pub reading: Option<AqiReading>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Map panel: station coordinates with the latest reading, if any.
pub async fn station(State(state): State<AppState>) -> ApiResult<Json<StationResponse>> {
    let store = state.nowcaster.store();
    let data = store.current().await;
    let (reading, last_updated) = match data.current_conditions() {
        Ok(current) => (
            Some(AqiReading::from_pm25(current.pm25)?),
            Some(current.last_updated),
        ),
        Err(_) => (None, None),
    };

    Ok(Json(StationResponse {
        station: store.station().clone(),
        reading,
        last_updated,
    }))
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub refreshed_at: DateTime<Utc>,
    pub last_observed: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
}

pub async fn refresh(State(state): State<AppState>) -> Json<RefreshResponse> {
    let data = state.nowcaster.store().refresh().await;
    Json(RefreshResponse {
        refreshed_at: data.refreshed_at,
        last_observed: data.last_observed(),
        warnings: data.warnings.clone(),
    })
}
