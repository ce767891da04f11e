//! CLI entry point for the PM2.5 nowcasting service.
//!
//! Provides subcommands for serving the dashboard API, issuing forecasts and
//! advisories from the terminal, refreshing the cached station data, and
//! training the model artifacts.

use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use aq_nowcast::{
    advisory::HealthRecommendations,
    aqi::AqiReading,
    config::Settings,
    fetch::open_meteo_client,
    models::{Horizon, MAX_HORIZON, ModelKind, ModelRegistry, ModelSpec},
    nowcast::Nowcaster,
    output::{append_forecast, print_json, write_forecast_csv},
    server::{self, AppState},
    station::StationStore,
    table::floor_hour,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "aq_nowcast")]
#[command(about = "Hanoi PM2.5 nowcasting and health advisory", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the dashboard HTTP API
    Serve {
        /// Address to bind (overrides HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Forecast PM2.5 for the next hours
    Forecast {
        /// Model to forecast with (ETS, ARIMA, ARIMAX, VAR)
        #[arg(short, long, default_value = "ETS")]
        model: String,

        /// Hours ahead, 1 to 6
        #[arg(long, default_value_t = MAX_HORIZON)]
        horizon: usize,

        /// Write the forecast table to this CSV file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// CSV log to append every issued forecast hour to
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Show current conditions with health recommendations
    Advisory {
        /// Model used for the forecast alert
        #[arg(short, long, default_value = "ETS")]
        model: String,
    },
    /// Fetch recent observations and update the cached CSVs
    Fetch,
    /// Fit models on the cached CSVs and save the artifacts
    Train {
        /// Only train this model
        #[arg(short, long)]
        model: Option<String>,

        /// Training window in hours (overrides FIT_WINDOW_HOURS)
        #[arg(short, long)]
        window: Option<usize>,

        /// Extend the cached CSVs with live data before fitting
        #[arg(long, default_value_t = false)]
        live: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/aq_nowcast.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("aq_nowcast.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            let nowcaster = nowcaster(&settings)?;
            if nowcaster.registry().is_empty() {
                warn!(model_dir = %settings.model_dir.display(), "Serving without models; run `train` first");
            }
            server::serve(settings.bind_addr()?, AppState::new(Arc::new(nowcaster))).await?;
        }
        Commands::Forecast {
            model,
            horizon,
            output,
            log,
        } => {
            let kind: ModelKind = model.parse()?;
            let horizon = Horizon::new(horizon)?;
            let nowcast = nowcaster(&settings)?.forecast(kind, horizon).await?;

            for warning in &nowcast.warnings {
                warn!("{warning}");
            }
            print_json(&nowcast)?;

            if let Some(path) = output {
                let file = File::create(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                write_forecast_csv(file, &nowcast.forecast)?;
                info!(path = %path.display(), "Forecast table written");
            }
            if let Some(path) = log {
                append_forecast(&path, &nowcast.forecast, Utc::now())?;
            }
        }
        Commands::Advisory { model } => {
            advisory(&settings, model.parse()?).await?;
        }
        Commands::Fetch => {
            settings.live_fetch = true;
            fetch(&settings).await?;
        }
        Commands::Train {
            model,
            window,
            live,
        } => {
            let kinds = match model {
                Some(name) => vec![name.parse::<ModelKind>()?],
                None => ModelKind::ALL.to_vec(),
            };
            if let Some(window) = window {
                settings.fit_window_hours = window;
            }
            settings.live_fetch = live;
            train(&settings, &kinds).await?;
        }
    }

    Ok(())
}

/// Loads the model registry and station store described by `settings`.
fn nowcaster(settings: &Settings) -> Result<Nowcaster> {
    let client = open_meteo_client(settings.api_key.as_deref())?;
    let store = StationStore::load(settings, client).context("loading station data")?;
    let registry = ModelRegistry::load_dir(&settings.model_dir);
    Ok(Nowcaster::new(
        Arc::new(registry),
        Arc::new(store),
        settings,
    ))
}

/// Logs current conditions, the reading and guidance, and the forecast alert
/// when a model is available.
#[tracing::instrument(skip(settings))]
async fn advisory(settings: &Settings, kind: ModelKind) -> Result<()> {
    let nowcaster = nowcaster(settings)?;
    let data = nowcaster.store().current().await;
    let conditions = data.current_conditions()?;
    let reading = AqiReading::from_pm25(conditions.pm25)?;
    let recommendations = HealthRecommendations::for_category(reading.category);

    let alert = match nowcaster.forecast(kind, Horizon::default()).await {
        Ok(nowcast) => Some(nowcast.alert_message),
        Err(e) => {
            warn!(error = %e, "Forecast alert unavailable");
            None
        }
    };

    print_json(&serde_json::json!({
        "station": nowcaster.store().station(),
        "conditions": conditions,
        "reading": reading,
        "recommendations": recommendations,
        "alert": alert,
        "warnings": data.warnings,
    }))?;
    Ok(())
}

/// Extends the cached CSVs with archive and real-time data.
#[tracing::instrument(skip_all, fields(data_dir = %settings.data_dir.display()))]
async fn fetch(settings: &Settings) -> Result<()> {
    let client = open_meteo_client(settings.api_key.as_deref())?;
    let store = StationStore::load(settings, client)?;
    let data = store.refresh().await;

    for warning in &data.warnings {
        error!("{warning}");
    }

    // Forecast weather rows stay live-only.
    let weather = data.weather.truncate_after(floor_hour(Utc::now()));
    data.air.to_csv_path(settings.air_csv())?;
    weather.to_csv_path(settings.weather_csv())?;

    let info_path = settings.info_path();
    if !info_path.exists() {
        std::fs::write(&info_path, serde_json::to_vec_pretty(store.station())?)?;
    }

    info!(
        air_rows = data.air.len(),
        weather_rows = weather.len(),
        last_observed = ?data.last_observed(),
        "Cached CSVs updated"
    );
    Ok(())
}

/// Fits each of `kinds` and saves the artifacts under the model directory.
#[tracing::instrument(skip(settings), fields(window = settings.fit_window_hours))]
async fn train(settings: &Settings, kinds: &[ModelKind]) -> Result<()> {
    let client = open_meteo_client(settings.api_key.as_deref())?;
    let store = StationStore::load(settings, client)?;
    let frame = store.current().await.model_frame();
    info!(rows = frame.len(), "Training frame ready");

    let mut failures = 0;
    for &kind in kinds {
        let spec = ModelSpec::default_for(kind);
        let window = settings.fit_window_hours;
        let data = frame.clone();
        let fitted = tokio::task::spawn_blocking(move || spec.fit(&data, window)).await?;

        match fitted {
            Ok(model) => {
                ModelRegistry::save(&settings.model_dir, &model)?;
            }
            Err(e) => {
                error!(model = %kind, error = %e, "Training failed");
                failures += 1;
            }
        }
    }

    if failures == kinds.len() {
        anyhow::bail!("no model could be trained");
    }
    info!(
        trained = kinds.len() - failures,
        failed = failures,
        "Training finished"
    );
    Ok(())
}
