use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use aq_nowcast::aqi::AqiReading;
use aq_nowcast::config::Settings;
use aq_nowcast::fetch::open_meteo_client;
use aq_nowcast::merge::merge_tables;
use aq_nowcast::models::{Horizon, ModelKind, ModelOrigin, ModelRegistry, ModelSpec};
use aq_nowcast::nowcast::Nowcaster;
use aq_nowcast::output::{append_forecast, write_forecast_csv};
use aq_nowcast::station::StationStore;
use aq_nowcast::table::TimeSeriesTable;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use proptest::prelude::*;

const HOURS: usize = 24 * 21;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap()
}

/// Deterministic noise in [-0.5, 0.5).
fn noise(i: usize) -> f64 {
    let mut z = (i as u64).wrapping_add(0x51).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64 - 0.5
}

/// Writes cleaned CSVs shaped like the ones produced by the `fetch` command
/// and returns settings pointing at them.
fn seed_data_dir(name: &str) -> Settings {
    let root = std::env::temp_dir().join(format!("aq_nowcast_it_{name}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);
    let settings = Settings {
        data_dir: root.join("data"),
        model_dir: root.join("models"),
        live_fetch: false,
        fit_window_hours: HOURS,
        ..Settings::default()
    };
    std::fs::create_dir_all(settings.cleaned_dir()).unwrap();

    let mut air = String::from("time,pm2_5,pm10,ozone\n");
    let mut weather =
        String::from("time,temperature_2m,relative_humidity_2m,wind_speed_10m,precipitation\n");
    let mut pm = 40.0;
    for i in 0..HOURS {
        let ts = (start() + TimeDelta::hours(i as i64)).format("%Y-%m-%d %H:%M:%S");
        let phase = (i % 24) as f64 / 24.0 * std::f64::consts::TAU;
        let temperature = 24.0 + 4.0 * phase.sin() + noise(i + 1);
        let humidity = 70.0 - 10.0 * phase.sin() + 2.0 * noise(i + 2);
        let wind = 3.0 + 1.5 * phase.cos().abs() + noise(i + 3);
        pm = 0.8 * pm + 0.2 * (45.0 + 10.0 * phase.cos()) - 0.8 * (wind - 3.0) + 3.0 * noise(i);
        let pm10 = 1.6 * pm + 2.0 * noise(i + 4);
        // Sparse ozone column with gaps, as the provider reports it.
        let ozone = if i % 5 == 0 {
            String::new()
        } else {
            format!("{:.1}", 30.0 + 5.0 * noise(i + 5))
        };
        writeln!(air, "{ts},{pm:.3},{pm10:.3},{ozone}").unwrap();
        writeln!(
            weather,
            "{ts},{temperature:.2},{humidity:.1},{wind:.2},0.0"
        )
        .unwrap();
    }
    std::fs::write(settings.air_csv(), air).unwrap();
    std::fs::write(settings.weather_csv(), weather).unwrap();
    std::fs::write(
        settings.info_path(),
        r#"{"name": "Test station", "latitude": 21.0, "longitude": 105.8}"#,
    )
    .unwrap();
    settings
}

fn cleanup(settings: &Settings) {
    if let Some(root) = settings.data_dir.parent() {
        let _ = std::fs::remove_dir_all(root);
    }
}

fn load_store(settings: &Settings) -> Arc<StationStore> {
    let client = open_meteo_client(None).unwrap();
    Arc::new(StationStore::load(settings, client).unwrap())
}

#[tokio::test]
async fn test_full_pipeline() {
    let settings = seed_data_dir("pipeline");
    let store = load_store(&settings);
    assert_eq!(store.station().name, "Test station");

    // Train every model on the cached CSVs.
    let frame = store.current().await.model_frame();
    assert_eq!(frame.len(), HOURS);
    for kind in ModelKind::ALL {
        let model = ModelSpec::default_for(kind)
            .fit(&frame, settings.fit_window_hours)
            .expect("model should fit synthetic station data");
        ModelRegistry::save(&settings.model_dir, &model).unwrap();
    }

    let registry = ModelRegistry::load_dir(&settings.model_dir);
    assert_eq!(registry.available(), ModelKind::ALL.to_vec());

    let nowcaster = Nowcaster::new(Arc::new(registry), store, &settings);
    let last = start() + TimeDelta::hours(HOURS as i64 - 1);

    for kind in ModelKind::ALL {
        let nowcast = nowcaster.forecast(kind, Horizon::default()).await.unwrap();
        let forecast = &nowcast.forecast;

        assert_eq!(forecast.model, kind);
        // Data is not newer than the artifacts, so no refit happens.
        assert_eq!(forecast.origin, ModelOrigin::Pretrained);
        assert!(nowcast.warnings.is_empty(), "{kind}: {:?}", nowcast.warnings);
        assert_eq!(forecast.len(), 6);
        for (step, point) in forecast.points.iter().enumerate() {
            assert_eq!(point.timestamp, last + TimeDelta::hours(step as i64 + 1));
            assert!(point.lower <= point.mean && point.mean <= point.upper);
            assert!(point.mean > 0.0 && point.mean < 150.0, "{kind}: {}", point.mean);
        }
        let first = forecast.points[0].mean;
        assert_eq!(nowcast.next_hour, AqiReading::from_pm25(first).unwrap());
    }

    cleanup(&settings);
}

#[tokio::test]
async fn test_forecast_exports() {
    let settings = seed_data_dir("exports");
    let store = load_store(&settings);
    let frame = store.current().await.model_frame();
    let mut registry = ModelRegistry::default();
    registry.insert(ModelSpec::default_for(ModelKind::Ets).fit(&frame, HOURS).unwrap());

    let nowcaster = Nowcaster::new(Arc::new(registry), store, &settings);
    let nowcast = nowcaster
        .forecast(ModelKind::Ets, Horizon::new(3).unwrap())
        .await
        .unwrap();

    let mut table = Vec::new();
    write_forecast_csv(&mut table, &nowcast.forecast).unwrap();
    let table = String::from_utf8(table).unwrap();
    assert_eq!(table.lines().count(), 4);
    assert!(table.lines().nth(1).unwrap().starts_with("2025-11-22 00:00,"));

    let log: PathBuf = settings.data_dir.join("forecasts").join("log.csv");
    append_forecast(&log, &nowcast.forecast, Utc::now()).unwrap();
    append_forecast(&log, &nowcast.forecast, Utc::now()).unwrap();
    let content = std::fs::read_to_string(&log).unwrap();
    assert_eq!(content.lines().count(), 1 + 2 * 3);

    cleanup(&settings);
}

#[tokio::test]
async fn test_missing_data_dir_serves_empty_station() {
    let root = std::env::temp_dir().join(format!("aq_nowcast_it_empty_{}", std::process::id()));
    let settings = Settings {
        data_dir: root.join("data"),
        model_dir: root.join("models"),
        live_fetch: false,
        ..Settings::default()
    };
    let store = load_store(&settings);
    let data = store.current().await;
    assert!(data.air.is_empty());
    assert!(data.history(48).is_empty());
    assert!(data.current_conditions().is_err());

    let nowcaster = Nowcaster::new(
        Arc::new(ModelRegistry::load_dir(&settings.model_dir)),
        store,
        &settings,
    );
    assert!(
        nowcaster
            .forecast(ModelKind::Ets, Horizon::default())
            .await
            .is_err()
    );
}

fn table_strategy() -> impl Strategy<Value = TimeSeriesTable> {
    prop::collection::vec(
        (0i64..48, prop::option::of(0.0f64..500.0), prop::option::of(-10.0f64..40.0)),
        0..40,
    )
    .prop_map(|rows| {
        let mut table = TimeSeriesTable::new(["pm2_5", "temperature_2m"]);
        for (h, pm, temp) in rows {
            table.insert_row(start() + TimeDelta::hours(h), vec![pm, temp]);
        }
        table
    })
}

proptest! {
    #[test]
    fn test_merge_is_idempotent(base in table_strategy(), newer in table_strategy()) {
        let once = merge_tables(&base, [&newer]);
        let twice = merge_tables(&once, [&newer]);
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(merge_tables(&base, [&base]), base.clone());
    }

    #[test]
    fn test_merge_newest_observation_wins(base in table_strategy(), newer in table_strategy()) {
        let merged = merge_tables(&base, [&newer]);
        for ts in base.timestamps().chain(newer.timestamps()) {
            for column in ["pm2_5", "temperature_2m"] {
                let expected = newer.get(ts, column).or_else(|| base.get(ts, column));
                prop_assert_eq!(merged.get(ts, column), expected);
            }
        }
        prop_assert_eq!(
            merged.len(),
            base.timestamps().chain(newer.timestamps()).collect::<std::collections::BTreeSet<_>>().len()
        );
    }
}
