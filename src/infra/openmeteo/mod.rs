//! Open-Meteo air-quality, archive and forecast APIs.

mod client;

pub use client::{AIR_VARIABLES, OpenMeteoSource, WEATHER_VARIABLES};
