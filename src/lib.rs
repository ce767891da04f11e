pub mod advisory;
pub mod aqi;
pub mod config;
pub mod error;
pub mod fetch;
pub mod infra;
pub mod merge;
pub mod models;
pub mod nowcast;
pub mod output;
pub mod server;
pub mod services;
pub mod station;
pub mod table;
