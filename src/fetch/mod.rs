//! HTTP plumbing shared by the upstream data sources.
//!
//! Sources talk to an [`HttpClient`] rather than to `reqwest` directly so
//! that authentication can be layered on (see [`auth::ApiKeyParam`]).

mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::debug;

use crate::error::{NowcastError, Result};

/// Client used for the Open-Meteo sources, keyed when `api_key` is set.
pub fn open_meteo_client(api_key: Option<&str>) -> Result<Arc<dyn HttpClient>> {
    let basic = BasicClient::new()?;
    Ok(match api_key {
        Some(key) => Arc::new(auth::ApiKeyParam::new(basic, key)),
        None => Arc::new(basic),
    })
}

/// Status and body of a completed request.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

/// Issues a GET for `url` and returns the raw body, whatever the status.
#[tracing::instrument(skip(client), fields(url = %url))]
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Fetched> {
    let parsed = url
        .parse::<reqwest::Url>()
        .map_err(|e| NowcastError::fetch(url, format!("invalid URL: {e}")))?;
    let req = reqwest::Request::new(reqwest::Method::GET, parsed);

    let resp = client.execute(req).await?;
    let status = resp.status();
    let body = resp.bytes().await?.to_vec();
    debug!(status = status.as_u16(), bytes = body.len(), "Response received");
    Ok(Fetched { status, body })
}
