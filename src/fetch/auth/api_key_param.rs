use crate::fetch::client::HttpClient;
use async_trait::async_trait;

/// Query parameter Open-Meteo reads the customer key from.
pub const API_KEY_PARAM: &str = "apikey";

/// Signs every request with the Open-Meteo customer API key.
///
/// A URL that already carries `apikey` is sent unchanged.
pub struct ApiKeyParam<C> {
    inner: C,
    key: String,
}

impl<C> ApiKeyParam<C> {
    pub fn new(inner: C, key: impl Into<String>) -> Self {
        Self {
            inner,
            key: key.into(),
        }
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKeyParam<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        sign(req.url_mut(), &self.key);
        self.inner.execute(req).await
    }
}

fn sign(url: &mut reqwest::Url, key: &str) {
    if !url.query_pairs().any(|(name, _)| name == API_KEY_PARAM) {
        url.query_pairs_mut().append_pair(API_KEY_PARAM, key);
    }
}
