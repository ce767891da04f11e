//! Authentication wrappers for [`HttpClient`](super::HttpClient).

mod api_key_param;

pub use api_key_param::{API_KEY_PARAM, ApiKeyParam};
