pub mod client;
pub mod loader;
pub mod vacancy;

use reqwest::StatusCode;
use thiserror::Error;

pub use client::HhClient;
pub use loader::{load_vacancies, LoadStats};
pub use vacancy::SearchQuery;

#[derive(Debug, Error)]
pub enum HhError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl HhError {
    /// Rate limiting, server errors and connection trouble are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            HhError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            HhError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            HhError::Decode { .. } => false,
        }
    }
}
