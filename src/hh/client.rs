use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::vacancy::{SearchPage, SearchQuery, VacancyDetail};
use super::HhError;
use crate::settings::Settings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// `base * 2^attempt`, saturating instead of overflowing.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

pub struct HhClient {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
    backoff: Duration,
}

impl HhClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::with_base_url(
            &settings.api_url,
            &settings.user_agent,
            settings.max_retries,
            Duration::from_millis(settings.backoff_ms),
        )
    }

    pub fn with_base_url(
        base_url: &str,
        user_agent: &str,
        max_retries: u32,
        backoff: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
            backoff,
        })
    }

    pub async fn search(&self, query: &SearchQuery, page: u32) -> Result<SearchPage, HhError> {
        self.get_json("/vacancies", &query.params(page)).await
    }

    pub async fn vacancy(&self, id: &str) -> Result<VacancyDetail, HhError> {
        self.get_json(&format!("/vacancies/{}", id), &[]).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, HhError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;
        loop {
            match self.get_once(&url, query).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let backoff = backoff_delay(self.backoff, attempt);
                    warn!(
                        "{} (attempt {}/{}), backing off {:.1}s",
                        e,
                        attempt + 1,
                        self.max_retries,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, HhError> {
        debug!(url, "GET");
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|source| HhError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HhError::Status {
                url: url.to_string(),
                status,
            });
        }

        response.json::<T>().await.map_err(|source| HhError::Decode {
            url: url.to_string(),
            source,
        })
    }
}
