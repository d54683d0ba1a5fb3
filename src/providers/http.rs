use anyhow::Result;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::core::ProviderError;

/// Shared GET + JSON plumbing for providers: a bounded request timeout, a
/// minimum spacing between requests, and mapping of transport and HTTP
/// failures onto [`ProviderError`].
pub struct HttpFetcher {
    provider: String,
    client: reqwest::Client,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl HttpFetcher {
    pub fn new(provider: &str, timeout: Duration, min_interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ratevault/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            provider: provider.to_string(),
            client,
            min_interval,
            last_request: Mutex::new(None),
        })
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!(provider = %self.provider, ?wait, "Throttling request");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Issues a GET and decodes the body as `T`. `log_url` is what ends up in
    /// the logs, so callers can keep credentials out of them.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        log_url: &str,
    ) -> Result<T, ProviderError> {
        self.throttle().await;
        debug!(provider = %self.provider, url = %log_url, "Requesting rates");

        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            debug!(provider = %self.provider, %status, "Provider returned an error status");
            return Err(classify_status(&self.provider, status));
        }

        serde_json::from_str(&body).map_err(|e| ProviderError::MalformedResponse {
            provider: self.provider.clone(),
            message: e.to_string(),
        })
    }

    fn transport_error(&self, error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Timeout {
                provider: self.provider.clone(),
            }
        } else {
            ProviderError::Network {
                provider: self.provider.clone(),
                message: error.to_string(),
            }
        }
    }
}

pub fn classify_status(provider: &str, status: StatusCode) -> ProviderError {
    let provider = provider.to_string();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { provider },
        StatusCode::REQUEST_TIMEOUT => ProviderError::Timeout { provider },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized { provider },
        s if s.is_server_error() => ProviderError::Server {
            provider,
            status: s.as_u16(),
        },
        s => ProviderError::Http {
            provider,
            status: s.as_u16(),
        },
    }
}
