use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::services::retry::{AttemptError, RetryExhausted, RetryPolicy};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The feed could not be fetched within the retry budget.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct FetchFailure(#[from] pub RetryExhausted);

impl FetchFailure {
    pub fn attempts(&self) -> u32 {
        self.0.attempts
    }

    pub fn last_error(&self) -> &AttemptError {
        &self.0.last
    }
}

/// Authenticated GET against the device feed with bounded retries.
///
/// Headers, including the bearer token, are fixed for the whole call; retries
/// reuse them rather than minting a new token.
pub struct Fetcher {
    client: Client,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the response body of the first successful attempt.
    pub async fn fetch(&self, url: &str, headers: &HeaderMap) -> Result<String, FetchFailure> {
        let body = self
            .policy
            .run_with_tokio(|attempt| {
                let request = self.client.get(url).headers(headers.clone());
                async move {
                    debug!(attempt, "Requesting device log");
                    let response = request.send().await?;
                    let response = AttemptError::check_status(response).await?;
                    Ok::<_, AttemptError>(response.text().await?)
                }
            })
            .await?;

        Ok(body)
    }
}
