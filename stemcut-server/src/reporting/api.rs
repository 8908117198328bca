//! External API reporter

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::{TrackMetadata, TrackReporter};

pub struct ApiReporter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl ApiReporter {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

#[async_trait]
impl TrackReporter for ApiReporter {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn report(&self, metadata: &TrackMetadata) -> Result<()> {
        if !self.is_configured() {
            debug!(title = %metadata.title, "API_ENDPOINT not configured, skipping report");
            return Ok(());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(metadata)
            .send()
            .await
            .context("API request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            anyhow::bail!("API returned {}: {}", status, snippet);
        }

        info!(title = %metadata.title, format = metadata.format.label(), "Reported to API");
        Ok(())
    }
}
