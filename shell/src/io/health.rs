//! Backend health endpoint probe.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::trace;

/// One bounded readiness check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns true only when the endpoint answered with the expected status.
    /// Connection errors and timeouts are `false`, never retried here.
    async fn probe(&self) -> bool;
}

/// `GET <url>` expecting exactly HTTP 200.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .context("build health check client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status();
                trace!(url = %self.url, %status, "health check answered");
                status == StatusCode::OK
            }
            Err(err) => {
                trace!(url = %self.url, err = %err, "health check failed");
                false
            }
        }
    }
}
