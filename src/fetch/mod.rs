//! HTTP fetching under the rotation barrier
//!
//! All page fetches go through [`Fetcher::fetch_extracted`]: enter the
//! barrier's critical section, fetch, build the page's extractor, and — if
//! the page turns out to be a challenge interstitial — park for rotation and
//! redo the same URL against the fresh identity. Network errors and timeouts
//! surface as [`CrawlError::TransientFetch`]; the caller decides the requeue.

use crate::config::FetchConfig;
use crate::extract::{ExtractorFactory, PageExtractor};
use crate::rotation::RotationCoordinator;
use crate::{CrawlError, FlowError};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// Builds the shared HTTP client.
pub fn build_http_client(config: &FetchConfig) -> Result<Client, FlowError> {
    let client = Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .gzip(true)
        .brotli(true)
        .build()?;
    Ok(client)
}

/// Barrier-guarded page fetcher shared by every worker in a process.
pub struct Fetcher {
    client: Client,
    coordinator: Arc<RotationCoordinator>,
}

impl Fetcher {
    pub fn new(config: &FetchConfig, coordinator: Arc<RotationCoordinator>) -> Result<Self, FlowError> {
        Ok(Fetcher {
            client: build_http_client(config)?,
            coordinator,
        })
    }

    /// Fetches `url` and hands the body to `factory`, retrying the same URL
    /// across rotations until a non-challenge page comes back.
    ///
    /// A blocked-identity page additionally surfaces as
    /// [`CrawlError::BanDetected`] so the pool can notify remediation.
    pub async fn fetch_extracted(
        &self,
        factory: &ExtractorFactory,
        url: &str,
    ) -> Result<Box<dyn PageExtractor>, CrawlError> {
        let _permit = self.coordinator.begin_fetch().await;
        loop {
            let body = self.get(url).await?;
            let page = factory(&body);
            if page.is_blocked_page() {
                return Err(CrawlError::BanDetected {
                    url: url.to_string(),
                    proxy: None,
                });
            }
            if page.is_challenge_page() {
                // every other in-flight worker must quiesce before the
                // identity flips; the permit stays held across the wait
                self.coordinator.await_rotation().await;
                continue;
            }
            return Ok(page);
        }
    }

    async fn get(&self, url: &str) -> Result<String, CrawlError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            // challenge interstitials frequently arrive as 5xx; parse anyway
            tracing::error!("[{}] {}", status.as_u16(), url);
        }

        response.text().await.map_err(|e| classify(url, &e))
    }
}

fn classify(url: &str, error: &reqwest::Error) -> CrawlError {
    let reason = if error.is_timeout() {
        "request timeout".to_string()
    } else if error.is_connect() {
        "connection failed".to_string()
    } else {
        error.to_string()
    };
    CrawlError::TransientFetch {
        url: url.to_string(),
        reason,
    }
}
