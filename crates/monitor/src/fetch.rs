//! Page fetching.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;

/// Something that can retrieve the body of a page.
///
/// The monitor applies its own timeout on top of whatever the implementation
/// does, so a hung fetcher can never stall a target for longer than the
/// configured bound.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// `reqwest`-backed fetcher.  One instance (and one connection pool) is
/// shared by every monitor.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .header("Accept", "text/html, text/plain;q=0.9, */*;q=0.5")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        Ok(resp.text().await?)
    }
}
