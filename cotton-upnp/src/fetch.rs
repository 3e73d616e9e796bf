//! Fetching description documents over HTTP

use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;
use url::Url;

/// Why a [`Fetcher`] could not get a document
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {0} from {1}")]
    Status(u16, Url),
}

/// Something which can GET a document
///
/// [`HttpFetcher`] is the real thing; tests substitute their own.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError>;
}

/// A [`Fetcher`] using `reqwest`
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Each whole fetch, connection included, is limited to `timeout`
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(crate::ssdp::SERVER)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        trace!("GET {url}");
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16(), url.clone()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}
