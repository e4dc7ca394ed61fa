//! Page fetching and listing extraction for configured career pages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobscrape_core::{FetchMode, PaginationConfig};
use jobscrape_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod browser;
pub mod chrome;
pub mod extract;
pub mod geocode;

pub use browser::{BrowserError, BrowserSession, DynamicFetcher, DynamicSettings, Pick, SessionLauncher};
pub use chrome::{ChromeLauncher, ChromeSession};
pub use extract::{extract, stripped_text, CompiledSelectors, ExtractError};
pub use geocode::{GeocodeError, Geocoder, HttpGeocoder, DEFAULT_GEOCODER_URL};

/// Markup captured from one visited page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("fetching {url} failed after {attempts} attempt(s): {message}")]
    FetchFailed {
        url: String,
        attempts: usize,
        message: String,
    },
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl ScrapeError {
    fn from_http(url: &str, err: FetchError) -> Self {
        ScrapeError::FetchFailed {
            url: url.to_string(),
            attempts: err.attempts(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait PageFetcher: Send {
    /// Every page reachable from `url` under `pagination`, in visiting order.
    async fn fetch(
        &mut self,
        url: &str,
        mode: FetchMode,
        pagination: &PaginationConfig,
    ) -> Result<Vec<FetchedPage>, ScrapeError>;

    /// Release any browser held by the fetcher.
    async fn close(&mut self) -> Result<(), ScrapeError> {
        Ok(())
    }
}

/// Routes each fetch to plain HTTP or to a browser session opened on first use.
pub struct SourceFetcher<L: SessionLauncher> {
    http: HttpFetcher,
    launcher: L,
    dynamic: DynamicFetcher,
    session: Option<L::Session>,
}

impl<L: SessionLauncher> SourceFetcher<L> {
    pub fn new(http: HttpFetcher, launcher: L, dynamic: DynamicFetcher) -> Self {
        Self {
            http,
            launcher,
            dynamic,
            session: None,
        }
    }

    pub fn has_open_session(&self) -> bool {
        self.session.is_some()
    }

    async fn fetch_routed(
        &mut self,
        url: &str,
        mode: FetchMode,
        pagination: &PaginationConfig,
    ) -> Result<Vec<FetchedPage>, ScrapeError> {
        match mode {
            FetchMode::Static => fetch_static(&self.http, url, pagination).await,
            FetchMode::Dynamic => {
                if self.session.is_none() {
                    self.session = Some(self.launcher.launch().await?);
                }
                match self.session.as_mut() {
                    Some(session) => self.dynamic.fetch(session, url, pagination).await,
                    None => Err(BrowserError::Launch("session unavailable".into()).into()),
                }
            }
        }
    }
}

async fn fetch_static(
    http: &HttpFetcher,
    url: &str,
    pagination: &PaginationConfig,
) -> Result<Vec<FetchedPage>, ScrapeError> {
    if pagination.load_more().is_some() || pagination.infinite_scroll || pagination.next_page().is_some() {
        debug!(url, "static fetch ignores pagination settings");
    }
    let response = http
        .fetch_text(url)
        .await
        .map_err(|err| ScrapeError::from_http(url, err))?;
    Ok(vec![FetchedPage {
        url: response.final_url,
        body: response.body,
        fetched_at: Utc::now(),
    }])
}

#[async_trait]
impl<L: SessionLauncher> PageFetcher for SourceFetcher<L> {
    async fn fetch(
        &mut self,
        url: &str,
        mode: FetchMode,
        pagination: &PaginationConfig,
    ) -> Result<Vec<FetchedPage>, ScrapeError> {
        let span = info_span!("fetch", url, mode = ?mode);
        self.fetch_routed(url, mode, pagination).instrument(span).await
    }

    async fn close(&mut self) -> Result<(), ScrapeError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        session.close().await.map_err(|err| {
            warn!(error = %err, "closing browser session failed");
            ScrapeError::from(err)
        })
    }
}
