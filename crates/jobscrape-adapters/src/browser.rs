//! Scripted-browser fetching: load, expand, and paginate a listing page.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobscrape_core::PaginationConfig;
use jobscrape_storage::{sha256_hex, BackoffPolicy};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{FetchedPage, ScrapeError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrowserError {
    #[error("no element matches `{0}`")]
    NotFound(String),
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("browser interaction failed: {0}")]
    Interaction(String),
    #[error("browser launch failed: {0}")]
    Launch(String),
}

/// Which of several matching elements an interaction targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    First,
    Last,
}

/// The operations the fetcher needs from a live browser tab.
#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError>;
    async fn content(&mut self) -> Result<String, BrowserError>;
    async fn scroll_height(&mut self) -> Result<i64, BrowserError>;
    async fn scroll_to_bottom(&mut self) -> Result<(), BrowserError>;
    /// Native click. `NotFound` when nothing matches.
    async fn click(&mut self, selector: &str, pick: Pick) -> Result<(), BrowserError>;
    /// Click dispatched from page script.
    async fn js_click(&mut self, selector: &str, pick: Pick) -> Result<(), BrowserError>;
    async fn attr(&mut self, selector: &str, pick: Pick, name: &str) -> Result<Option<String>, BrowserError>;
    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// Opens browser sessions on demand.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    type Session: BrowserSession;

    async fn launch(&self) -> Result<Self::Session, BrowserError>;
}

#[derive(Debug, Clone)]
pub struct DynamicSettings {
    /// Wait after the initial load.
    pub settle: Duration,
    /// Wait after every click, scroll, or page advance.
    pub action_delay: Duration,
    pub max_pages: usize,
    pub max_load_more: usize,
    pub backoff: BackoffPolicy,
}

impl Default for DynamicSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(5000),
            action_delay: Duration::from_millis(7000),
            max_pages: 50,
            max_load_more: 50,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DynamicFetcher {
    settings: DynamicSettings,
}

enum Advance {
    Moved,
    End,
}

impl DynamicFetcher {
    pub fn new(settings: DynamicSettings) -> Self {
        Self { settings }
    }

    /// Load `url`, expand it per `pagination`, and return every page visited in order.
    pub async fn fetch<S: BrowserSession + ?Sized>(
        &self,
        session: &mut S,
        url: &str,
        pagination: &PaginationConfig,
    ) -> Result<Vec<FetchedPage>, ScrapeError> {
        self.load_with_retry(session, url).await?;
        tokio::time::sleep(self.settings.settle).await;

        if let Some(selector) = pagination.load_more() {
            match self.expand_load_more(session, selector).await {
                Ok(clicks) => debug!(url, clicks, "load-more expansion finished"),
                Err(err) => warn!(url, error = %err, event = "PaginationAdvanceFailed", "load-more expansion stopped"),
            }
        }

        if pagination.infinite_scroll {
            match self.expand_infinite_scroll(session).await {
                Ok(scrolls) => debug!(url, scrolls, "infinite scroll finished"),
                Err(err) => warn!(url, error = %err, event = "PaginationAdvanceFailed", "infinite scroll stopped"),
            }
        }

        let mut pages: Vec<FetchedPage> = Vec::new();
        let mut current_url = url.to_string();
        let mut previous_digest: Option<String> = None;

        loop {
            let body = match session.content().await {
                Ok(body) => body,
                Err(err) if pages.is_empty() => {
                    return Err(ScrapeError::FetchFailed {
                        url: url.to_string(),
                        attempts: 1,
                        message: err.to_string(),
                    })
                }
                Err(err) => {
                    warn!(url = %current_url, error = %err, event = "PaginationAdvanceFailed", "could not read page");
                    break;
                }
            };

            let digest = sha256_hex(body.as_bytes());
            if previous_digest.as_deref() == Some(digest.as_str()) {
                debug!(url = %current_url, "page content repeated; pagination finished");
                break;
            }
            previous_digest = Some(digest);
            pages.push(FetchedPage {
                url: current_url.clone(),
                body,
                fetched_at: Utc::now(),
            });

            if pages.len() >= self.settings.max_pages {
                info!(url, pages = pages.len(), "page cap reached");
                break;
            }
            let Some(selector) = pagination.next_page() else {
                break;
            };
            match self.advance(session, selector, &mut current_url).await {
                Ok(Advance::Moved) => tokio::time::sleep(self.settings.action_delay).await,
                Ok(Advance::End) => break,
                Err(err) => {
                    warn!(url = %current_url, error = %err, event = "PaginationAdvanceFailed", "next page failed");
                    break;
                }
            }
        }

        Ok(pages)
    }

    async fn load_with_retry<S: BrowserSession + ?Sized>(&self, session: &mut S, url: &str) -> Result<(), ScrapeError> {
        let backoff = self.settings.backoff;
        let mut attempt = 0;
        loop {
            match session.goto(url).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 < backoff.attempts() => {
                    warn!(url, attempt = attempt + 1, error = %err, "page load failed; retrying");
                    tokio::time::sleep(backoff.delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(ScrapeError::FetchFailed {
                        url: url.to_string(),
                        attempts: attempt + 1,
                        message: err.to_string(),
                    })
                }
            }
        }
    }

    /// Click the first load-more element until the page stops growing.
    async fn expand_load_more<S: BrowserSession + ?Sized>(&self, session: &mut S, selector: &str) -> Result<usize, BrowserError> {
        let mut height = session.scroll_height().await?;
        let mut clicks = 0;
        while clicks < self.settings.max_load_more {
            match session.click(selector, Pick::First).await {
                Ok(()) => {}
                Err(BrowserError::NotFound(_)) => break,
                Err(err) => {
                    debug!(selector, error = %err, "native click failed; using script click");
                    match session.js_click(selector, Pick::First).await {
                        Ok(()) => {}
                        Err(BrowserError::NotFound(_)) => break,
                        Err(err) => return Err(err),
                    }
                }
            }
            clicks += 1;
            tokio::time::sleep(self.settings.action_delay).await;

            let grown = session.scroll_height().await?;
            if grown <= height {
                break;
            }
            height = grown;
        }
        Ok(clicks)
    }

    async fn expand_infinite_scroll<S: BrowserSession + ?Sized>(&self, session: &mut S) -> Result<usize, BrowserError> {
        let mut height = session.scroll_height().await?;
        let mut scrolls = 0;
        while scrolls < self.settings.max_load_more {
            session.scroll_to_bottom().await?;
            scrolls += 1;
            tokio::time::sleep(self.settings.action_delay).await;

            let grown = session.scroll_height().await?;
            if grown <= height {
                break;
            }
            height = grown;
        }
        Ok(scrolls)
    }

    /// Follow the last matching next-page element: click it, or navigate to its `href`.
    async fn advance<S: BrowserSession + ?Sized>(
        &self,
        session: &mut S,
        selector: &str,
        current_url: &mut String,
    ) -> Result<Advance, BrowserError> {
        let click_err = match session.click(selector, Pick::Last).await {
            Ok(()) => return Ok(Advance::Moved),
            Err(BrowserError::NotFound(_)) => return Ok(Advance::End),
            Err(err) => err,
        };
        debug!(selector, error = %click_err, "next-page click failed; following href");

        let Some(href) = session.attr(selector, Pick::Last, "href").await? else {
            return Err(click_err);
        };
        let target = resolve_href(current_url, &href);
        session.goto(&target).await?;
        *current_url = target;
        Ok(Advance::Moved)
    }
}

fn resolve_href(base: &str, href: &str) -> String {
    reqwest::Url::parse(base)
        .and_then(|base| base.join(href))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| href.to_string())
}
