//! [`BrowserSession`] backed by a local Chrome/Chromium over CDP.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::browser::{BrowserError, BrowserSession, Pick, SessionLauncher};

#[derive(Debug, Clone, Copy)]
pub struct ChromeLauncher {
    pub headless: bool,
}

impl Default for ChromeLauncher {
    fn default() -> Self {
        Self { headless: true }
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    type Session = ChromeSession;

    async fn launch(&self) -> Result<ChromeSession, BrowserError> {
        let mut builder = BrowserConfig::builder();
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(BrowserError::Launch)?;
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser event loop ended");
                    break;
                }
            }
        });

        let page = open_tab(&mut browser, &handler_task).await?;
        debug!(headless = self.headless, "browser session opened");

        Ok(ChromeSession {
            browser,
            page,
            handler_task,
        })
    }
}

/// The process-level half of a browser: opening the first tab and shutting down.
#[async_trait]
trait BrowserProcess: Send {
    type Tab: Send;

    async fn open_page(&mut self) -> Result<Self::Tab, String>;
    /// Close the browser and wait for the process to exit.
    async fn shut_down(&mut self) -> Result<(), String>;
}

#[async_trait]
impl BrowserProcess for Browser {
    type Tab = Page;

    async fn open_page(&mut self) -> Result<Page, String> {
        self.new_page("about:blank").await.map_err(|e| e.to_string())
    }

    async fn shut_down(&mut self) -> Result<(), String> {
        let closed = self.close().await.map(|_| ()).map_err(|e| e.to_string());
        if let Err(err) = self.wait().await {
            warn!(error = %err, "browser process did not exit cleanly");
        }
        closed
    }
}

/// Open the first tab. When that fails the browser is shut down and its event loop stopped.
async fn open_tab<P: BrowserProcess>(process: &mut P, handler_task: &JoinHandle<()>) -> Result<P::Tab, BrowserError> {
    match process.open_page().await {
        Ok(tab) => Ok(tab),
        Err(message) => {
            if let Err(err) = process.shut_down().await {
                warn!(error = %err, "closing browser after failed launch");
            }
            handler_task.abort();
            Err(BrowserError::Launch(message))
        }
    }
}

/// One browser process with a single tab. Must be closed explicitly.
pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
}

fn interaction(err: impl std::fmt::Display) -> BrowserError {
    BrowserError::Interaction(err.to_string())
}

fn pick_element<T>(items: Vec<T>, pick: Pick) -> Option<T> {
    match pick {
        Pick::First => items.into_iter().next(),
        Pick::Last => items.into_iter().last(),
    }
}

async fn find(page: &Page, selector: &str, pick: Pick) -> Result<Element, BrowserError> {
    let elements = page.find_elements(selector).await.map_err(interaction)?;
    pick_element(elements, pick).ok_or_else(|| BrowserError::NotFound(selector.to_string()))
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        self.page.content().await.map_err(interaction)
    }

    async fn scroll_height(&mut self) -> Result<i64, BrowserError> {
        let height: f64 = self
            .page
            .evaluate("document.body.scrollHeight")
            .await
            .map_err(interaction)?
            .into_value()
            .map_err(interaction)?;
        Ok(height as i64)
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), BrowserError> {
        self.page
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await
            .map_err(interaction)?;
        Ok(())
    }

    async fn click(&mut self, selector: &str, pick: Pick) -> Result<(), BrowserError> {
        let element = find(&self.page, selector, pick).await?;
        element.click().await.map_err(interaction)?;
        Ok(())
    }

    async fn js_click(&mut self, selector: &str, pick: Pick) -> Result<(), BrowserError> {
        let quoted = serde_json::to_string(selector).map_err(interaction)?;
        let index = match pick {
            Pick::First => "0",
            Pick::Last => "els.length - 1",
        };
        let script = format!(
            "(() => {{ const els = document.querySelectorAll({quoted}); const el = els[{index}]; \
             if (!el) return false; el.click(); return true; }})()"
        );
        let clicked: bool = self
            .page
            .evaluate(script.as_str())
            .await
            .map_err(interaction)?
            .into_value()
            .map_err(interaction)?;
        if clicked {
            Ok(())
        } else {
            Err(BrowserError::NotFound(selector.to_string()))
        }
    }

    async fn attr(&mut self, selector: &str, pick: Pick, name: &str) -> Result<Option<String>, BrowserError> {
        let element = match find(&self.page, selector, pick).await {
            Ok(element) => element,
            Err(BrowserError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        element.attribute(name).await.map_err(interaction)
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        let closed = self.browser.shut_down().await.map_err(BrowserError::Interaction);
        self.handler_task.abort();
        debug!("browser session closed");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProcess {
        shutdowns: usize,
    }

    #[async_trait]
    impl BrowserProcess for FailingProcess {
        type Tab = ();

        async fn open_page(&mut self) -> Result<(), String> {
            Err("target crashed".into())
        }

        async fn shut_down(&mut self) -> Result<(), String> {
            self.shutdowns += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_first_tab_shuts_the_browser_down() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handler_task = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        let mut process = FailingProcess { shutdowns: 0 };

        let err = open_tab(&mut process, &handler_task).await.unwrap_err();
        assert_eq!(err, BrowserError::Launch("target crashed".into()));
        assert_eq!(process.shutdowns, 1);
        assert!(rx.await.is_err());
        assert!(handler_task.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn headless_by_default() {
        assert!(ChromeLauncher::default().headless);
    }

    #[test]
    fn pick_selects_an_end_of_the_match_list() {
        assert_eq!(pick_element(vec![1, 2, 3], Pick::First), Some(1));
        assert_eq!(pick_element(vec![1, 2, 3], Pick::Last), Some(3));
        assert_eq!(pick_element(Vec::<i32>::new(), Pick::Last), None);
    }
}
