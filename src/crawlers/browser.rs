//! Headless-browser page fetcher.
//!
//! Some detail pages only materialize after client-side rendering (DMM's
//! digital category). Sites opt in per URL; everything else stays on the
//! plain HTTP path. One shared Chromium instance serves all lookups, with
//! per-page operations serialized by the CDP connection.

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetCookiesParams};
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("page operation failed: {0}")]
    Page(String),
}

/// Cookie installed into the page context before navigation.
#[derive(Debug, Clone)]
pub struct PageCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

impl PageCookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".to_string(),
        }
    }
}

/// Shared headless Chromium wrapper.
pub struct BrowserFetcher {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserFetcher {
    /// Launch a headless instance and start draining its CDP event loop.
    pub async fn launch() -> Result<Self, BrowserError> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .build()
            .map_err(BrowserError::Launch)?;
        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self { browser, handler })
    }

    /// Navigate to `url` with `cookies` pre-set and return the rendered HTML.
    pub async fn fetch(&self, url: &str, cookies: &[PageCookie]) -> Result<String, BrowserError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|err| BrowserError::Page(err.to_string()))?;

        if !cookies.is_empty() {
            let params: Vec<CookieParam> = cookies
                .iter()
                .filter_map(|cookie| {
                    CookieParam::builder()
                        .name(cookie.name.clone())
                        .value(cookie.value.clone())
                        .domain(cookie.domain.clone())
                        .path(cookie.path.clone())
                        .build()
                        .ok()
                })
                .collect();
            page.execute(SetCookiesParams::new(params))
                .await
                .map_err(|err| BrowserError::Page(err.to_string()))?;
        }

        let result = async {
            page.goto(url)
                .await
                .map_err(|err| BrowserError::Page(err.to_string()))?;
            page.wait_for_navigation()
                .await
                .map_err(|err| BrowserError::Page(err.to_string()))?;
            page.content()
                .await
                .map_err(|err| BrowserError::Page(err.to_string()))
        }
        .await;

        let _ = page.close().await;
        result
    }
}

impl Drop for BrowserFetcher {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_cookie_defaults_to_root_path() {
        let cookie = PageCookie::new("age_check_done", "1", ".dmm.co.jp");
        assert_eq!(cookie.path, "/");
        assert_eq!(cookie.domain, ".dmm.co.jp");
    }

    // Launching Chromium needs a local install; exercised by the ignored
    // integration tests in tests/live.rs.
}
