//! Crawler framework: the generic Search→Detail pipeline and the per-site
//! implementations built on it.
//!
//! A site override surface mirrors what the sites actually vary in:
//! search-URL generation, search-result filtering, detail parsing, and
//! post-processing. Everything else (candidate retry, cookie handling,
//! browser fallback, error conversion) lives in the provided trait methods.

pub mod browser;
pub mod parse;

pub mod avbase;
pub mod dmm;
pub mod javbus;
pub mod mgstage;
pub mod missav;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::client::{AvWebClient, RequestOptions, WebError};
use crate::config::{Config, Website};
use crate::types::{CrawlerData, CrawlerInput};
use browser::{BrowserFetcher, PageCookie};

/// Bounded per-lookup debug trace.
const DEBUG_BUFFER_LIMIT: usize = 200;

/// Crawler error taxonomy. Every variant carries enough context for the
/// operator log to reconstruct the failure.
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("catalog number is empty")]
    NumberEmpty,
    #[error("HTTP {status}: {url}")]
    Http { status: u16, url: String },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("cloudflare challenge unresolved: {0}")]
    ChallengeUnresolved(String),
    #[error("parse failure: {0}")]
    Parse(String),
    #[error("page exists but encodes not-found: {0}")]
    SoftNotFound(String),
    #[error("number mismatch: input={input}, found={found}")]
    NumberMismatch { input: String, found: String },
}

impl From<WebError> for CrawlerError {
    fn from(err: WebError) -> Self {
        match err {
            WebError::Status { status, url } => CrawlerError::Http { status, url },
            WebError::Timeout(detail) => CrawlerError::Timeout(detail),
            WebError::ChallengeUnresolved { url, reason } => {
                CrawlerError::ChallengeUnresolved(format!("{url}: {reason}"))
            }
            other => CrawlerError::Network(other.to_string()),
        }
    }
}

/// Per-site, per-lookup working state.
///
/// Owned by exactly one site task for the duration of a lookup. The
/// scratchpad carries site-specific derivations between pipeline stages
/// (e.g. DMM's two candidate digit forms).
#[derive(Debug, Clone)]
pub struct Context {
    pub input: CrawlerInput,
    scratch: HashMap<String, String>,
    debug: VecDeque<String>,
}

impl Context {
    pub fn new(input: CrawlerInput) -> Self {
        Self {
            input,
            scratch: HashMap::new(),
            debug: VecDeque::new(),
        }
    }

    /// Append a line to the bounded debug trace.
    pub fn debug(&mut self, message: impl Into<String>) {
        if self.debug.len() == DEBUG_BUFFER_LIMIT {
            self.debug.pop_front();
        }
        self.debug.push_back(message.into());
    }

    pub fn debug_log(&self) -> impl Iterator<Item = &str> {
        self.debug.iter().map(String::as_str)
    }

    pub fn set_scratch(&mut self, key: &str, value: impl Into<String>) {
        self.scratch.insert(key.to_string(), value.into());
    }

    pub fn scratch(&self, key: &str) -> Option<&str> {
        self.scratch.get(key).map(String::as_str)
    }
}

/// One metadata source.
///
/// The provided methods implement the generic pipeline; sites override the
/// four variation points (`generate_search_urls`, `parse_search_page`,
/// `parse_detail_page`, `post_process`) plus cookie/browser declarations.
#[async_trait]
pub trait SiteCrawler: Send + Sync {
    fn site(&self) -> Website;

    /// User-facing base URL; empty for sites that cannot be overridden.
    fn base_url(&self) -> String;

    fn client(&self) -> &Arc<AvWebClient>;

    fn browser(&self) -> Option<&Arc<BrowserFetcher>> {
        None
    }

    /// Rewrite the lookup input for this site (e.g. DMM prefers the short
    /// number form). The engine hands every site its own copy, so the
    /// shared input is untouched regardless of how the task ends.
    fn adapt_input(&self, input: &CrawlerInput) -> CrawlerInput {
        input.clone()
    }

    /// Cookies sent with every HTTP fetch for this site.
    fn cookies(&self, _ctx: &Context) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Cookies installed into the browser context before navigation.
    fn browser_cookies(&self, _ctx: &Context) -> Vec<PageCookie> {
        Vec::new()
    }

    /// Whether `url` needs the headless browser.
    fn wants_browser(&self, _url: &str) -> bool {
        false
    }

    async fn generate_search_urls(&self, ctx: &mut Context) -> Result<Vec<String>, CrawlerError>;

    /// Filter a search page down to detail URLs matching the input number.
    async fn parse_search_page(
        &self,
        ctx: &mut Context,
        html: &str,
        search_url: &str,
    ) -> Result<Vec<String>, CrawlerError>;

    async fn parse_detail_page(
        &self,
        ctx: &mut Context,
        html: &str,
        detail_url: &str,
    ) -> Result<CrawlerData, CrawlerError>;

    /// Site-specific canonicalization after parsing (image upgrades,
    /// field back-fill). Default: pass through.
    async fn post_process(
        &self,
        _ctx: &mut Context,
        data: CrawlerData,
    ) -> Result<CrawlerData, CrawlerError> {
        Ok(data)
    }

    /// Run the whole pipeline for one lookup.
    async fn crawl(&self, input: &CrawlerInput) -> Result<CrawlerData, CrawlerError> {
        let mut ctx = Context::new(self.adapt_input(input));
        let search_urls = self.generate_search_urls(&mut ctx).await?;
        let detail_urls = self.search(&mut ctx, search_urls).await?;
        if detail_urls.is_empty() {
            return Err(CrawlerError::Parse(format!(
                "[{}] no detail urls for {}",
                self.site(),
                ctx.input.number
            )));
        }
        let data = self.fetch_detail_set(&mut ctx, detail_urls).await?;
        let mut data = self.post_process(&mut ctx, data).await?;
        data.normalize();
        Ok(data)
    }

    /// Resolve search candidates into detail URLs. Sites whose detail
    /// pages are addressed directly (no search page) override this to
    /// return the candidates as-is.
    async fn search(
        &self,
        ctx: &mut Context,
        search_urls: Vec<String>,
    ) -> Result<Vec<String>, CrawlerError> {
        self.search_via_pages(ctx, search_urls).await
    }

    /// Try search candidates in order; the first yielding at least one
    /// detail URL wins.
    async fn search_via_pages(
        &self,
        ctx: &mut Context,
        search_urls: Vec<String>,
    ) -> Result<Vec<String>, CrawlerError> {
        let mut last_error: Option<CrawlerError> = None;
        for search_url in search_urls {
            let html = match self.fetch_page(ctx, &search_url, false).await {
                Ok(html) => html,
                Err(err) => {
                    ctx.debug(format!("search fetch failed: {search_url}: {err}"));
                    last_error = Some(err);
                    continue;
                }
            };
            match self.parse_search_page(ctx, &html, &search_url).await {
                Ok(detail_urls) if !detail_urls.is_empty() => return Ok(detail_urls),
                Ok(_) => {
                    ctx.debug(format!("no results on {search_url}"));
                }
                Err(err) => {
                    ctx.debug(format!("search parse failed: {search_url}: {err}"));
                    last_error = Some(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| CrawlerError::Parse("no search candidate produced results".into())))
    }

    /// Fetch each detail URL in order; the first parseable page wins.
    /// Sites with several product variants override this with a concurrent
    /// fanout merged under the field-validity rules.
    async fn fetch_detail_set(
        &self,
        ctx: &mut Context,
        detail_urls: Vec<String>,
    ) -> Result<CrawlerData, CrawlerError> {
        let mut last_error: Option<CrawlerError> = None;
        for detail_url in detail_urls {
            match self.fetch_and_parse_detail(ctx, &detail_url).await {
                Ok(data) => return Ok(data),
                Err(err) => {
                    ctx.debug(format!("detail failed: {detail_url}: {err}"));
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CrawlerError::Parse("no detail url".into())))
    }

    async fn fetch_and_parse_detail(
        &self,
        ctx: &mut Context,
        detail_url: &str,
    ) -> Result<CrawlerData, CrawlerError> {
        let use_browser = self.wants_browser(detail_url) && self.browser().is_some();
        let html = self.fetch_page(ctx, detail_url, use_browser).await?;
        self.parse_detail_page(ctx, &html, detail_url).await
    }

    /// Fetch one page over HTTP or, when requested, the headless browser.
    async fn fetch_page(
        &self,
        ctx: &mut Context,
        url: &str,
        use_browser: bool,
    ) -> Result<String, CrawlerError> {
        if use_browser {
            if let Some(browser) = self.browser() {
                let cookies = self.browser_cookies(ctx);
                match browser.fetch(url, &cookies).await {
                    Ok(html) => return Ok(html),
                    Err(err) => {
                        ctx.debug(format!("browser fetch failed, falling back to http: {err}"));
                    }
                }
            }
        }
        let opts = RequestOptions::default().with_cookies(self.cookies(ctx));
        Ok(self.client().get_text(url, opts).await?)
    }
}

/// Build the `Website → crawler` map over one shared client/browser pair.
pub fn build_crawlers(
    client: Arc<AvWebClient>,
    browser: Option<Arc<BrowserFetcher>>,
    config: &Config,
) -> HashMap<Website, Arc<dyn SiteCrawler>> {
    let mut crawlers: HashMap<Website, Arc<dyn SiteCrawler>> = HashMap::new();
    crawlers.insert(
        Website::Dmm,
        Arc::new(dmm::DmmCrawler::new(client.clone(), browser, config)),
    );
    crawlers.insert(
        Website::Missav,
        Arc::new(missav::MissavCrawler::new(client.clone(), String::new())),
    );
    crawlers.insert(
        Website::Avbase,
        Arc::new(avbase::AvbaseCrawler::new(client.clone(), String::new(), config)),
    );
    crawlers.insert(
        Website::Javbus,
        Arc::new(javbus::JavbusCrawler::new(client.clone(), String::new())),
    );
    crawlers.insert(
        Website::Mgstage,
        Arc::new(mgstage::MgstageCrawler::new(client, String::new())),
    );
    crawlers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_buffer_is_bounded() {
        let mut ctx = Context::new(CrawlerInput::from_number("ABC-123"));
        for i in 0..(DEBUG_BUFFER_LIMIT + 50) {
            ctx.debug(format!("line {i}"));
        }
        assert_eq!(ctx.debug_log().count(), DEBUG_BUFFER_LIMIT);
        assert_eq!(ctx.debug_log().next().unwrap(), "line 50");
    }

    #[test]
    fn scratchpad_round_trips() {
        let mut ctx = Context::new(CrawlerInput::from_number("ABC-123"));
        ctx.set_scratch("number_00", "abc00123");
        assert_eq!(ctx.scratch("number_00"), Some("abc00123"));
        assert_eq!(ctx.scratch("missing"), None);
    }

    #[test]
    fn web_errors_map_into_the_taxonomy() {
        let err: CrawlerError = WebError::Status {
            status: 503,
            url: "https://x".into(),
        }
        .into();
        assert!(matches!(err, CrawlerError::Http { status: 503, .. }));

        let err: CrawlerError = WebError::Timeout("10s".into()).into();
        assert!(matches!(err, CrawlerError::Timeout(_)));
    }
}
