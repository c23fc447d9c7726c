//! Cloudflare-aware HTTP client.
//!
//! Single entry point for all outbound HTTP: URL sanitizing, per-host rate
//! limiting, referer injection, browser impersonation, retry with jittered
//! backoff, Cloudflare challenge detection, and bypass-service hand-off
//! with cookie↔User-Agent binding.

pub mod bypass;
pub mod detect;
pub mod download;
pub mod limiters;
pub mod profiles;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use rand::Rng;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Semaphore;
use url::Url;

use crate::config::Config;
use crate::events::{EventBus, PipelineEvent, RequestEvent, RequestFailureEvent};
use bypass::{BypassCoordinator, BypassError};
use limiters::WebLimiters;
use profiles::{random_profile, ImpersonationProfile};

/// Statuses retried without further inspection.
const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];
/// Extra attempts granted after successful bypasses, per request.
const BYPASS_ROUNDS: u32 = 2;
/// Concurrent retry attempts allowed per host.
const RETRY_SLOTS_PER_HOST: usize = 3;

pub type WebResult<T> = Result<T, WebError>;

#[derive(Debug, Error)]
pub enum WebError {
    #[error("HTTP {status}: {url}")]
    Status { status: u16, url: String },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connection error: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("cloudflare challenge unresolved for {url}: {reason}")]
    ChallengeUnresolved { url: String, reason: String },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WebError {
    /// HTTP status carried by the error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            WebError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Read-only response snapshot: status, headers, body, terminal URL.
#[derive(Debug, Clone)]
pub struct WebResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
}

impl WebResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Terminal URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> WebResult<T> {
        serde_json::from_slice(&self.body).map_err(|err| WebError::Decode(err.to_string()))
    }

    /// `Content-Length` header as an integer.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }
}

/// Per-request knobs; `Default` matches the common case.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub body: Option<RequestBody>,
    pub allow_redirects: bool,
    pub enable_bypass: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            cookies: HashMap::new(),
            timeout: None,
            body: None,
            allow_redirects: true,
            enable_bypass: true,
        }
    }
}

impl RequestOptions {
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_cookies(mut self, cookies: HashMap<String, String>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_json(mut self, json: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(json));
        self
    }

    pub fn with_form(mut self, form: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(form));
        self
    }

    pub fn without_redirects(mut self) -> Self {
        self.allow_redirects = false;
        self
    }

    pub fn without_bypass(mut self) -> Self {
        self.enable_bypass = false;
        self
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
    Raw(Vec<u8>),
}

/// Shared HTTP client. One instance per deployment; tests build their own.
pub struct AvWebClient {
    http: reqwest::Client,
    http_noredirect: reqwest::Client,
    profile: &'static ImpersonationProfile,
    retry: u32,
    timeout: Duration,
    limiters: WebLimiters,
    bypass: BypassCoordinator,
    retry_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    events: Arc<EventBus>,
}

impl AvWebClient {
    pub fn new(config: &Config) -> WebResult<Self> {
        Self::with_events(config, Arc::new(EventBus::new()))
    }

    pub fn with_events(config: &Config, events: Arc<EventBus>) -> WebResult<Self> {
        let profile = random_profile();
        let build = |redirects: bool| -> Result<reqwest::Client, reqwest::Error> {
            let policy = if redirects {
                reqwest::redirect::Policy::limited(20)
            } else {
                reqwest::redirect::Policy::none()
            };
            let mut builder = reqwest::Client::builder()
                .cookie_store(true)
                .default_headers(profile.base_headers())
                .redirect(policy)
                .timeout(config.timeout);
            if let Some(proxy) = &config.proxy {
                builder = builder.proxy(reqwest::Proxy::all(proxy)?);
            }
            builder.build()
        };

        let http = build(true).map_err(|err| WebError::Transport(err.to_string()))?;
        let http_noredirect = build(false).map_err(|err| WebError::Transport(err.to_string()))?;
        let bypass = BypassCoordinator::new(
            &config.cf_bypass_url,
            config.cf_bypass_proxy.as_deref(),
            events.clone(),
        )
        .map_err(|err| WebError::Transport(err.to_string()))?;

        Ok(Self {
            http,
            http_noredirect,
            profile,
            retry: config.retry,
            timeout: config.timeout,
            limiters: WebLimiters::new(),
            bypass,
            retry_slots: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn profile(&self) -> &'static ImpersonationProfile {
        self.profile
    }

    pub fn bypass(&self) -> &BypassCoordinator {
        &self.bypass
    }

    /// Issue one HTTP request with the full retry/bypass pipeline.
    pub async fn request(
        &self,
        method: Method,
        raw_url: &str,
        opts: RequestOptions,
    ) -> WebResult<WebResponse> {
        let url = sanitize_url(raw_url)?;
        let host = url.host_str().unwrap_or_default().to_string();

        let mut headers = self.prepare_headers(&url, &opts.headers)?;
        self.apply_bound_user_agent(&host, &mut headers);

        let attempts_total = self.retry + 1;
        let mut attempt: u32 = 0;
        let mut bypass_attempts: u32 = 0;
        let mut last_error = WebError::Transport("no attempt made".into());

        loop {
            self.limiters.acquire(&host).await;
            let _slot = if attempt > 0 {
                self.retry_slot(&host).acquire_owned().await.ok()
            } else {
                None
            };

            let started = Instant::now();
            let outcome = self
                .send_once(&method, &url, &headers, &opts)
                .await;

            match outcome {
                Ok(response) => {
                    let challenge = opts.enable_bypass
                        && self.bypass.enabled()
                        && !host.is_empty()
                        && detect::is_challenge_response(
                            response.status,
                            &response.headers,
                            &response.body,
                        );

                    if challenge {
                        self.events.publish(PipelineEvent::ChallengeDetected {
                            host: host.clone(),
                            url: url.to_string(),
                        });
                        self.bypass.record_challenge_hit(&host);

                        if bypass_attempts >= BYPASS_ROUNDS {
                            return Err(WebError::ChallengeUnresolved {
                                url: url.to_string(),
                                reason: format!("challenge persisted after {BYPASS_ROUNDS} bypass rounds"),
                            });
                        }
                        match self.bypass.try_bypass(&host, url.as_str()).await {
                            Ok(grant) => {
                                bypass_attempts += 1;
                                if !grant.user_agent.is_empty() {
                                    set_header(&mut headers, "user-agent", &grant.user_agent);
                                }
                                // Short schedule after a successful bypass.
                                sleep_jittered(Duration::from_millis(1200), 1.3).await;
                                continue;
                            }
                            Err(BypassError::Terminal(status)) => {
                                return Err(WebError::ChallengeUnresolved {
                                    url: url.to_string(),
                                    reason: format!("bypass service returned HTTP {status}"),
                                });
                            }
                            Err(err) => {
                                last_error = WebError::ChallengeUnresolved {
                                    url: url.to_string(),
                                    reason: err.to_string(),
                                };
                                // Fall through to the normal retry schedule.
                            }
                        }
                    } else if is_success(&response, opts.allow_redirects) {
                        self.bypass.reset_challenge_hits(&host);
                        self.events
                            .publish(PipelineEvent::RequestSucceeded(RequestEvent {
                                method: method.clone(),
                                url: response.url.to_string(),
                                status: response.status,
                                latency: started.elapsed(),
                                timestamp: Utc::now(),
                            }));
                        return Ok(response);
                    } else {
                        let retryable = RETRYABLE_STATUSES.contains(&response.status)
                            || (response.status == 403 && !self.bypass.enabled());
                        last_error = WebError::Status {
                            status: response.status,
                            url: response.url.to_string(),
                        };
                        if !retryable {
                            self.publish_failure(&method, &url, &last_error, attempt + 1, attempts_total);
                            return Err(last_error);
                        }
                    }
                }
                Err(err) => {
                    let retryable = matches!(err, WebError::Timeout(_) | WebError::Connect(_));
                    last_error = err;
                    if !retryable {
                        self.publish_failure(&method, &url, &last_error, attempt + 1, attempts_total);
                        return Err(last_error);
                    }
                }
            }

            attempt += 1;
            self.publish_failure(&method, &url, &last_error, attempt, attempts_total);
            if attempt >= attempts_total {
                return Err(last_error);
            }
            // Backoff: attempt·3 + 2 seconds plus up to 0.4s of jitter.
            let base = Duration::from_secs((attempt as u64 - 1) * 3 + 2);
            sleep_jittered(base, 0.4).await;
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        opts: &RequestOptions,
    ) -> WebResult<WebResponse> {
        let client = if opts.allow_redirects {
            &self.http
        } else {
            &self.http_noredirect
        };

        let mut builder = client
            .request(method.clone(), url.clone())
            .headers(headers.clone())
            .timeout(opts.timeout.unwrap_or(self.timeout));

        let cookie_header = self.merged_cookie_header(url, &opts.cookies);
        if let Some(cookie_header) = cookie_header {
            builder = builder.header(http::header::COOKIE, cookie_header);
        }

        builder = match &opts.body {
            None => builder,
            Some(RequestBody::Form(form)) => builder.form(form),
            Some(RequestBody::Json(json)) => builder.json(json),
            Some(RequestBody::Raw(bytes)) => builder.body(bytes.clone()),
        };

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(classify_reqwest_error)?;

        Ok(WebResponse {
            status,
            headers,
            body,
            url: final_url,
        })
    }

    fn prepare_headers(
        &self,
        url: &Url,
        extra: &HashMap<String, String>,
    ) -> WebResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in extra {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| WebError::InvalidUrl(format!("bad header name: {name}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| WebError::InvalidUrl(format!("bad header value for {name}")))?;
            headers.insert(header_name, header_value);
        }
        inject_referer(url, &mut headers);
        Ok(headers)
    }

    /// Bound bypass User-Agents win over anything the caller supplied.
    fn apply_bound_user_agent(&self, host: &str, headers: &mut HeaderMap) {
        if host.is_empty() {
            return;
        }
        if let Some(grant) = self.bypass.binding(host) {
            if !grant.user_agent.is_empty() {
                set_header(headers, "user-agent", &grant.user_agent);
            }
        }
    }

    fn merged_cookie_header(
        &self,
        url: &Url,
        caller: &HashMap<String, String>,
    ) -> Option<HeaderValue> {
        let mut merged: HashMap<String, String> = caller.clone();
        if let Some(host) = url.host_str() {
            if let Some(grant) = self.bypass.binding(host) {
                merged.extend(grant.cookies);
            }
        }
        if merged.is_empty() {
            return None;
        }
        let mut pairs: Vec<String> = merged
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        pairs.sort_unstable();
        HeaderValue::from_str(&pairs.join("; ")).ok()
    }

    fn retry_slot(&self, host: &str) -> Arc<Semaphore> {
        let mut slots = self.retry_slots.lock().expect("retry slot registry poisoned");
        slots
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(RETRY_SLOTS_PER_HOST)))
            .clone()
    }

    fn publish_failure(
        &self,
        method: &Method,
        url: &Url,
        error: &WebError,
        attempt: u32,
        attempts_total: u32,
    ) {
        self.events
            .publish(PipelineEvent::RequestFailed(RequestFailureEvent {
                method: method.clone(),
                url: url.to_string(),
                error: error.to_string(),
                attempt,
                attempts_total,
                timestamp: Utc::now(),
            }));
    }

    // Convenience wrappers -------------------------------------------------

    pub async fn get(&self, url: &str) -> WebResult<WebResponse> {
        self.request(Method::GET, url, RequestOptions::default()).await
    }

    pub async fn get_text(&self, url: &str, opts: RequestOptions) -> WebResult<String> {
        Ok(self.request(Method::GET, url, opts).await?.text())
    }

    pub async fn get_bytes(&self, url: &str, opts: RequestOptions) -> WebResult<Bytes> {
        Ok(self.request(Method::GET, url, opts).await?.bytes().clone())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, opts: RequestOptions) -> WebResult<T> {
        self.request(Method::GET, url, opts).await?.json()
    }

    pub async fn post_text(&self, url: &str, opts: RequestOptions) -> WebResult<String> {
        Ok(self.request(Method::POST, url, opts).await?.text())
    }

    pub async fn post_json<T: DeserializeOwned>(&self, url: &str, opts: RequestOptions) -> WebResult<T> {
        self.request(Method::POST, url, opts).await?.json()
    }

    /// `HEAD` the URL and report its advertised size.
    pub async fn head_size(&self, url: &str) -> Option<u64> {
        let response = self
            .request(Method::HEAD, url, RequestOptions::default())
            .await
            .ok()?;
        if response.status() < 400 {
            response.content_length()
        } else {
            None
        }
    }
}

fn is_success(response: &WebResponse, allow_redirects: bool) -> bool {
    if response.status < 300 {
        return true;
    }
    // With redirects disabled, a 302 with a Location header is the answer.
    !allow_redirects
        && response.status == 302
        && response.headers.contains_key(http::header::LOCATION)
}

fn classify_reqwest_error(err: reqwest::Error) -> WebError {
    if err.is_timeout() {
        WebError::Timeout(err.to_string())
    } else if err.is_connect() {
        WebError::Connect(err.to_string())
    } else {
        WebError::Transport(err.to_string())
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(header_value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), header_value);
    }
}

/// Strip trailing garbage after an embedded quote character and parse.
/// Percent-escapes are preserved as-is.
pub fn sanitize_url(raw: &str) -> WebResult<Url> {
    let trimmed = raw.trim();
    let cut = trimmed
        .find(['"', '\''])
        .map(|idx| &trimmed[..idx])
        .unwrap_or(trimmed);
    Url::parse(cut).map_err(|err| WebError::InvalidUrl(format!("{cut}: {err}")))
}

/// Referer requirements of a small closed set of hosts.
fn inject_referer(url: &Url, headers: &mut HeaderMap) {
    let text = url.as_str();
    let referer = if text.contains("getchu") {
        Some("http://www.getchu.com/top.html")
    } else if text.contains("xcity") {
        Some("https://xcity.jp/result_published/?genre=%2Fresult_published%2F&q=2&sg=main&num=60")
    } else if text.contains("javbus") {
        Some("https://www.javbus.com/")
    } else if text.contains("giga") && !text.contains("cookie_set.php") {
        Some("https://www.giga-web.jp/top.html")
    } else {
        None
    };
    if let Some(referer) = referer {
        headers.insert(http::header::REFERER, HeaderValue::from_static(referer));
    }
}

async fn sleep_jittered(base: Duration, jitter_secs: f64) {
    let jitter = rand::thread_rng().gen_range(0.0..jitter_secs);
    tokio::time::sleep(base + Duration::from_secs_f64(jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(retry: u32) -> AvWebClient {
        let config = Config::builder()
            .with_retry(retry)
            .with_timeout(Duration::from_secs(5))
            .build();
        AvWebClient::with_events(&config, Arc::new(EventBus::silent())).unwrap()
    }

    fn bypassing_client(bypass_url: &str, retry: u32) -> AvWebClient {
        let config = Config::builder()
            .with_retry(retry)
            .with_timeout(Duration::from_secs(5))
            .with_cf_bypass_url(bypass_url)
            .build();
        AvWebClient::with_events(&config, Arc::new(EventBus::silent())).unwrap()
    }

    #[test]
    fn sanitize_strips_after_quotes() {
        let url = sanitize_url("https://example.com/a.jpg\" style=\"x").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a.jpg");
        let url = sanitize_url("https://example.com/%E3%81%82").unwrap();
        assert!(url.as_str().contains("%E3%81%82"));
    }

    #[test]
    fn referers_injected_for_known_hosts() {
        let mut headers = HeaderMap::new();
        inject_referer(&Url::parse("https://www.javbus.com/ABC-123").unwrap(), &mut headers);
        assert_eq!(
            headers.get(http::header::REFERER).unwrap(),
            "https://www.javbus.com/"
        );

        let mut headers = HeaderMap::new();
        inject_referer(
            &Url::parse("https://www.giga-web.jp/cookie_set.php").unwrap(),
            &mut headers,
        );
        assert!(headers.get(http::header::REFERER).is_none());
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_body("hello")
            .create_async()
            .await;

        let client = test_client(2);
        let response = client.get(&format!("{}/page", server.url())).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text(), "hello");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn retries_transient_statuses_until_exhausted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let client = test_client(1);
        let err = client
            .get(&format!("{}/flaky", server.url()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn terminal_status_fails_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/gone")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = test_client(3);
        let err = client
            .get(&format!("{}/gone", server.url()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn status_403_retries_only_without_bypass() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/forbidden")
            .with_status(403)
            .expect(2)
            .create_async()
            .await;

        let client = test_client(1);
        let err = client
            .get(&format!("{}/forbidden", server.url()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(403));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn challenge_triggers_bypass_then_succeeds() {
        let mut target = mockito::Server::new_async().await;
        let challenge = target
            .mock("GET", "/detail")
            .with_status(403)
            .with_header("server", "cloudflare")
            .with_header("content-type", "text/html")
            .with_body("<html><title>Just a moment...</title></html>")
            .match_header("cookie", mockito::Matcher::Missing)
            .create_async()
            .await;
        let cleared = target
            .mock("GET", "/detail")
            .with_status(200)
            .with_body("real page")
            .match_header(
                "cookie",
                mockito::Matcher::Regex("cf_clearance=token-ok".into()),
            )
            .create_async()
            .await;

        let mut bypass = mockito::Server::new_async().await;
        let bypass_mock = bypass
            .mock("GET", mockito::Matcher::Regex("^/cookies".into()))
            .with_status(200)
            .with_body(r#"{"cookies": {"cf_clearance": "token-ok"}, "user_agent": "ua-bypass"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = bypassing_client(&bypass.url(), 1);
        let response = client
            .get(&format!("{}/detail", target.url()))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text(), "real page");
        challenge.assert_async().await;
        cleared.assert_async().await;
        bypass_mock.assert_async().await;
    }

    #[tokio::test]
    async fn bound_user_agent_overrides_caller_header() {
        let mut target = mockito::Server::new_async().await;
        let challenge = target
            .mock("GET", "/ua")
            .with_status(403)
            .with_header("server", "cloudflare")
            .with_header("content-type", "text/html")
            .with_body("cf-chl challenge")
            .match_header("user-agent", "ua-external")
            .create_async()
            .await;
        let _ = challenge;
        let cleared = target
            .mock("GET", "/ua")
            .with_status(200)
            .with_body("ok")
            .match_header("user-agent", "ua-bound")
            .create_async()
            .await;

        let mut bypass = mockito::Server::new_async().await;
        bypass
            .mock("GET", mockito::Matcher::Regex("^/cookies".into()))
            .with_status(200)
            .with_body(r#"{"cookies": {"cf_clearance": "tok"}, "user_agent": "ua-bound"}"#)
            .create_async()
            .await;

        let client = bypassing_client(&bypass.url(), 1);
        let mut opts = RequestOptions::default();
        opts.headers.insert("User-Agent".into(), "ua-external".into());
        let response = client
            .request(Method::GET, &format!("{}/ua", target.url()), opts)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        cleared.assert_async().await;
    }

    #[tokio::test]
    async fn head_size_reads_content_length() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/file")
            .with_status(200)
            .with_header("content-length", "4096")
            .create_async()
            .await;

        let client = test_client(0);
        assert_eq!(
            client.head_size(&format!("{}/file", server.url())).await,
            Some(4096)
        );
    }
}
