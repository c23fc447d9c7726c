//! Cloudflare bypass coordination.
//!
//! Clearance cookies come from an external bypass service (`GET /cookies`,
//! `POST /cache/refresh`). Acquisition is single-flight per host: one
//! refresh runs at a time, waiters reuse its result. Successful grants bind
//! the clearance cookies to the User-Agent that earned them; the binding
//! cache lets a later grant that arrives without a UA recover the right one.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::events::{BypassEvent, EventBus, PipelineEvent};

/// Window within which a fresh grant is reused instead of re-fetched.
const REUSE_WINDOW: Duration = Duration::from_secs(10);
/// Forced refreshes inside this window fall back to the cache (storm guard).
const FORCE_MIN_WINDOW: Duration = Duration::from_secs(10);
/// Minimum spacing between bypass-service attempts per host.
const MIN_ATTEMPT_INTERVAL: Duration = Duration::from_secs(2);
/// Cookie-endpoint retries per target.
const COOKIE_RETRIES: u32 = 2;
/// Refresh-endpoint retries.
const REFRESH_RETRIES: u32 = 2;
/// Per-call service timeout.
const SERVICE_TIMEOUT: Duration = Duration::from_secs(45);
/// Challenge hits before the next bypass escalates to a forced refresh.
const FORCE_AFTER_HITS: u32 = 2;

/// Binding lifetime and cache caps.
const BINDING_TTL: Duration = Duration::from_secs(3600);
const UA_CACHE_PER_HOST: usize = 32;
const UA_CACHE_GLOBAL: usize = 256;

#[derive(Debug, Error)]
pub enum BypassError {
    #[error("bypass service not configured")]
    Disabled,
    #[error("bypass service returned terminal status {0}")]
    Terminal(u16),
    #[error("bypass failed: {0}")]
    Failed(String),
    #[error("bypass transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Clearance cookies plus the User-Agent they are bound to.
#[derive(Debug, Clone, Default)]
pub struct BypassGrant {
    pub cookies: HashMap<String, String>,
    pub user_agent: String,
}

impl BypassGrant {
    fn from_binding(binding: &HostBinding) -> Self {
        Self {
            cookies: binding.cookies.clone(),
            user_agent: binding.user_agent.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct HostBinding {
    cookies: HashMap<String, String>,
    user_agent: String,
    last_refresh: Option<Instant>,
    last_attempt: Option<Instant>,
}

impl HostBinding {
    fn refreshed_within(&self, window: Duration) -> bool {
        self.last_refresh
            .is_some_and(|at| at.elapsed() < window)
    }

    fn expired(&self) -> bool {
        self.last_refresh
            .is_some_and(|at| at.elapsed() >= BINDING_TTL)
    }

    fn clearance(&self) -> Option<&str> {
        self.cookies.get("cf_clearance").map(String::as_str)
    }
}

struct HostState {
    /// Serializes refresh attempts (single-flight).
    flight: AsyncMutex<()>,
    binding: RwLock<HostBinding>,
    challenge_hits: AtomicU32,
}

impl HostState {
    fn new() -> Self {
        Self {
            flight: AsyncMutex::new(()),
            binding: RwLock::new(HostBinding::default()),
            challenge_hits: AtomicU32::new(0),
        }
    }
}

#[derive(Debug, Clone)]
struct UaEntry {
    user_agent: String,
    host: String,
    inserted: Instant,
    last_used: Instant,
}

/// `cookie-identity-key -> User-Agent` cache with TTL and LRU caps.
#[derive(Debug, Default)]
struct UaBindingCache {
    entries: HashMap<String, UaEntry>,
}

impl UaBindingCache {
    fn sweep(&mut self) {
        self.entries
            .retain(|_, entry| entry.inserted.elapsed() < BINDING_TTL);
    }

    fn get(&mut self, key: &str) -> Option<String> {
        self.sweep();
        let entry = self.entries.get_mut(key)?;
        entry.last_used = Instant::now();
        Some(entry.user_agent.clone())
    }

    fn insert(&mut self, key: String, host: &str, user_agent: String) {
        self.sweep();
        let now = Instant::now();
        self.entries.insert(
            key,
            UaEntry {
                user_agent,
                host: host.to_string(),
                inserted: now,
                last_used: now,
            },
        );
        self.enforce_caps(host);
    }

    fn enforce_caps(&mut self, host: &str) {
        while self
            .entries
            .values()
            .filter(|entry| entry.host == host)
            .count()
            > UA_CACHE_PER_HOST
        {
            if !self.evict_lru(Some(host)) {
                break;
            }
        }
        while self.entries.len() > UA_CACHE_GLOBAL {
            if !self.evict_lru(None) {
                break;
            }
        }
    }

    fn evict_lru(&mut self, host: Option<&str>) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|(_, entry)| host.is_none_or(|h| entry.host == h))
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        match victim {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Identity of a cookie jar: the `cf_clearance` value when present, else a
/// hash over the sorted cookie values.
fn cookie_identity(cookies: &HashMap<String, String>) -> String {
    if let Some(clearance) = cookies.get("cf_clearance") {
        return clearance.clone();
    }
    let mut values: Vec<&str> = cookies.values().map(String::as_str).collect();
    values.sort_unstable();
    let mut hasher = DefaultHasher::new();
    values.hash(&mut hasher);
    format!("jar:{:016x}", hasher.finish())
}

/// Single-flight coordinator for bypass-service interactions.
pub struct BypassCoordinator {
    base_url: String,
    service: Option<reqwest::Client>,
    events: Arc<EventBus>,
    hosts: Mutex<HashMap<String, Arc<HostState>>>,
    ua_cache: Mutex<UaBindingCache>,
}

impl BypassCoordinator {
    pub fn new(
        base_url: &str,
        proxy: Option<&str>,
        events: Arc<EventBus>,
    ) -> Result<Self, reqwest::Error> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        let service = if base_url.is_empty() {
            None
        } else {
            let mut builder = reqwest::Client::builder().timeout(SERVICE_TIMEOUT);
            if let Some(proxy) = proxy {
                builder = builder.proxy(reqwest::Proxy::all(proxy)?);
            }
            Some(builder.build()?)
        };
        Ok(Self {
            base_url,
            service,
            events,
            hosts: Mutex::new(HashMap::new()),
            ua_cache: Mutex::new(UaBindingCache::default()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.service.is_some()
    }

    fn host_state(&self, host: &str) -> Arc<HostState> {
        let mut hosts = self.hosts.lock().expect("bypass host registry poisoned");
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::new()))
            .clone()
    }

    /// Count a challenge hit; returns the running total for `host`.
    pub fn record_challenge_hit(&self, host: &str) -> u32 {
        self.host_state(host)
            .challenge_hits
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    pub fn reset_challenge_hits(&self, host: &str) {
        self.host_state(host)
            .challenge_hits
            .store(0, Ordering::SeqCst);
    }

    /// Cached binding for `host`, applying TTL eviction on read.
    pub fn binding(&self, host: &str) -> Option<BypassGrant> {
        let state = self.host_state(host);
        {
            let binding = state.binding.read().expect("binding lock poisoned");
            if !binding.expired() {
                if binding.cookies.is_empty() {
                    return None;
                }
                return Some(BypassGrant::from_binding(&binding));
            }
        }
        let mut binding = state.binding.write().expect("binding lock poisoned");
        if binding.expired() {
            *binding = HostBinding::default();
        }
        None
    }

    /// Acquire clearance cookies for `host`, sharing in-flight work.
    ///
    /// Two consecutive challenge hits promote the call to forced-refresh
    /// mode, which clears the binding before asking the service to rebuild
    /// its cache.
    pub async fn try_bypass(&self, host: &str, target_url: &str) -> Result<BypassGrant, BypassError> {
        if self.service.is_none() {
            return Err(BypassError::Disabled);
        }
        let state = self.host_state(host);
        let force = state.challenge_hits.load(Ordering::SeqCst) >= FORCE_AFTER_HITS;

        let _flight = state.flight.lock().await;

        // A refresh completed while we waited for the flight lock (or just
        // before a forced refresh would storm the service): reuse it.
        {
            let binding = state.binding.read().expect("binding lock poisoned");
            let window = if force { FORCE_MIN_WINDOW } else { REUSE_WINDOW };
            if binding.refreshed_within(window) && !binding.cookies.is_empty() {
                return Ok(BypassGrant::from_binding(&binding));
            }
        }

        let previous_clearance = {
            let mut binding = state.binding.write().expect("binding lock poisoned");
            let previous = binding.clearance().map(str::to_string);
            if force {
                *binding = HostBinding {
                    last_attempt: binding.last_attempt,
                    ..HostBinding::default()
                };
            }
            previous
        };

        // Respect the minimum spacing between service attempts.
        let wait = {
            let binding = state.binding.read().expect("binding lock poisoned");
            binding.last_attempt.and_then(|at| {
                MIN_ATTEMPT_INTERVAL.checked_sub(at.elapsed())
            })
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        state
            .binding
            .write()
            .expect("binding lock poisoned")
            .last_attempt = Some(Instant::now());

        let mut last_error = String::new();
        for target in bypass_targets(target_url) {
            if force {
                self.call_refresh(&target).await;
            }
            match self.call_cookies(&target).await {
                Ok((cookies, user_agent)) => {
                    let grant = self.install_binding(
                        &state,
                        host,
                        cookies,
                        user_agent,
                        force,
                        previous_clearance.as_deref(),
                    );
                    return Ok(grant);
                }
                Err(BypassError::Terminal(status)) => {
                    self.publish_outcome(host, force, false, format!("HTTP {status}"));
                    return Err(BypassError::Terminal(status));
                }
                Err(err) => last_error = err.to_string(),
            }
        }

        self.publish_outcome(host, force, false, last_error.clone());
        Err(BypassError::Failed(last_error))
    }

    fn install_binding(
        &self,
        state: &HostState,
        host: &str,
        cookies: HashMap<String, String>,
        mut user_agent: String,
        forced: bool,
        previous_clearance: Option<&str>,
    ) -> BypassGrant {
        let identity = cookie_identity(&cookies);

        if user_agent.is_empty() {
            if let Ok(mut cache) = self.ua_cache.lock() {
                if let Some(recovered) = cache.get(&identity) {
                    user_agent = recovered;
                }
            }
        } else if let Ok(mut cache) = self.ua_cache.lock() {
            cache.insert(identity.clone(), host, user_agent.clone());
        }

        let still_valid = forced
            && previous_clearance.is_some()
            && cookies.get("cf_clearance").map(String::as_str) == previous_clearance;

        {
            let mut binding = state.binding.write().expect("binding lock poisoned");
            binding.cookies = cookies;
            if !user_agent.is_empty() {
                binding.user_agent = user_agent.clone();
            }
            binding.last_refresh = Some(Instant::now());
        }
        state.challenge_hits.store(0, Ordering::SeqCst);

        let detail = if still_valid {
            "clearance unchanged, still valid".to_string()
        } else {
            format!("identity {}", &identity[..identity.len().min(12)])
        };
        self.publish_outcome(host, forced, true, detail);

        let binding = state.binding.read().expect("binding lock poisoned");
        BypassGrant::from_binding(&binding)
    }

    async fn call_refresh(&self, target: &str) {
        let Some(service) = &self.service else { return };
        let url = format!("{}/cache/refresh", self.base_url);
        for attempt in 1..=REFRESH_RETRIES {
            let result = service.post(&url).query(&[("url", target)]).send().await;
            match result {
                Ok(resp) if resp.status().as_u16() < 400 => return,
                Ok(resp) => log::warn!(
                    "⚠️ bypass refresh failed ({attempt}/{REFRESH_RETRIES}): HTTP {}",
                    resp.status()
                ),
                Err(err) => log::warn!("⚠️ bypass refresh failed ({attempt}/{REFRESH_RETRIES}): {err}"),
            }
        }
    }

    async fn call_cookies(&self, target: &str) -> Result<(HashMap<String, String>, String), BypassError> {
        let service = self.service.as_ref().ok_or(BypassError::Disabled)?;
        let url = format!("{}/cookies", self.base_url);
        let mut last_error = String::from("no response");

        for attempt in 1..=COOKIE_RETRIES {
            let response = match service.get(&url).query(&[("url", target)]).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    last_error = err.to_string();
                    continue;
                }
            };
            let status = response.status().as_u16();
            if status == 404 {
                return Err(BypassError::Terminal(status));
            }
            if status >= 400 {
                last_error = format!("HTTP {status}");
                continue;
            }
            let payload: Value = match response.json().await {
                Ok(value) => value,
                Err(err) => {
                    last_error = format!("invalid JSON: {err}");
                    continue;
                }
            };
            let (cookies, user_agent) = extract_bypass_payload(&payload);
            if cookies.contains_key("cf_clearance") {
                return Ok((cookies, user_agent));
            }
            last_error = if cookies.is_empty() {
                format!("empty cookie payload ({attempt}/{COOKIE_RETRIES})")
            } else {
                format!("payload missing cf_clearance ({attempt}/{COOKIE_RETRIES})")
            };
        }

        Err(BypassError::Failed(last_error))
    }

    fn publish_outcome(&self, host: &str, forced: bool, success: bool, detail: String) {
        self.events.publish(PipelineEvent::Bypass(BypassEvent {
            host: host.to_string(),
            forced,
            success,
            detail,
            timestamp: Utc::now(),
        }));
    }

    #[cfg(test)]
    fn ua_cache_len(&self) -> usize {
        self.ua_cache.lock().unwrap().len()
    }
}

/// Origin first, then the full URL.
fn bypass_targets(target_url: &str) -> Vec<String> {
    let mut targets = Vec::new();
    if let Ok(url) = url::Url::parse(target_url) {
        if let Some(host) = url.host_str() {
            let mut origin = format!("{}://{host}", url.scheme());
            if let Some(port) = url.port() {
                origin.push_str(&format!(":{port}"));
            }
            targets.push(origin);
        }
    }
    if !targets.contains(&target_url.to_string()) {
        targets.push(target_url.to_string());
    }
    targets
}

/// Tolerant payload extraction: the body may be nested under
/// `data`/`result`/`payload`, and the UA may live in `user_agent`,
/// `userAgent`, or `headers["User-Agent"]`.
fn extract_bypass_payload(payload: &Value) -> (HashMap<String, String>, String) {
    let body = ["data", "result", "payload"]
        .iter()
        .find_map(|key| {
            let nested = payload.get(key)?;
            nested.get("cookies").is_some().then_some(nested)
        })
        .unwrap_or(payload);

    let mut cookies = HashMap::new();
    if let Some(map) = body.get("cookies").and_then(Value::as_object) {
        for (name, value) in map {
            if name.is_empty() || value.is_null() {
                continue;
            }
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            cookies.insert(name.clone(), rendered);
        }
    }

    let user_agent = body
        .get("user_agent")
        .or_else(|| body.get("userAgent"))
        .and_then(Value::as_str)
        .or_else(|| {
            body.get("headers")
                .and_then(|headers| headers.get("User-Agent"))
                .and_then(Value::as_str)
        })
        .unwrap_or_default()
        .trim()
        .to_string();

    (cookies, user_agent)
}
