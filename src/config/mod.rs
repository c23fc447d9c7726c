//! Closed configuration record consumed by the pipeline.
//!
//! Everything the core reads is enumerated here; the GUI/CLI shells own
//! loading and persistence. A fluent builder mirrors the options.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Field;

/// Closed enumeration of supported metadata sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Website {
    Dmm,
    Missav,
    Avbase,
    Javbus,
    Mgstage,
}

impl Website {
    pub const ALL: &'static [Website] = &[
        Website::Dmm,
        Website::Missav,
        Website::Avbase,
        Website::Javbus,
        Website::Mgstage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Website::Dmm => "dmm",
            Website::Missav => "missav",
            Website::Avbase => "avbase",
            Website::Javbus => "javbus",
            Website::Mgstage => "mgstage",
        }
    }
}

impl fmt::Display for Website {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Website {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dmm" => Ok(Website::Dmm),
            "missav" => Ok(Website::Missav),
            "avbase" => Ok(Website::Avbase),
            "javbus" => Ok(Website::Javbus),
            "mgstage" => Ok(Website::Mgstage),
            other => Err(format!("unknown website: {other}")),
        }
    }
}

/// Ordered site preference per output field.
///
/// A site participates in a lookup iff it appears in at least one field's
/// priority list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPriorities {
    priorities: HashMap<Field, Vec<Website>>,
}

impl Default for FieldPriorities {
    fn default() -> Self {
        use Website::*;
        let default_order = vec![Dmm, Avbase, Javbus, Mgstage, Missav];
        let mut priorities = HashMap::new();
        for &field in Field::ALL {
            priorities.insert(field, default_order.clone());
        }
        // Trailer and stills come best from DMM-backed sources.
        priorities.insert(Field::Trailer, vec![Dmm, Avbase, Mgstage, Missav]);
        priorities.insert(Field::Extrafanart, vec![Dmm, Avbase, Javbus, Mgstage]);
        Self { priorities }
    }
}

impl FieldPriorities {
    pub fn new() -> Self {
        Self {
            priorities: HashMap::new(),
        }
    }

    pub fn set(&mut self, field: Field, sites: Vec<Website>) -> &mut Self {
        self.priorities.insert(field, sites);
        self
    }

    pub fn get(&self, field: Field) -> &[Website] {
        self.priorities
            .get(&field)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Distinct sites referenced by any field, in first-appearance order
    /// over [`Field::ALL`].
    pub fn participating_sites(&self) -> Vec<Website> {
        let mut seen = Vec::new();
        for &field in Field::ALL {
            for &site in self.get(field) {
                if !seen.contains(&site) {
                    seen.push(site);
                }
            }
        }
        seen
    }
}

/// Pipeline configuration. Construct via [`Config::builder`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Outbound proxy for site traffic, e.g. `http://127.0.0.1:7890`.
    pub proxy: Option<String>,
    /// Extra HTTP attempts after the first (so `retry + 1` attempts total).
    pub retry: u32,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Base URL of the external Cloudflare bypass service; empty disables
    /// bypass handling entirely.
    pub cf_bypass_url: String,
    /// Proxy used only for bypass-service calls.
    pub cf_bypass_proxy: Option<String>,
    /// Per-field site preference; also determines the enabled-site set.
    pub field_priorities: FieldPriorities,
    /// Maximum concurrent in-flight lookups.
    pub lookup_concurrency: usize,
    /// SOD studio covers: crop instead of direct download when the poster
    /// byte size falls below `thumb_size * sod_size_ratio`.
    pub sod_size_ratio: f64,
    /// Host fragments preferred when picking Google reverse-image results.
    pub google_used_hosts: Vec<String>,
    /// URL fragments that disqualify a Google reverse-image result.
    pub google_exclude_keywords: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: None,
            retry: 3,
            timeout: Duration::from_secs(10),
            cf_bypass_url: String::new(),
            cf_bypass_proxy: None,
            field_priorities: FieldPriorities::default(),
            lookup_concurrency: 5,
            sod_size_ratio: 0.5,
            google_used_hosts: vec![
                "pics.dmm.co.jp".into(),
                "awsimgsrc.dmm.co.jp".into(),
                "image.mgstage.com".into(),
                "m.media-amazon.com".into(),
            ],
            google_exclude_keywords: vec![
                "thumb".into(),
                "avatar".into(),
                "getchu".into(),
                "larger".into(),
            ],
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Group timeout for one lookup's site fanout.
    pub fn lookup_timeout(&self) -> Duration {
        self.timeout * (self.retry + 1) * 2
    }
}

/// Fluent builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_cf_bypass_url(mut self, url: impl Into<String>) -> Self {
        self.config.cf_bypass_url = url.into();
        self
    }

    pub fn with_cf_bypass_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.cf_bypass_proxy = Some(proxy.into());
        self
    }

    pub fn with_field_priorities(mut self, priorities: FieldPriorities) -> Self {
        self.config.field_priorities = priorities;
        self
    }

    pub fn with_lookup_concurrency(mut self, limit: usize) -> Self {
        self.config.lookup_concurrency = limit.max(1);
        self
    }

    pub fn with_sod_size_ratio(mut self, ratio: f64) -> Self {
        self.config.sod_size_ratio = ratio;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
