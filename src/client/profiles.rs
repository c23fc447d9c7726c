//! Browser impersonation header profiles.
//!
//! One profile is selected at client construction and applied to every
//! outbound request, mirroring how real browsers keep a stable identity
//! for a session. Cloudflare correlates `cf_clearance` cookies with the
//! User-Agent that earned them, so the profile must stay fixed until a
//! bypass binding overrides it.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use rand::seq::SliceRandom;

/// A single impersonation target: stable name plus default headers.
#[derive(Debug, Clone)]
pub struct ImpersonationProfile {
    pub name: &'static str,
    pub user_agent: &'static str,
    pub accept: &'static str,
    pub accept_language: &'static str,
    pub sec_ch_ua: Option<&'static str>,
}

const CHROME_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";
const FIREFOX_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

/// Profiles matching current mainstream browser releases.
pub const PROFILES: &[ImpersonationProfile] = &[
    ImpersonationProfile {
        name: "chrome131",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        accept: CHROME_ACCEPT,
        accept_language: "ja-JP,ja;q=0.9,en-US;q=0.8,en;q=0.7",
        sec_ch_ua: Some(r#""Google Chrome";v="131", "Chromium";v="131", "Not_A Brand";v="24""#),
    },
    ImpersonationProfile {
        name: "chrome136",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36",
        accept: CHROME_ACCEPT,
        accept_language: "ja-JP,ja;q=0.9,en-US;q=0.8,en;q=0.7",
        sec_ch_ua: Some(r#""Google Chrome";v="136", "Chromium";v="136", "Not.A/Brand";v="99""#),
    },
    ImpersonationProfile {
        name: "firefox133",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
        accept: FIREFOX_ACCEPT,
        accept_language: "ja,en-US;q=0.7,en;q=0.3",
        sec_ch_ua: None,
    },
    ImpersonationProfile {
        name: "firefox135",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:135.0) Gecko/20100101 Firefox/135.0",
        accept: FIREFOX_ACCEPT,
        accept_language: "ja,en-US;q=0.7,en;q=0.3",
        sec_ch_ua: None,
    },
];

/// Pick a random profile for a new client session.
pub fn random_profile() -> &'static ImpersonationProfile {
    PROFILES
        .choose(&mut rand::thread_rng())
        .unwrap_or(&PROFILES[0])
}

/// Look up a profile by name (`chrome131`, `firefox133`, …).
pub fn profile_by_name(name: &str) -> Option<&'static ImpersonationProfile> {
    PROFILES.iter().find(|profile| profile.name == name)
}

impl ImpersonationProfile {
    /// Default header map applied to the underlying HTTP client.
    pub fn base_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::USER_AGENT,
            HeaderValue::from_static(self.user_agent),
        );
        headers.insert(http::header::ACCEPT, HeaderValue::from_static(self.accept));
        headers.insert(
            http::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static(self.accept_language),
        );
        if let Some(sec_ch_ua) = self.sec_ch_ua {
            headers.insert(
                HeaderName::from_static("sec-ch-ua"),
                HeaderValue::from_static(sec_ch_ua),
            );
            headers.insert(
                HeaderName::from_static("sec-ch-ua-mobile"),
                HeaderValue::from_static("?0"),
            );
        }
        headers
    }
}
