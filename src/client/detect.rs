//! Cloudflare challenge detection.
//!
//! A response is classified as a challenge page from its body markers plus
//! corroborating status/header evidence. Only the first 8 KiB of the body
//! are inspected, lower-cased.

use http::HeaderMap;

/// Body inspection window.
const BODY_WINDOW: usize = 8 * 1024;

/// Marker phrases found on Cloudflare interstitials.
const CHALLENGE_MARKERS: &[&str] = &[
    "just a moment",
    "cf-chl",
    "cdn-cgi/challenge-platform",
    "attention required",
    "enable javascript and cookies",
    "checking your browser before accessing",
];

/// Markers strong enough to classify on their own, without header evidence.
const STRONG_MARKERS: &[&str] = &["cf-chl", "cdn-cgi/challenge-platform"];

fn header_value_lower(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Classify a response as a Cloudflare challenge page.
///
/// Rule 1: challenge marker present AND status ∈ {403, 429, 503} with a
/// `cloudflare` server header or a `cf-ray` header.
/// Rule 2: a strong marker (`cf-chl`, `cdn-cgi/challenge-platform`) alone
/// suffices.
pub fn is_challenge_response(status: u16, headers: &HeaderMap, body: &[u8]) -> bool {
    let content_type = header_value_lower(headers, "content-type");
    if !content_type.is_empty() && !content_type.contains("text/html") {
        return false;
    }

    let window = &body[..body.len().min(BODY_WINDOW)];
    let text = String::from_utf8_lossy(window).to_lowercase();

    let has_marker = CHALLENGE_MARKERS.iter().any(|marker| text.contains(marker));
    if !has_marker {
        return false;
    }

    let server = header_value_lower(headers, "server");
    let has_cf_ray = headers.contains_key("cf-ray");
    if matches!(status, 403 | 429 | 503) && (server.contains("cloudflare") || has_cf_ray) {
        return true;
    }

    STRONG_MARKERS.iter().any(|marker| text.contains(marker))
}
