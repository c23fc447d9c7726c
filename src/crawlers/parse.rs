//! Shared HTML extraction helpers.
//!
//! `scraper::Html` is not `Send`, so every helper takes a parsed document
//! (or raw HTML) and returns owned data synchronously; callers parse inside
//! a block that never crosses an `.await`.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

/// Parse a CSS selector that is known-good at compile time.
pub fn sel(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|err| panic!("invalid selector `{css}`: {err:?}"))
}

/// Trimmed text content of the first match.
pub fn first_text(doc: &Html, selector: &Selector) -> String {
    doc.select(selector)
        .next()
        .map(|el| element_text(&el))
        .unwrap_or_default()
}

/// Trimmed text of every match.
pub fn all_texts(doc: &Html, selector: &Selector) -> Vec<String> {
    doc.select(selector)
        .map(|el| element_text(&el))
        .filter(|text| !text.is_empty())
        .collect()
}

/// First match's attribute value.
pub fn first_attr(doc: &Html, selector: &Selector, attr: &str) -> String {
    doc.select(selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

/// Attribute value of every match.
pub fn all_attrs(doc: &Html, selector: &Selector, attr: &str) -> Vec<String> {
    doc.select(selector)
        .filter_map(|el| el.value().attr(attr))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

/// `<meta property|name=… content=…>` lookup.
pub fn meta_content(doc: &Html, key: &str) -> String {
    let by_property = sel(&format!(r#"meta[property="{key}"]"#));
    let by_name = sel(&format!(r#"meta[name="{key}"]"#));
    let content = first_attr(doc, &by_property, "content");
    if !content.is_empty() {
        return content;
    }
    first_attr(doc, &by_name, "content")
}

/// Whitespace-normalized text of one element subtree.
pub fn element_text(el: &ElementRef<'_>) -> String {
    let joined: String = el.text().collect::<Vec<_>>().join(" ");
    normalize_whitespace(&joined)
}

pub fn normalize_whitespace(text: &str) -> String {
    static WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
    WS.replace_all(text.trim(), " ").into_owned()
}

/// Strip separators and case from an info-row label so multilingual
/// aliases compare equal (`"發行日期:"` → `"發行日期"`).
pub fn normalize_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '：')
        .collect::<String>()
        .to_lowercase()
}

/// Split a personnel/tag cell on the usual separator set.
pub fn split_names(value: &str) -> Vec<String> {
    static SEP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[|｜,，、/／]").unwrap());
    SEP.split(value)
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "-" && *name != "_")
        .map(str::to_string)
        .collect()
}

/// Prefer the parenthesized Japanese reading when a name carries one.
pub fn prefer_parenthesized(name: &str) -> String {
    static PAREN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"[（(]\s*([^()（）]+?)\s*[）)]").unwrap());
    let trimmed = name.trim();
    if let Some(captures) = PAREN.captures(trimmed) {
        let inner = captures[1].trim();
        if !inner.is_empty() {
            return inner.to_string();
        }
    }
    trimmed.to_string()
}

/// First run of digits in a string.
pub fn first_digits(value: &str) -> Option<&str> {
    static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
    DIGITS.find(value).map(|m| m.as_str())
}

/// Duration cell to minutes: values ≥ 300 are seconds and get rounded.
pub fn to_minutes(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let Some(digits) = first_digits(trimmed) else {
        return trimmed.to_string();
    };
    let Ok(value) = digits.parse::<u64>() else {
        return trimmed.to_string();
    };
    if value >= 300 {
        (((value as f64) / 60.0).round().max(1.0) as u64).to_string()
    } else {
        value.to_string()
    }
}

/// Normalize `YYYY-M-D`-style dates to ISO; other shapes pass through.
pub fn normalize_release(raw: &str) -> String {
    static YMD: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})").unwrap());
    let trimmed = raw.trim();
    if let Some(caps) = YMD.captures(trimmed) {
        let year = &caps[1];
        let month: u32 = caps[2].parse().unwrap_or(0);
        let day: u32 = caps[3].parse().unwrap_or(0);
        return format!("{year}-{month:02}-{day:02}");
    }
    trimmed.to_string()
}
