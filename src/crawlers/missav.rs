//! MissAV crawler.
//!
//! Censored numbers map straight onto slug-style detail URLs; uncensored
//! numbers go through the site search first. Detail pages are identified
//! by a closed set of multilingual info-row labels, and "not found" is a
//! soft-404 template served with HTTP 200 that must never be parsed for
//! fields.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use crate::client::AvWebClient;
use crate::config::Website;
use crate::types::CrawlerData;

use super::parse::{
    all_attrs, element_text, meta_content, normalize_label, prefer_parenthesized, sel,
    split_names, to_minutes,
};
use super::{Context, CrawlerError, SiteCrawler};

const DEFAULT_BASE_URL: &str = "https://missav.ws";

static CODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([a-z]{2,10})[-_ ]?(\d{2,6})").unwrap());
static UNCENSORED_DATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{6}[-_]\d{3,4}$").unwrap());
static DATE_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{6}[-_]\d{3,4})").unwrap());
static FOUR_OH_FOUR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|\s)404(\s|$)").unwrap());
static LETTER_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z]+").unwrap());

static INFO_ROWS: Lazy<Selector> = Lazy::new(|| sel(r#"div[class*="text-secondary"]"#));
static ROW_SPANS: Lazy<Selector> = Lazy::new(|| sel("span"));
static ROW_VALUE: Lazy<Selector> = Lazy::new(|| sel("span.font-medium, time"));
static ROW_LINKS: Lazy<Selector> = Lazy::new(|| sel("a"));
static ANCHORS: Lazy<Selector> = Lazy::new(|| sel("a[href]"));
static H1: Lazy<Selector> = Lazy::new(|| sel("h1"));
static H1_P_TEXT: Lazy<Selector> = Lazy::new(|| sel("h1, p"));
static OG_ACTOR: Lazy<Selector> = Lazy::new(|| sel(r#"meta[property="og:video:actor"]"#));
static OG_DIRECTOR: Lazy<Selector> = Lazy::new(|| sel(r#"meta[property="og:video:director"]"#));

const URL_LANG_SUFFIXES: &[&str] = &["cn", "en", "jp", "ja", "tw", "hk"];

/// Number prefixes that are uncensored productions regardless of pattern.
const UNCENSORED_PREFIXES: &[&str] = &[
    "heyzo", "carib", "caribbean", "1pon", "1pondo", "pondo", "10mu", "musume", "pacopacomama",
    "paco", "fc2", "heydouga", "mura", "tokyohot", "gachinco", "gachi",
];

const SEARCH_BLACKLIST_PREFIXES: &[&str] = &[
    "search", "genres", "genre", "makers", "maker", "actresses", "actress", "actors", "actor",
    "directors", "director", "series", "tags", "tag", "label", "labels", "studio", "studios",
    "faq", "privacy", "terms", "about", "contact", "login", "register", "assets", "api",
    "cdn-cgi",
];

const SOFT_404_TITLE_MARKERS: &[&str] = &[
    "missav | 免費高清av在線看",
    "missav | 免费高清av在线看",
    "missav | free jav online streaming",
    "missav | 無料エロ動画見放題",
];

const SOFT_404_TEXT_MARKERS: &[&str] = &["找不到頁面", "找不到页面", "page not found", "not found"];

/// Boilerplate fragments of the site's generic marketing outline.
const GENERIC_OUTLINE_MARKERS: &[&str] = &[
    "免費高清日本av在線看",
    "免费高清日本av在线看",
    "無需下載",
    "无需下载",
    "開始播放後不會再有廣告",
    "开始播放后不会再有广告",
    "支援任何裝置包括手機",
    "支持任何装置包括手机",
    "可以番號",
    "可以番号",
    "加入會員後可任意收藏影片供日後觀賞",
    "加入会员后可任意收藏影片供日后观赏",
];

fn label_set(labels: &[&str]) -> HashSet<String> {
    labels.iter().map(|label| normalize_label(label)).collect()
}

static CODE_LABELS: Lazy<HashSet<String>> = Lazy::new(|| label_set(&["番號", "番号", "code"]));
static TITLE_LABELS: Lazy<HashSet<String>> = Lazy::new(|| label_set(&["標題", "标题", "title"]));
static ACTRESS_LABELS: Lazy<HashSet<String>> =
    Lazy::new(|| label_set(&["女優", "女优", "actress"]));
static ACTOR_LABELS: Lazy<HashSet<String>> = Lazy::new(|| label_set(&["男優", "男优", "actor"]));
static NEUTRAL_ACTOR_LABELS: Lazy<HashSet<String>> =
    Lazy::new(|| label_set(&["演員", "演员", "cast", "performer", "performers"]));
static RELEASE_LABELS: Lazy<HashSet<String>> =
    Lazy::new(|| label_set(&["發行日期", "发行日期", "release date", "releasedate"]));
static DURATION_LABELS: Lazy<HashSet<String>> =
    Lazy::new(|| label_set(&["時長", "时长", "duration", "runtime"]));
static TAG_LABELS: Lazy<HashSet<String>> =
    Lazy::new(|| label_set(&["類型", "类型", "genre", "genres", "tags"]));
static TAG_FALLBACK_LABELS: Lazy<HashSet<String>> = Lazy::new(|| label_set(&["標籤", "标签"]));
static SERIES_LABELS: Lazy<HashSet<String>> = Lazy::new(|| label_set(&["系列", "series"]));
static MAKER_LABELS: Lazy<HashSet<String>> =
    Lazy::new(|| label_set(&["發行商", "发行商", "maker", "publisher", "studio"]));
static DIRECTOR_LABELS: Lazy<HashSet<String>> =
    Lazy::new(|| label_set(&["導演", "导演", "director"]));

pub struct MissavCrawler {
    client: Arc<AvWebClient>,
    base_url: String,
}

impl MissavCrawler {
    pub fn new(client: Arc<AvWebClient>, base_url: String) -> Self {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url.trim_end_matches('/').to_string()
        };
        Self { client, base_url }
    }

    // Number canonicalization ---------------------------------------------

    fn normalize_keyword(value: &str) -> String {
        value
            .to_lowercase()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect()
    }

    fn parse_code_parts(value: &str) -> Option<(String, String)> {
        let normalized = value.trim().to_lowercase().replace('_', "-").replace(' ', "");
        let caps = CODE_PATTERN.captures(&normalized)?;
        Some((caps[1].to_lowercase(), caps[2].to_string()))
    }

    fn normalize_digits(digits: &str) -> String {
        let stripped = digits.trim_start_matches('0');
        let stripped = if stripped.is_empty() { "0" } else { stripped };
        if stripped.len() < 3 && digits.len() >= 3 {
            format!("{stripped:0>3}")
        } else {
            stripped.to_string()
        }
    }

    /// `MIDV-0999-UC` → `midv-999`, `010101-123-U` → `010101-123`.
    pub fn normalize_number_for_uncensored_judge(number: &str) -> String {
        let normalized = number.trim().to_lowercase().replace('_', "-");
        if normalized.is_empty() {
            return String::new();
        }
        if let Some((prefix, digits)) = Self::parse_code_parts(&normalized) {
            return format!("{prefix}-{}", Self::normalize_digits(&digits));
        }
        if let Some(caps) = DATE_PREFIX.captures(&normalized) {
            return caps[1].to_string();
        }
        normalized
    }

    /// Uncensored numbers route through the site search.
    pub fn should_use_uncensored_search(number: &str) -> bool {
        let normalized = Self::normalize_number_for_uncensored_judge(number);
        if normalized.is_empty() {
            return false;
        }
        if UNCENSORED_PREFIXES
            .iter()
            .any(|prefix| normalized.starts_with(prefix))
        {
            return true;
        }
        UNCENSORED_DATE_PATTERN.is_match(&normalized)
    }

    fn normalize_number_case(number: &str) -> String {
        let trimmed = number.trim();
        LETTER_RUNS
            .replace_all(&trimmed.to_lowercase(), |caps: &regex::Captures<'_>| {
                caps[0].to_uppercase()
            })
            .into_owned()
    }

    fn code_from_value(value: &str) -> String {
        match Self::parse_code_parts(value) {
            Some((prefix, digits)) => {
                Self::normalize_keyword(&format!("{prefix}-{}", Self::normalize_digits(&digits)))
            }
            None => String::new(),
        }
    }

    // URL plumbing ---------------------------------------------------------

    fn detail_path_parts(url: &str) -> Vec<String> {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        let mut parts: Vec<String> = path
            .split('/')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        while parts
            .last()
            .is_some_and(|part| URL_LANG_SUFFIXES.contains(&part.to_lowercase().as_str()))
        {
            parts.pop();
        }
        parts
    }

    fn slug_of(url: &str) -> String {
        Self::detail_path_parts(url).last().cloned().unwrap_or_default()
    }

    fn ensure_cn_detail_url(&self, url: &str) -> String {
        let Ok(parsed) = url::Url::parse(url) else {
            return url.to_string();
        };
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return url.to_string();
        }
        let mut parts = Self::detail_path_parts(url);
        if parts.is_empty() {
            return url.to_string();
        }
        parts.push("cn".to_string());
        let mut rebuilt = parsed.clone();
        rebuilt.set_path(&format!("/{}", parts.join("/")));
        rebuilt.set_query(None);
        rebuilt.set_fragment(None);
        rebuilt.to_string()
    }

    fn direct_detail_url(&self, number: &str) -> String {
        let encoded = urlencoding::encode(number.trim()).into_owned();
        self.ensure_cn_detail_url(&format!("{}/{}", self.base_url, encoded))
    }

    fn search_url(&self, number: &str) -> String {
        format!(
            "{}/search/{}",
            self.base_url,
            urlencoding::encode(number.trim())
        )
    }

    fn is_search_mode_url(url: &str) -> bool {
        url::Url::parse(url)
            .map(|u| u.path().to_lowercase().contains("/search/"))
            .unwrap_or(false)
    }

    fn host_of(url: &str) -> String {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
            .to_lowercase()
            .trim_start_matches("www.")
            .to_string()
    }

    fn is_search_result_detail_href(&self, href: &str) -> bool {
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
        {
            return false;
        }
        let Ok(base) = url::Url::parse(&self.base_url) else {
            return false;
        };
        let Ok(detail) = base.join(href) else {
            return false;
        };
        if !matches!(detail.scheme(), "http" | "https") {
            return false;
        }
        if Self::host_of(detail.as_str()) != Self::host_of(&self.base_url) {
            return false;
        }
        if detail.query().is_some() || detail.fragment().is_some() {
            return false;
        }
        let parts = Self::detail_path_parts(detail.as_str());
        let Some(first) = parts.first() else {
            return false;
        };
        if SEARCH_BLACKLIST_PREFIXES.contains(&first.to_lowercase().as_str()) {
            return false;
        }
        if parts.len() > 2 {
            return false;
        }
        if parts.len() == 2 && !parts[0].to_lowercase().starts_with("dm") {
            return false;
        }
        parts
            .last()
            .is_some_and(|last| last.chars().any(|c| c.is_ascii_digit()))
    }

    fn first_detail_url_from_search(&self, html: &str, expected_keyword: &str) -> String {
        let doc = Html::parse_document(html);
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        for anchor in doc.select(&ANCHORS) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            if !self.is_search_result_detail_href(href) {
                continue;
            }
            let Ok(base) = url::Url::parse(&self.base_url) else {
                continue;
            };
            let Ok(joined) = base.join(href.trim()) else {
                continue;
            };
            let detail_url = self.ensure_cn_detail_url(joined.as_str());
            if seen.insert(detail_url.clone()) {
                candidates.push(detail_url);
            }
        }
        if candidates.is_empty() {
            return String::new();
        }
        if !expected_keyword.is_empty() {
            for candidate in &candidates {
                let slug = Self::slug_of(candidate).to_lowercase().replace('_', "-");
                if slug.contains(expected_keyword) {
                    return candidate.clone();
                }
            }
        }
        candidates[0].clone()
    }

    // Detail parsing -------------------------------------------------------

    pub fn is_soft_404_page(html: &str) -> bool {
        let doc = Html::parse_document(html);
        let og_title = {
            let mut title = meta_content(&doc, "og:title");
            if title.is_empty() {
                title = doc
                    .select(&sel("title"))
                    .next()
                    .map(|el| element_text(&el))
                    .unwrap_or_default();
            }
            title.to_lowercase()
        };
        let og_image = meta_content(&doc, "og:image").to_lowercase();

        let mut text_blob = String::new();
        for el in doc.select(&H1_P_TEXT) {
            text_blob.push_str(&element_text(&el).to_lowercase());
            text_blob.push(' ');
        }

        let has_404_code = FOUR_OH_FOUR.is_match(&text_blob);
        let has_not_found_text = SOFT_404_TEXT_MARKERS
            .iter()
            .any(|marker| text_blob.contains(marker));
        let is_generic_title = SOFT_404_TITLE_MARKERS
            .iter()
            .any(|marker| og_title.contains(marker));
        let is_logo_thumb = og_image.contains("logo-square.png");

        if has_not_found_text && has_404_code {
            return true;
        }
        is_generic_title && is_logo_thumb && has_404_code
    }

    fn is_generic_outline(outline: &str) -> bool {
        let compact: String = outline
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '\u{3000}')
            .collect();
        if compact.is_empty() {
            return true;
        }
        let hits = GENERIC_OUTLINE_MARKERS
            .iter()
            .filter(|marker| compact.contains(*marker))
            .count();
        hits >= 2
    }

    fn info_rows(doc: &Html) -> Vec<(String, String, Vec<String>)> {
        let mut rows = Vec::new();
        for row in doc.select(&INFO_ROWS) {
            let Some(first_span) = row.select(&ROW_SPANS).next() else {
                continue;
            };
            let label = normalize_label(&element_text(&first_span));
            if label.is_empty() {
                continue;
            }
            let mut value = row
                .select(&ROW_VALUE)
                .next()
                .map(|el| element_text(&el))
                .unwrap_or_default();
            let links: Vec<String> = row
                .select(&ROW_LINKS)
                .map(|a| element_text(&a))
                .filter(|text| !text.is_empty())
                .collect();
            if value.is_empty() && !links.is_empty() {
                value = links.join(" | ");
            }
            rows.push((label, value, links));
        }
        rows
    }

    fn find_value<'a>(
        rows: &'a [(String, String, Vec<String>)],
        labels: &HashSet<String>,
    ) -> (String, Vec<String>) {
        for (label, value, links) in rows {
            if labels.contains(label) {
                return (value.clone(), links.clone());
            }
        }
        (String::new(), Vec::new())
    }

    fn names_by_labels(
        rows: &[(String, String, Vec<String>)],
        labels: &HashSet<String>,
    ) -> Vec<String> {
        let (value, links) = Self::find_value(rows, labels);
        let raw = if links.is_empty() {
            split_names(&value)
        } else {
            links
        };
        crate::types::dedupe(raw.iter().map(|name| prefer_parenthesized(name)).collect())
    }

    fn parse_detail(html: &str, input_number: &str) -> CrawlerData {
        let doc = Html::parse_document(html);
        let rows = Self::info_rows(&doc);
        let mut data = CrawlerData::default();

        let (code, _) = Self::find_value(&rows, &CODE_LABELS);
        data.number = if code.is_empty() {
            input_number.to_string()
        } else {
            code
        };

        let (title, _) = Self::find_value(&rows, &TITLE_LABELS);
        data.title = if title.is_empty() {
            let og = meta_content(&doc, "og:title");
            if og.is_empty() {
                doc.select(&H1)
                    .next()
                    .map(|el| element_text(&el))
                    .unwrap_or_default()
            } else {
                og
            }
        } else {
            title
        };
        data.originaltitle = data.title.clone();

        // Actresses first; a male-only cast leaves `actors` empty while
        // `all_actors` keeps everyone.
        let actresses = Self::names_by_labels(&rows, &ACTRESS_LABELS);
        let males = Self::names_by_labels(&rows, &ACTOR_LABELS);
        let neutral = Self::names_by_labels(&rows, &NEUTRAL_ACTOR_LABELS);
        let og_actors: Vec<String> = all_attrs(&doc, &OG_ACTOR, "content")
            .iter()
            .map(|name| prefer_parenthesized(name))
            .collect();

        data.actors = if !actresses.is_empty() {
            actresses.clone()
        } else if !neutral.is_empty() {
            neutral.clone()
        } else if !males.is_empty() {
            Vec::new()
        } else {
            crate::types::dedupe(og_actors.clone())
        };
        let mut everyone = actresses;
        everyone.extend(males);
        everyone.extend(neutral);
        if everyone.is_empty() {
            everyone = og_actors;
        }
        data.all_actors = crate::types::dedupe(everyone);

        let (director_value, director_links) = Self::find_value(&rows, &DIRECTOR_LABELS);
        let mut directors = if director_links.is_empty() {
            split_names(&director_value)
        } else {
            director_links
        };
        if directors.is_empty() {
            directors = all_attrs(&doc, &OG_DIRECTOR, "content");
        }
        data.directors = crate::types::dedupe(directors);

        let outline = {
            let og = meta_content(&doc, "og:description");
            if og.is_empty() {
                meta_content(&doc, "description")
            } else {
                og
            }
        };
        if !Self::is_generic_outline(&outline) {
            data.outline = outline.trim().to_string();
        }
        data.originalplot = data.outline.clone();

        let (release, _) = Self::find_value(&rows, &RELEASE_LABELS);
        data.release = if release.is_empty() {
            meta_content(&doc, "og:video:release_date")
        } else {
            release
        };
        if let Some(head) = data.release.get(..4) {
            if head.bytes().all(|b| b.is_ascii_digit()) {
                data.year = head.to_string();
            }
        }

        let (duration, _) = Self::find_value(&rows, &DURATION_LABELS);
        data.runtime = if duration.is_empty() {
            to_minutes(&meta_content(&doc, "og:video:duration"))
        } else {
            to_minutes(&duration)
        };

        let (tags_value, tag_links) = Self::find_value(&rows, &TAG_LABELS);
        let mut tags = if tag_links.is_empty() {
            split_names(&tags_value)
        } else {
            tag_links
        };
        if tags.is_empty() {
            for (value, links) in
                rows.iter()
                    .filter_map(|(label, value, links)| {
                        TAG_FALLBACK_LABELS
                            .contains(label)
                            .then_some((value.clone(), links.clone()))
                    })
            {
                if links.is_empty() {
                    tags.extend(split_names(&value));
                } else {
                    tags.extend(links);
                }
            }
        }
        data.tags = crate::types::dedupe(tags);

        let (series_value, series_links) = Self::find_value(&rows, &SERIES_LABELS);
        data.series = series_links.first().cloned().unwrap_or(series_value);

        let (maker_value, maker_links) = Self::find_value(&rows, &MAKER_LABELS);
        data.publisher = maker_links.first().cloned().unwrap_or(maker_value);

        data.thumb = meta_content(&doc, "og:image");
        data.poster = data.thumb.clone();
        data
    }

    fn canonical_url(html: &str) -> String {
        let doc = Html::parse_document(html);
        meta_content(&doc, "og:url")
    }

    fn external_id_from_url(detail_url: &str) -> String {
        let parts = Self::detail_path_parts(detail_url);
        for part in &parts {
            if part.to_lowercase().starts_with("dm") {
                return part.to_lowercase();
            }
        }
        parts
            .last()
            .map(|part| part.to_lowercase())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SiteCrawler for MissavCrawler {
    fn site(&self) -> Website {
        Website::Missav
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    fn client(&self) -> &Arc<AvWebClient> {
        &self.client
    }

    async fn generate_search_urls(&self, ctx: &mut Context) -> Result<Vec<String>, CrawlerError> {
        let number = ctx.input.number.trim().to_string();
        if number.is_empty() {
            return Err(CrawlerError::NumberEmpty);
        }
        if Self::should_use_uncensored_search(&number) {
            let search_url = self.search_url(&number);
            ctx.debug(format!("missav uncensored search: {search_url}"));
            return Ok(vec![search_url]);
        }
        let detail_url = self.direct_detail_url(&number);
        ctx.debug(format!("missav direct detail: {detail_url}"));
        Ok(vec![detail_url])
    }

    /// Only uncensored lookups have a real search page; direct detail
    /// URLs skip straight to the detail stage. An empty uncensored search
    /// falls back to the slug-style detail URL.
    async fn search(
        &self,
        ctx: &mut Context,
        search_urls: Vec<String>,
    ) -> Result<Vec<String>, CrawlerError> {
        if search_urls.iter().any(|url| Self::is_search_mode_url(url)) {
            return match self.search_via_pages(ctx, search_urls).await {
                Ok(detail_urls) if !detail_urls.is_empty() => Ok(detail_urls),
                Ok(_) | Err(_) => {
                    let fallback = self.direct_detail_url(&ctx.input.number);
                    ctx.debug(format!("missav search fell back to: {fallback}"));
                    Ok(vec![fallback])
                }
            };
        }
        ctx.debug("missav using direct detail urls".to_string());
        Ok(search_urls)
    }

    async fn parse_search_page(
        &self,
        ctx: &mut Context,
        html: &str,
        search_url: &str,
    ) -> Result<Vec<String>, CrawlerError> {
        if !Self::is_search_mode_url(search_url) {
            return Ok(vec![search_url.to_string()]);
        }
        let expected = ctx.input.number.trim().to_lowercase().replace('_', "-");
        let detail_url = self.first_detail_url_from_search(html, &expected);
        if detail_url.is_empty() {
            ctx.debug("missav search yielded no detail url".to_string());
            // Fall back to the slug-style detail URL.
            return Ok(vec![self.direct_detail_url(&ctx.input.number)]);
        }
        ctx.debug(format!("missav search hit: {detail_url}"));
        Ok(vec![detail_url])
    }

    async fn parse_detail_page(
        &self,
        ctx: &mut Context,
        html: &str,
        detail_url: &str,
    ) -> Result<CrawlerData, CrawlerError> {
        if Self::is_soft_404_page(html) {
            return Err(CrawlerError::SoftNotFound(format!(
                "missav detail gone: {detail_url}"
            )));
        }

        let canonical = Self::canonical_url(html);
        let final_url = if canonical.is_empty() {
            detail_url.to_string()
        } else {
            canonical
        };

        let mut data = Self::parse_detail(html, &ctx.input.number);

        let input_code = Self::code_from_value(&ctx.input.number);
        let canonical_code = Self::code_from_value(&Self::slug_of(&final_url));
        let data_code = Self::code_from_value(&data.number);
        let target_code = if canonical_code.is_empty() {
            data_code
        } else {
            canonical_code
        };
        if !input_code.is_empty() && !target_code.is_empty() && input_code != target_code {
            return Err(CrawlerError::NumberMismatch {
                input: ctx.input.number.clone(),
                found: data.number.clone(),
            });
        }

        let canonical_number = Self::normalize_number_case(&Self::slug_of(&final_url));
        if !canonical_number.is_empty() {
            data.number = canonical_number;
        }

        if Self::should_use_uncensored_search(&ctx.input.number) {
            let expected = ctx.input.number.trim().to_lowercase().replace('_', "-");
            let slug = Self::slug_of(&final_url).to_lowercase().replace('_', "-");
            if !expected.is_empty() && !slug.contains(&expected) {
                return Err(CrawlerError::NumberMismatch {
                    input: ctx.input.number.clone(),
                    found: slug,
                });
            }
        }

        data.external_id = if data.number.is_empty() {
            Self::external_id_from_url(&final_url)
        } else {
            data.number.clone()
        };
        ctx.debug(format!("missav parsed {}", data.number));
        Ok(data)
    }

    async fn post_process(
        &self,
        ctx: &mut Context,
        mut data: CrawlerData,
    ) -> Result<CrawlerData, CrawlerError> {
        data.number = if data.number.is_empty() {
            Self::normalize_number_case(&ctx.input.number)
        } else {
            Self::normalize_number_case(&data.number)
        };
        if data.originaltitle.is_empty() {
            data.originaltitle = data.title.clone();
        }
        if data.originalplot.is_empty() {
            data.originalplot = data.outline.clone();
        }
        if data.poster.is_empty() {
            data.poster = data.thumb.clone();
        }
        if data.publisher.is_empty() {
            data.publisher = data.studio.clone();
        }
        data.mosaic = String::new();
        if data.year.is_empty() {
            if let Some(head) = data.release.get(..4) {
                if head.bytes().all(|b| b.is_ascii_digit()) {
                    data.year = head.to_string();
                }
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::types::CrawlerInput;

    fn crawler() -> MissavCrawler {
        let config = Config::builder().with_retry(0).build();
        let client =
            Arc::new(AvWebClient::with_events(&config, Arc::new(EventBus::silent())).unwrap());
        MissavCrawler::new(client, String::new())
    }

    #[test]
    fn normalizes_numbers_for_uncensored_judge() {
        for (number, expected) in [
            ("MIDV-999-U", "midv-999"),
            ("MIDV-0999-UC", "midv-999"),
            ("MIDV999U", "midv-999"),
            ("010101-123-U", "010101-123"),
        ] {
            assert_eq!(
                MissavCrawler::normalize_number_for_uncensored_judge(number),
                expected,
                "{number}"
            );
        }
    }

    #[test]
    fn uncensored_routing_table() {
        for (number, expected) in [
            ("MIDV-999-U", false),
            ("MIDV-999-UC", false),
            ("MIDV-999", false),
            ("HEYZO-1234-U", true),
            ("010101-123-U", true),
        ] {
            assert_eq!(
                MissavCrawler::should_use_uncensored_search(number),
                expected,
                "{number}"
            );
        }
    }

    #[tokio::test]
    async fn uncensored_numbers_get_search_urls() {
        let crawler = crawler();
        let mut ctx = Context::new(CrawlerInput::from_number("010101-123-U"));
        let urls = crawler.generate_search_urls(&mut ctx).await.unwrap();
        assert_eq!(urls, vec!["https://missav.ws/search/010101-123-U"]);
    }

    #[tokio::test]
    async fn censored_numbers_go_direct_with_cn_suffix() {
        let crawler = crawler();
        let mut ctx = Context::new(CrawlerInput::from_number("SNOS-004"));
        let urls = crawler.generate_search_urls(&mut ctx).await.unwrap();
        assert_eq!(urls, vec!["https://missav.ws/SNOS-004/cn"]);
    }

    const SOFT_404: &str = r#"<html><head>
        <meta property="og:title" content="MissAV | 免費高清AV在線看" />
        <meta property="og:image" content="https://missav.ws/missav/logo-square.png" />
        <title>MissAV | 免費高清AV在線看</title>
      </head><body><p>404</p><h1>找不到頁面</h1></body></html>"#;

    const NORMAL_DETAIL: &str = r#"<html><head>
        <meta property="og:title" content="SNOS-004 絶頂快感 - MissAV" />
        <meta property="og:image" content="https://fourhoi.com/snos-004/cover-n.jpg" />
        <meta property="og:url" content="https://missav.ws/snos-004" />
        <title>SNOS-004 絶頂快感</title>
      </head><body>
        <h1>SNOS-004 絶頂快感</h1>
        <div class="text-secondary"><span>番號:</span> <span class="font-medium">SNOS-004</span></div>
        <div class="text-secondary"><span>發行日期:</span> <time>2024-01-01</time></div>
        <div class="text-secondary"><span>時長:</span> <span class="font-medium">7200</span></div>
        <div class="text-secondary"><span>女優:</span> <a href="/a">桜木こころ</a></div>
        <div class="text-secondary"><span>類型:</span> <a href="/genres/1">中出</a><a href="/genres/2">單體作品</a></div>
      </body></html>"#;

    #[test]
    fn soft_404_detection() {
        assert!(MissavCrawler::is_soft_404_page(SOFT_404));
        assert!(!MissavCrawler::is_soft_404_page(NORMAL_DETAIL));
    }

    #[tokio::test]
    async fn soft_404_pages_are_never_parsed() {
        let crawler = crawler();
        let mut ctx = Context::new(CrawlerInput::from_number("SNOS-004"));
        let err = crawler
            .parse_detail_page(&mut ctx, SOFT_404, "https://missav.ws/snos-004/cn")
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlerError::SoftNotFound(_)));
    }

    #[tokio::test]
    async fn detail_parse_extracts_rows_and_converts_seconds() {
        let crawler = crawler();
        let mut ctx = Context::new(CrawlerInput::from_number("SNOS-004"));
        let data = crawler
            .parse_detail_page(&mut ctx, NORMAL_DETAIL, "https://missav.ws/snos-004/cn")
            .await
            .unwrap();
        assert_eq!(data.number, "SNOS-004");
        assert_eq!(data.release, "2024-01-01");
        assert_eq!(data.year, "2024");
        assert_eq!(data.runtime, "120");
        assert_eq!(data.actors, vec!["桜木こころ"]);
        assert_eq!(data.tags, vec!["中出", "單體作品"]);
        assert_eq!(data.thumb, "https://fourhoi.com/snos-004/cover-n.jpg");
    }

    #[tokio::test]
    async fn mismatched_detail_number_is_rejected() {
        let crawler = crawler();
        let mut ctx = Context::new(CrawlerInput::from_number("MIDV-100"));
        let err = crawler
            .parse_detail_page(&mut ctx, NORMAL_DETAIL, "https://missav.ws/snos-004/cn")
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlerError::NumberMismatch { .. }));
    }

    #[test]
    fn search_result_extraction_prefers_expected_keyword() {
        let crawler = crawler();
        let html = r#"<html><body>
          <a href="/genres/uncensored">genre</a>
          <a href="/010101-999">other</a>
          <a href="/010101-123-U">hit</a>
        </body></html>"#;
        let url = crawler.first_detail_url_from_search(html, "010101-123");
        assert_eq!(url, "https://missav.ws/010101-123-U/cn");
    }

    #[test]
    fn generic_outline_is_suppressed() {
        assert!(MissavCrawler::is_generic_outline(
            "免費高清日本av在線看，無需下載。"
        ));
        assert!(!MissavCrawler::is_generic_outline("真面目な作品紹介です。"))
    }

    #[test]
    fn number_case_normalization_uppercases_letter_runs() {
        assert_eq!(MissavCrawler::normalize_number_case("snos-004"), "SNOS-004");
        assert_eq!(
            MissavCrawler::normalize_number_case("fc2-ppv-1234"),
            "FC2-PPV-1234"
        );
    }
}
