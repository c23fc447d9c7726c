//! JavBus crawler.
//!
//! Classic server-rendered detail pages addressed directly by catalog
//! number. The info block is a label/value list; DVD entries frequently
//! carry the `0000-00-00` release placeholder, which must surface as an
//! empty release (and an empty year).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};

use crate::client::AvWebClient;
use crate::config::Website;
use crate::types::{CrawlerData, EMPTY_RELEASE};

use super::parse::{
    all_attrs, all_texts, element_text, first_attr, first_text, normalize_label,
    normalize_release, sel,
};
use super::{Context, CrawlerError, SiteCrawler};

const DEFAULT_BASE_URL: &str = "https://www.javbus.com";

static TITLE: Lazy<Selector> = Lazy::new(|| sel("div.container h3"));
static INFO_ROWS: Lazy<Selector> = Lazy::new(|| sel("div.container div.info p"));
static HEADER_SPAN: Lazy<Selector> = Lazy::new(|| sel("span.header"));
static GENRE_LINKS: Lazy<Selector> = Lazy::new(|| sel("div.info p.genre a"));
static STAR_NAMES: Lazy<Selector> = Lazy::new(|| sel("div.star-name a"));
static COVER: Lazy<Selector> = Lazy::new(|| sel("a.bigImage img"));
static SAMPLES: Lazy<Selector> = Lazy::new(|| sel("#sample-waterfall a.sample-box"));

/// Empty-date placeholders map to no release at all.
pub fn valid_release(raw: &str) -> String {
    let normalized = normalize_release(raw);
    if normalized == EMPTY_RELEASE {
        return String::new();
    }
    normalized
}

pub fn year_of(release: &str) -> String {
    let valid = valid_release(release);
    if valid.len() >= 4 {
        valid[..4].to_string()
    } else {
        String::new()
    }
}

pub struct JavbusCrawler {
    client: Arc<AvWebClient>,
    base_url: String,
}

impl JavbusCrawler {
    pub fn new(client: Arc<AvWebClient>, base_url: String) -> Self {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url.trim_end_matches('/').to_string()
        };
        Self { client, base_url }
    }

    fn parse_detail(html: &str, detail_url: &str, input_number: &str) -> Result<CrawlerData, CrawlerError> {
        let doc = Html::parse_document(html);
        let mut data = CrawlerData::default();

        let heading = first_text(&doc, &TITLE);
        if heading.is_empty() {
            return Err(CrawlerError::Parse(format!(
                "javbus detail missing title heading: {detail_url}"
            )));
        }

        // Info rows: `<span class="header">識別碼:</span> value`.
        let mut info: HashMap<String, String> = HashMap::new();
        for row in doc.select(&INFO_ROWS) {
            let Some(header) = row.select(&HEADER_SPAN).next() else {
                continue;
            };
            let label = normalize_label(&element_text(&header));
            if label.is_empty() {
                continue;
            }
            let full = element_text(&row);
            let value = full
                .strip_prefix(&element_text(&header))
                .unwrap_or(&full)
                .trim()
                .to_string();
            info.entry(label).or_insert(value);
        }

        let lookup = |labels: &[&str]| -> String {
            labels
                .iter()
                .find_map(|label| info.get(&normalize_label(label)))
                .cloned()
                .unwrap_or_default()
        };

        data.number = lookup(&["識別碼", "识别码", "id"]);
        if data.number.is_empty() {
            data.number = input_number.to_string();
        }

        // Headings read `NUMBER title`; strip the number prefix.
        data.title = heading
            .strip_prefix(data.number.as_str())
            .map(str::trim)
            .unwrap_or(heading.as_str())
            .to_string();
        data.originaltitle = data.title.clone();

        let release_raw = lookup(&["發行日期", "发行日期", "release date"]);
        data.release = valid_release(&release_raw);
        data.year = year_of(&release_raw);

        let runtime_raw = lookup(&["長度", "长度", "length"]);
        if let Some(digits) = super::parse::first_digits(&runtime_raw) {
            data.runtime = digits.to_string();
        }

        data.directors = lookup(&["導演", "导演", "director"])
            .split_whitespace()
            .map(str::to_string)
            .collect();
        data.studio = lookup(&["製作商", "制作商", "studio"]);
        data.publisher = lookup(&["發行商", "发行商", "label"]);
        data.series = lookup(&["系列", "series"]);

        data.tags = all_texts(&doc, &GENRE_LINKS);
        data.actors = all_texts(&doc, &STAR_NAMES);
        data.all_actors = data.actors.clone();

        data.thumb = absolutize(&first_attr(&doc, &COVER, "src"), detail_url);
        data.extrafanart = all_attrs(&doc, &SAMPLES, "href")
            .into_iter()
            .map(|href| absolutize(&href, detail_url))
            .collect();

        data.external_id = data.number.clone();
        Ok(data)
    }
}

fn absolutize(href: &str, page_url: &str) -> String {
    if href.is_empty() || href.starts_with("http") {
        return href.to_string();
    }
    url::Url::parse(page_url)
        .and_then(|base| base.join(href))
        .map(|joined| joined.to_string())
        .unwrap_or_else(|_| href.to_string())
}

#[async_trait]
impl SiteCrawler for JavbusCrawler {
    fn site(&self) -> Website {
        Website::Javbus
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    fn client(&self) -> &Arc<AvWebClient> {
        &self.client
    }

    fn cookies(&self, _ctx: &Context) -> HashMap<String, String> {
        HashMap::from([("existmag".to_string(), "all".to_string())])
    }

    async fn generate_search_urls(&self, ctx: &mut Context) -> Result<Vec<String>, CrawlerError> {
        let number = ctx.input.number.trim();
        if number.is_empty() {
            return Err(CrawlerError::NumberEmpty);
        }
        // Detail pages are addressed by number directly.
        Ok(vec![format!("{}/{}", self.base_url, number)])
    }

    /// Detail pages are addressed directly; there is no search page.
    async fn search(
        &self,
        _ctx: &mut Context,
        search_urls: Vec<String>,
    ) -> Result<Vec<String>, CrawlerError> {
        Ok(search_urls)
    }

    async fn parse_search_page(
        &self,
        _ctx: &mut Context,
        _html: &str,
        search_url: &str,
    ) -> Result<Vec<String>, CrawlerError> {
        Ok(vec![search_url.to_string()])
    }

    async fn parse_detail_page(
        &self,
        ctx: &mut Context,
        html: &str,
        detail_url: &str,
    ) -> Result<CrawlerData, CrawlerError> {
        let data = Self::parse_detail(html, detail_url, &ctx.input.number)?;
        ctx.debug(format!("javbus parsed {}", data.number));
        Ok(data)
    }

    async fn post_process(
        &self,
        ctx: &mut Context,
        mut data: CrawlerData,
    ) -> Result<CrawlerData, CrawlerError> {
        if data.number.is_empty() {
            data.number = ctx.input.number.clone();
        }
        if data.originalplot.is_empty() {
            data.originalplot = data.outline.clone();
        }
        if data.poster.is_empty() && !data.thumb.is_empty() {
            data.poster = data.thumb.clone();
            data.image_download = false;
        }
        if data.publisher.is_empty() {
            data.publisher = data.studio.clone();
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail_html(release: &str) -> String {
        format!(
            r#"<html><body><div class="container">
              <h3>ABC-123 タイトルのテスト</h3>
              <div class="info">
                <p><span class="header">識別碼:</span> ABC-123</p>
                <p><span class="header">發行日期:</span> {release}</p>
                <p><span class="header">長度:</span> 120分鐘</p>
                <p><span class="header">製作商:</span> テスト制作</p>
                <p class="genre"><a href="/genre/1">中出</a><a href="/genre/2">単体作品</a></p>
              </div>
              <div class="star-name"><a href="/star/x">花咲いあん</a></div>
              <a class="bigImage" href="/pics/cover/abc123_b.jpg"><img src="/pics/cover/abc123_b.jpg"/></a>
            </div></body></html>"#
        )
    }

    #[test]
    fn valid_release_normalizes_and_rejects_placeholder() {
        assert_eq!(valid_release("2024-1-2"), "2024-01-02");
        assert_eq!(year_of("2024-1-2"), "2024");
        assert_eq!(valid_release("0000-00-00"), "");
        assert_eq!(year_of("0000-00-00"), "");
    }

    #[test]
    fn parses_detail_fields() {
        let html = detail_html("2024-01-02");
        let data = JavbusCrawler::parse_detail(&html, "https://www.javbus.com/ABC-123", "ABC-123")
            .unwrap();
        assert_eq!(data.number, "ABC-123");
        assert_eq!(data.title, "タイトルのテスト");
        assert_eq!(data.release, "2024-01-02");
        assert_eq!(data.year, "2024");
        assert_eq!(data.runtime, "120");
        assert_eq!(data.studio, "テスト制作");
        assert_eq!(data.tags, vec!["中出", "単体作品"]);
        assert_eq!(data.actors, vec!["花咲いあん"]);
        assert!(data.thumb.ends_with("/pics/cover/abc123_b.jpg"));
    }

    #[test]
    fn placeholder_release_yields_empty_release_and_year() {
        let html = detail_html("0000-00-00");
        let data = JavbusCrawler::parse_detail(&html, "https://www.javbus.com/ABC-123", "ABC-123")
            .unwrap();
        assert_eq!(data.release, "");
        assert_eq!(data.year, "");
    }
}
