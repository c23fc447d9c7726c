//! MGStage crawler.
//!
//! MGStage catalogs prefixed numbers verbatim (`200GANA-3327`), so the
//! crawler always works from the full input number even when other sites
//! prefer the stripped short form. Pages sit behind an age-check cookie.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};

use crate::client::AvWebClient;
use crate::config::Website;
use crate::types::CrawlerData;

use super::parse::{
    all_attrs, element_text, first_attr, first_text, normalize_label, normalize_release, sel,
    split_names,
};
use super::{Context, CrawlerError, SiteCrawler};

const DEFAULT_BASE_URL: &str = "https://www.mgstage.com";

static TITLE: Lazy<Selector> = Lazy::new(|| sel("h1.tag"));
static DETAIL_ROWS: Lazy<Selector> = Lazy::new(|| sel("div.detail_data table tr"));
static ROW_TH: Lazy<Selector> = Lazy::new(|| sel("th"));
static ROW_TD: Lazy<Selector> = Lazy::new(|| sel("td"));
static ROW_LINKS: Lazy<Selector> = Lazy::new(|| sel("td a"));
static COVER_LINK: Lazy<Selector> = Lazy::new(|| sel("#EnlargeImage"));
static SAMPLE_IMAGES: Lazy<Selector> = Lazy::new(|| sel("#sample-photo a.sample_image"));
static OUTLINE: Lazy<Selector> = Lazy::new(|| sel("#introduction p.introduction"));
static SEARCH_RESULTS: Lazy<Selector> = Lazy::new(|| sel("div.search_list ul li h5 a"));

pub struct MgstageCrawler {
    client: Arc<AvWebClient>,
    base_url: String,
}

impl MgstageCrawler {
    pub fn new(client: Arc<AvWebClient>, base_url: String) -> Self {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url.trim_end_matches('/').to_string()
        };
        Self { client, base_url }
    }

    fn detail_url(&self, number: &str) -> String {
        format!(
            "{}/product/product_detail/{}/",
            self.base_url,
            number.trim().to_uppercase()
        )
    }

    fn parse_search(&self, html: &str, wanted_number: &str) -> Vec<String> {
        let doc = Html::parse_document(html);
        let wanted = wanted_number.to_uppercase();
        let mut matches = Vec::new();
        for anchor in doc.select(&SEARCH_RESULTS) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            if href.to_uppercase().contains(&wanted) {
                matches.push(format!("{}{}", self.base_url, href));
            }
        }
        matches
    }

    fn parse_detail(html: &str, input_number: &str) -> Result<CrawlerData, CrawlerError> {
        let doc = Html::parse_document(html);
        let mut data = CrawlerData::default();

        data.title = first_text(&doc, &TITLE);
        if data.title.is_empty() {
            return Err(CrawlerError::Parse("mgstage detail missing title".into()));
        }
        data.originaltitle = data.title.clone();

        let mut info: HashMap<String, (String, Vec<String>)> = HashMap::new();
        for row in doc.select(&DETAIL_ROWS) {
            let Some(th) = row.select(&ROW_TH).next() else {
                continue;
            };
            let Some(td) = row.select(&ROW_TD).next() else {
                continue;
            };
            let label = normalize_label(&element_text(&th));
            let value = element_text(&td);
            let links: Vec<String> = row
                .select(&ROW_LINKS)
                .map(|a| element_text(&a))
                .filter(|text| !text.is_empty())
                .collect();
            info.entry(label).or_insert((value, links));
        }

        let lookup = |labels: &[&str]| -> (String, Vec<String>) {
            labels
                .iter()
                .find_map(|label| info.get(&normalize_label(label)))
                .cloned()
                .unwrap_or_default()
        };

        let (number_value, _) = lookup(&["品番"]);
        data.number = if number_value.is_empty() {
            input_number.to_string()
        } else {
            number_value.to_uppercase()
        };

        let (actors_value, actor_links) = lookup(&["出演"]);
        data.actors = if actor_links.is_empty() {
            split_names(&actors_value)
        } else {
            actor_links
        };
        data.all_actors = data.actors.clone();

        let (runtime_value, _) = lookup(&["収録時間"]);
        if let Some(digits) = super::parse::first_digits(&runtime_value) {
            data.runtime = digits.to_string();
        }

        let (release_value, _) = lookup(&["配信開始日", "商品発売日"]);
        data.release = normalize_release(&release_value);
        if let Some(head) = data.release.get(..4) {
            if head.bytes().all(|b| b.is_ascii_digit()) {
                data.year = head.to_string();
            }
        }

        let (series_value, series_links) = lookup(&["シリーズ"]);
        data.series = series_links.first().cloned().unwrap_or(series_value);

        let (label_value, label_links) = lookup(&["レーベル"]);
        data.publisher = label_links.first().cloned().unwrap_or(label_value);

        let (maker_value, maker_links) = lookup(&["メーカー"]);
        data.studio = maker_links.first().cloned().unwrap_or(maker_value);

        let (tags_value, tag_links) = lookup(&["ジャンル"]);
        data.tags = if tag_links.is_empty() {
            split_names(&tags_value)
        } else {
            tag_links
        };

        data.outline = first_text(&doc, &OUTLINE);
        data.originalplot = data.outline.clone();

        data.thumb = first_attr(&doc, &COVER_LINK, "href");
        // MGStage serves the poster as the `pf_` variant of the `pb_` cover.
        data.poster = data.thumb.replace("/pb_", "/pf_");
        data.extrafanart = all_attrs(&doc, &SAMPLE_IMAGES, "href");
        data.image_download = true;
        data.external_id = data.number.clone();
        Ok(data)
    }
}

#[async_trait]
impl SiteCrawler for MgstageCrawler {
    fn site(&self) -> Website {
        Website::Mgstage
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    fn client(&self) -> &Arc<AvWebClient> {
        &self.client
    }

    fn cookies(&self, _ctx: &Context) -> HashMap<String, String> {
        // Age gate.
        HashMap::from([("adc".to_string(), "1".to_string())])
    }

    async fn generate_search_urls(&self, ctx: &mut Context) -> Result<Vec<String>, CrawlerError> {
        let number = ctx.input.number.trim().to_string();
        if number.is_empty() {
            return Err(CrawlerError::NumberEmpty);
        }
        // Direct detail first; the site search catches renamed entries.
        Ok(vec![
            self.detail_url(&number),
            format!(
                "{}/search/cSearch.php?search_word={}",
                self.base_url,
                urlencoding::encode(&number)
            ),
        ])
    }

    async fn parse_search_page(
        &self,
        ctx: &mut Context,
        html: &str,
        search_url: &str,
    ) -> Result<Vec<String>, CrawlerError> {
        if search_url.contains("/search/") {
            let matches = self.parse_search(html, &ctx.input.number);
            if matches.is_empty() {
                ctx.debug(format!("mgstage search empty: {search_url}"));
            }
            return Ok(matches);
        }
        Ok(vec![search_url.to_string()])
    }

    async fn parse_detail_page(
        &self,
        ctx: &mut Context,
        html: &str,
        _detail_url: &str,
    ) -> Result<CrawlerData, CrawlerError> {
        Self::parse_detail(html, &ctx.input.number)
    }

    async fn post_process(
        &self,
        ctx: &mut Context,
        mut data: CrawlerData,
    ) -> Result<CrawlerData, CrawlerError> {
        if data.number.is_empty() {
            data.number = ctx.input.number.clone();
        }
        if data.publisher.is_empty() {
            data.publisher = data.studio.clone();
        }
        if data.poster.is_empty() {
            data.poster = data.thumb.clone();
        }
        Ok(data)
    }
}
