//! AVBase crawler.
//!
//! Detail pages ship a Next.js `__NEXT_DATA__` JSON island; the work entry
//! aggregates products from several storefronts, so the parser scores the
//! products and reads each field from the best one. DMM-hosted covers are
//! probed for the AWS mirror, and SOD covers fall back to crop mode when
//! the packaged poster is too small.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::client::AvWebClient;
use crate::config::{Config, Website};
use crate::media;
use crate::types::{CrawlerData, ImageCut};

use super::parse::sel;
use super::{Context, CrawlerError, SiteCrawler};

const DEFAULT_BASE_URL: &str = "https://www.avbase.net";

static NEXT_DATA: Lazy<Selector> = Lazy::new(|| sel(r#"script[id="__NEXT_DATA__"]"#));
static WORK_LINKS: Lazy<Selector> = Lazy::new(|| sel(r#"a[href^="/works/"]"#));
static ENGLISH_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[A-Za-z]{3}\s+([A-Za-z]{3})\s+(\d{1,2})\s+(\d{4})").unwrap());
static NAME_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,，、/／|]").unwrap());

pub struct AvbaseCrawler {
    client: Arc<AvWebClient>,
    base_url: String,
    sod_size_ratio: f64,
}

impl AvbaseCrawler {
    pub fn new(client: Arc<AvWebClient>, base_url: String, config: &Config) -> Self {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url.trim_end_matches('/').to_string()
        };
        Self {
            client,
            base_url,
            sod_size_ratio: config.sod_size_ratio,
        }
    }

    fn absolutize(&self, href: &str) -> String {
        if href.is_empty() || href.starts_with("http") {
            return href.to_string();
        }
        format!("{}{}", self.base_url, href)
    }

    // Product selection ----------------------------------------------------

    fn product_score(product: &Value) -> i64 {
        let mut score = 0;
        let source = product
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        if source.contains("dmm.co.jp") || source.contains("fanza") {
            score += 20;
        }
        if product
            .get("image_url")
            .and_then(Value::as_str)
            .is_some_and(|url| !url.is_empty())
        {
            score += 5;
        }
        if product
            .get("iteminfo")
            .and_then(|info| info.get("volume"))
            .and_then(Value::as_str)
            .is_some_and(|volume| !volume.is_empty())
        {
            score += 2;
        }
        score += product
            .get("sample_image_urls")
            .and_then(Value::as_array)
            .map(|urls| urls.len() as i64)
            .unwrap_or(0);
        score
    }

    fn pick_product<'a>(products: &[&'a Value]) -> Option<&'a Value> {
        products
            .iter()
            .max_by_key(|product| Self::product_score(product))
            .copied()
    }

    fn description_of(product: &Value) -> String {
        product
            .get("iteminfo")
            .and_then(|info| info.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    fn best_description(products: &[&Value]) -> String {
        let described: Vec<&Value> = products
            .iter()
            .copied()
            .filter(|product| !Self::description_of(product).is_empty())
            .collect();
        Self::pick_product(&described)
            .map(Self::description_of)
            .unwrap_or_default()
    }

    fn sample_image_urls(&self, product: &Value) -> Vec<String> {
        let mut images = Vec::new();
        let Some(items) = product.get("sample_image_urls").and_then(Value::as_array) else {
            return images;
        };
        for item in items {
            let url = match item {
                Value::String(s) => s.trim().to_string(),
                Value::Object(map) => map
                    .get("l")
                    .or_else(|| map.get("s"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                _ => String::new(),
            };
            if url.is_empty() {
                continue;
            }
            let absolute = self.absolutize(&url);
            if !images.contains(&absolute) {
                images.push(absolute);
            }
        }
        images
    }

    /// Stills can come from a different product than the main pick: take
    /// the richest sample set, preferring the picked product on ties.
    fn collect_extrafanart(&self, products: &[&Value], preferred: Option<&Value>) -> Vec<String> {
        let mut best: Vec<String> = Vec::new();
        let mut best_key = (0usize, 0i64, 0i64);
        for product in products {
            let images = self.sample_image_urls(product);
            if images.is_empty() {
                continue;
            }
            let is_preferred = preferred.is_some_and(|p| std::ptr::eq(*product, p));
            let key = (
                images.len(),
                is_preferred as i64,
                Self::product_score(product),
            );
            if key > best_key {
                best_key = key;
                best = images;
            }
        }
        best
    }

    // Field extraction -----------------------------------------------------

    fn nested_name(product: &Value, field: &str) -> String {
        product
            .get(field)
            .and_then(|value| value.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    fn actor_names(casts: &Value) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(items) = casts.as_array() {
            for item in items {
                let name = item
                    .get("actor")
                    .and_then(|actor| actor.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                if !name.is_empty() && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    fn tag_names(work: &Value) -> Vec<String> {
        let mut names = Vec::new();
        for key in ["genres", "tags"] {
            if let Some(items) = work.get(key).and_then(Value::as_array) {
                for item in items {
                    let name = item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .trim()
                        .to_string();
                    if !name.is_empty() && !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        names
    }

    fn split_names(raw: &str) -> Vec<String> {
        NAME_SEPARATORS
            .split(raw)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// ISO and English-month (`Sat Mar 15 2024`) release forms.
    pub fn parse_release_date(raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        let normalized = super::parse::normalize_release(trimmed);
        if normalized != trimmed {
            return normalized;
        }
        if let Some(caps) = ENGLISH_DATE.captures(trimmed) {
            let month = match caps[1].to_lowercase().as_str() {
                "jan" => 1,
                "feb" => 2,
                "mar" => 3,
                "apr" => 4,
                "may" => 5,
                "jun" => 6,
                "jul" => 7,
                "aug" => 8,
                "sep" => 9,
                "oct" => 10,
                "nov" => 11,
                "dec" => 12,
                _ => 0,
            };
            if month > 0 {
                let day: u32 = caps[2].parse().unwrap_or(0);
                return format!("{}-{month:02}-{day:02}", &caps[3]);
            }
        }
        trimmed.to_string()
    }

    fn parse_runtime(raw: &str) -> String {
        super::parse::first_digits(raw.trim())
            .map(str::to_string)
            .unwrap_or_else(|| raw.trim().to_string())
    }

    fn poster_from_thumb(thumb: &str) -> String {
        if thumb.ends_with("pl.jpg") {
            format!("{}ps.jpg", &thumb[..thumb.len() - 6])
        } else {
            thumb.to_string()
        }
    }

    /// DMM-style covers share a URL stem: normalize both to `pl`/`ps`.
    fn normalize_thumb_poster(thumb: &str, poster: &str) -> (String, String) {
        for candidate in [thumb, poster] {
            if let Some(stem) = candidate
                .strip_suffix("pl.jpg")
                .or_else(|| candidate.strip_suffix("ps.jpg"))
            {
                return (format!("{stem}pl.jpg"), format!("{stem}ps.jpg"));
            }
        }
        match (thumb.is_empty(), poster.is_empty()) {
            (false, true) => (thumb.to_string(), thumb.to_string()),
            (true, false) => (poster.to_string(), poster.to_string()),
            _ => (thumb.to_string(), poster.to_string()),
        }
    }

    pub fn parse_next_data(&self, html: &str, input_number: &str) -> Result<CrawlerData, CrawlerError> {
        let island = {
            let doc = Html::parse_document(html);
            doc.select(&NEXT_DATA)
                .next()
                .map(|el| el.text().collect::<String>())
                .unwrap_or_default()
        };
        if island.is_empty() {
            return Err(CrawlerError::Parse("avbase detail missing __NEXT_DATA__".into()));
        }
        let next_data: Value = serde_json::from_str(&island)
            .map_err(|err| CrawlerError::Parse(format!("__NEXT_DATA__ decode: {err}")))?;
        let work = next_data
            .pointer("/props/pageProps/work")
            .ok_or_else(|| CrawlerError::Parse("avbase __NEXT_DATA__ missing work".into()))?;

        let product_values: Vec<&Value> = work
            .get("products")
            .and_then(Value::as_array)
            .map(|products| products.iter().filter(|p| p.is_object()).collect())
            .unwrap_or_default();
        let product = Self::pick_product(&product_values);
        let null = Value::Null;
        let product_or_empty = product.unwrap_or(&null);

        let mut data = CrawlerData::default();
        data.number = work
            .get("work_id")
            .and_then(Value::as_str)
            .unwrap_or(input_number)
            .trim()
            .to_string();

        let prefix = work
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        data.external_id = if prefix.is_empty() || data.number.is_empty() {
            data.number.clone()
        } else {
            format!("{prefix}:{}", data.number)
        };

        data.title = work
            .get("title")
            .and_then(Value::as_str)
            .or_else(|| product_or_empty.get("title").and_then(Value::as_str))
            .unwrap_or_default()
            .trim()
            .to_string();
        data.originaltitle = data.title.clone();

        data.outline = {
            let note = work
                .get("note")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            if !note.is_empty() {
                note
            } else {
                let direct = Self::description_of(product_or_empty);
                if direct.is_empty() {
                    Self::best_description(&product_values)
                } else {
                    direct
                }
            }
        };
        data.originalplot = data.outline.clone();

        data.actors = Self::actor_names(work.get("casts").unwrap_or(&Value::Null));
        data.all_actors = data.actors.clone();
        data.directors = Self::split_names(
            product_or_empty
                .pointer("/iteminfo/director")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );
        data.tags = Self::tag_names(work);

        let raw_release = product_or_empty
            .get("date")
            .and_then(Value::as_str)
            .or_else(|| work.get("min_date").and_then(Value::as_str))
            .unwrap_or_default();
        data.release = Self::parse_release_date(raw_release);
        data.runtime = Self::parse_runtime(
            product_or_empty
                .pointer("/iteminfo/volume")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );

        data.studio = Self::nested_name(product_or_empty, "maker");
        data.publisher = {
            let label = Self::nested_name(product_or_empty, "label");
            if label.is_empty() {
                data.studio.clone()
            } else {
                label
            }
        };
        data.series = Self::nested_name(product_or_empty, "series");

        data.thumb = self.absolutize(
            product_or_empty
                .get("image_url")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );
        data.poster = Self::poster_from_thumb(&data.thumb);
        data.extrafanart = self.collect_extrafanart(&product_values, product);
        data.trailer = self.absolutize(
            product_or_empty
                .get("trailer_url")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );

        data.image_cut = ImageCut::Right;
        data.image_download = false;
        Ok(data)
    }

    /// Probe the AWS mirror for a `pics.dmm.co.jp` image and adopt it when
    /// it validates.
    async fn upgrade_dmm_image(&self, ctx: &mut Context, image_url: &str) -> String {
        if image_url.is_empty() || !image_url.contains("pics.dmm.co.jp") {
            return image_url.to_string();
        }
        let aws_url = image_url
            .replace("pics.dmm.co.jp", "awsimgsrc.dmm.co.jp/pics_dig")
            .replace("/adult/", "/");
        if media::probe_image(&self.client, &aws_url).await.is_some() {
            ctx.debug(format!("avbase cover upgraded to aws mirror: {aws_url}"));
            return aws_url;
        }
        image_url.to_string()
    }
}

#[async_trait]
impl SiteCrawler for AvbaseCrawler {
    fn site(&self) -> Website {
        Website::Avbase
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    fn client(&self) -> &Arc<AvWebClient> {
        &self.client
    }

    async fn generate_search_urls(&self, ctx: &mut Context) -> Result<Vec<String>, CrawlerError> {
        let number = ctx.input.number.trim();
        if number.is_empty() {
            return Err(CrawlerError::NumberEmpty);
        }
        Ok(vec![format!(
            "{}/works?q={}",
            self.base_url,
            urlencoding::encode(number)
        )])
    }

    async fn parse_search_page(
        &self,
        ctx: &mut Context,
        html: &str,
        _search_url: &str,
    ) -> Result<Vec<String>, CrawlerError> {
        let href = {
            let doc = Html::parse_document(html);
            doc.select(&WORK_LINKS)
                .filter_map(|anchor| anchor.value().attr("href"))
                .find(|href| !href.starts_with("/works/date"))
                .map(str::to_string)
        };
        match href {
            Some(href) => {
                let detail_url = self.absolutize(&href);
                ctx.debug(format!("avbase first work link: {detail_url}"));
                Ok(vec![detail_url])
            }
            None => Ok(Vec::new()),
        }
    }

    async fn parse_detail_page(
        &self,
        ctx: &mut Context,
        html: &str,
        _detail_url: &str,
    ) -> Result<CrawlerData, CrawlerError> {
        let data = self.parse_next_data(html, &ctx.input.number)?;
        ctx.debug(format!("avbase parsed {}", data.number));
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
        if data.originaltitle.is_empty() {
            data.originaltitle = data.title.clone();
        }
        if data.originalplot.is_empty() {
            data.originalplot = data.outline.clone();
        }

        let (thumb, poster) = Self::normalize_thumb_poster(&data.thumb, &data.poster);
        data.thumb = thumb;
        data.poster = poster;

        let upgraded = self.upgrade_dmm_image(ctx, &data.thumb).await;
        if upgraded != data.thumb {
            data.thumb = upgraded;
            let (thumb, poster) = Self::normalize_thumb_poster(&data.thumb, &data.poster);
            data.thumb = thumb;
            data.poster = poster;
        }

        let studio_upper = data.studio.to_uppercase();
        let title_upper = data.title.to_uppercase();
        let is_sod = studio_upper.contains("SOD");
        let is_vr = title_upper.contains("VR");
        data.image_download = is_vr || is_sod;

        // Small SOD posters crop better than they download.
        if is_sod && !data.poster.is_empty() && !data.thumb.is_empty() {
            let poster_size = media::content_length(&self.client, &data.poster).await;
            let thumb_size = media::content_length(&self.client, &data.thumb).await;
            if let (Some(poster_size), Some(thumb_size)) = (poster_size, thumb_size) {
                if (poster_size as f64) < (thumb_size as f64) * self.sod_size_ratio {
                    data.image_download = is_vr;
                    data.image_cut = ImageCut::Right;
                    ctx.debug(format!(
                        "avbase sod cover: ps={poster_size}B pl={thumb_size}B, crop mode"
                    ));
                }
            }
        }

        if data.publisher.is_empty() {
            data.publisher = data.studio.clone();
        }
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
