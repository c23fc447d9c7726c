//! DMM / Fanza crawler.
//!
//! One catalog number can exist as several storefront variants (digital
//! streaming, physical DVD, rental, subscription TV); the search page is
//! filtered against both padded digit forms, the matching detail URLs are
//! fetched concurrently, and the variants merge under category priority.
//! The digital category is JS-rendered and opts into the headless browser.

pub mod parsers;
pub mod tv;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::client::{AvWebClient, RequestOptions};
use crate::config::{Config, Website};
use crate::engine::merge::update_valid;
use crate::gather::GatherGroup;
use crate::media;
use crate::types::{CrawlerData, CrawlerInput};

use super::browser::{BrowserFetcher, PageCookie};
use super::{Context, CrawlerError, SiteCrawler};

use parsers::{
    build_fanza_fallback_candidates, build_fanza_trailer_url, cid_from_url, extract_inline_trailer,
    extract_player_candidates, extract_player_url, parse_category, parse_product_page, Category,
};

const SCRATCH_NUMBER_00: &str = "number_00";
const SCRATCH_NUMBER_NO_00: &str = "number_no_00";

static SEARCH_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]+-?(\d+)").unwrap());
static NUMBER_PARTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d*[a-z]+)?-?(\d+)").unwrap());
static DETAIL_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"detailUrl\\":\\"(.*?)\\""#).unwrap());
static NOT_FOUND_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<span[^>]*class="[^"]*d-txten[^"]*"[^>]*>[^<]*404 Not Found"#).unwrap());
static UNICODE_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\u([0-9a-fA-F]{4})").unwrap());
static FANZA_TV_CID: Lazy<Regex> = Lazy::new(|| Regex::new(r"content=([^&/]+)").unwrap());
static DMM_TV_SEASON: Lazy<Regex> = Lazy::new(|| Regex::new(r"season(?:Id)?=(\d+)").unwrap());

fn unescape_search_url(url: &str) -> String {
    let unescaped = UNICODE_ESCAPE.replace_all(url, |caps: &regex::Captures<'_>| {
        u32::from_str_radix(&caps[1], 16)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });
    unescaped.replace("\\/", "/")
}

pub struct DmmCrawler {
    client: Arc<AvWebClient>,
    browser: Option<Arc<BrowserFetcher>>,
    sod_size_ratio: f64,
    detail_timeout: Duration,
}

impl DmmCrawler {
    pub fn new(
        client: Arc<AvWebClient>,
        browser: Option<Arc<BrowserFetcher>>,
        config: &Config,
    ) -> Self {
        Self {
            client,
            browser,
            sod_size_ratio: config.sod_size_ratio,
            detail_timeout: config.lookup_timeout(),
        }
    }

    fn age_cookies() -> HashMap<String, String> {
        HashMap::from([("age_check_done".to_string(), "1".to_string())])
    }

    /// Both padded digit forms for search filtering (`ssis00497` and
    /// `ssis497`).
    fn number_keys(number: &str) -> Option<(String, String)> {
        let caps = NUMBER_PARTS.captures(&number.to_lowercase())?;
        let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let digits = caps.get(2)?.as_str();
        Some((format!("{prefix}{digits:0>5}"), format!("{prefix}{digits}")))
    }

    async fn fetch_product(
        client: Arc<AvWebClient>,
        browser: Option<Arc<BrowserFetcher>>,
        category: Category,
        url: String,
    ) -> CrawlerData {
        let html = {
            let mut html = None;
            if category == Category::Digital {
                if let Some(browser) = &browser {
                    let cookies = vec![
                        PageCookie::new("age_check_done", "1", ".dmm.co.jp"),
                        PageCookie::new("age_check_done", "1", ".dmm.com"),
                    ];
                    match browser.fetch(&url, &cookies).await {
                        Ok(rendered) => html = Some(rendered),
                        Err(err) => {
                            log::debug!("dmm browser fetch failed, using http: {err}");
                        }
                    }
                }
            }
            match html {
                Some(html) => html,
                None => {
                    let opts = RequestOptions::default().with_cookies(Self::age_cookies());
                    match client.get_text(&url, opts).await {
                        Ok(html) => html,
                        Err(err) => {
                            log::debug!("dmm detail fetch failed: {url}: {err}");
                            return CrawlerData::default();
                        }
                    }
                }
            }
        };

        let mut data = parse_product_page(&html, category, &url);
        if category == Category::Digital {
            data.trailer = Self::discover_digital_trailer(&client, &html, &url).await;
        }
        data
    }

    /// Trailer discovery for digital pages: inline JSON-LD / GA event URL
    /// first, then the sample-player iframe, then fabricated freepv
    /// candidates probed from the top of the ladder.
    async fn discover_digital_trailer(client: &AvWebClient, html: &str, detail_url: &str) -> String {
        if let Some(inline) = extract_inline_trailer(html) {
            if !media::is_hls_playlist(&inline) {
                return inline;
            }
        }

        if let Some(player_url) = extract_player_url(html) {
            let opts = RequestOptions::default().with_cookies(Self::age_cookies());
            if let Ok(player_html) = client.get_text(&player_url, opts).await {
                let candidates = extract_player_candidates(&player_html);
                let best = media::pick_best_trailer("", &candidates);
                if !best.is_empty() {
                    return best;
                }
            }
        }

        if let Some(cid) = cid_from_url(detail_url) {
            for candidate in build_fanza_fallback_candidates("", &cid) {
                if media::probe_video(client, &candidate).await {
                    return candidate;
                }
            }
        }
        String::new()
    }

    async fn fetch_fanza_tv(client: Arc<AvWebClient>, detail_url: String) -> CrawlerData {
        let Some(cid) = FANZA_TV_CID
            .captures(&detail_url)
            .map(|caps| caps[1].to_string())
        else {
            log::debug!("no cid in fanza tv url: {detail_url}");
            return CrawlerData::default();
        };

        let opts = RequestOptions::default().with_json(tv::fanza_tv_payload(&cid));
        let response: tv::FanzaResponse = match client
            .post_json("https://api.tv.dmm.co.jp/graphql", opts)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                log::debug!("fanza tv api failed for {cid}: {err}");
                return CrawlerData::default();
            }
        };
        let content = response.data.fanza_tv_plus.content;

        let extrafanart: Vec<String> = content
            .sample_pictures
            .iter()
            .map(|picture| {
                if picture.image_large.is_empty() {
                    picture.image.clone()
                } else {
                    picture.image_large.clone()
                }
            })
            .filter(|url| !url.is_empty())
            .collect();

        let runtime = if content.play_info.duration > 0.0 {
            ((content.play_info.duration / 60.0) as u64).to_string()
        } else {
            String::new()
        };
        let score = if content.review_summary.average_point > 0.0 {
            content.review_summary.average_point.to_string()
        } else {
            String::new()
        };

        CrawlerData {
            title: content.title.clone(),
            originaltitle: content.title,
            outline: content.description.clone(),
            originalplot: content.description,
            release: content.start_delivery_at,
            tags: content.genres.into_iter().map(|g| g.name).collect(),
            runtime,
            actors: content.actresses.iter().map(|a| a.name.clone()).collect(),
            all_actors: content.actresses.into_iter().map(|a| a.name).collect(),
            poster: content.package_image,
            thumb: content.package_large_image,
            score,
            series: content.series.name,
            directors: content.directors.into_iter().map(|d| d.name).collect(),
            studio: content.maker.name,
            publisher: content.label.name,
            extrafanart,
            trailer: build_fanza_trailer_url(&content.sample_movie.url),
            external_id: detail_url,
            ..Default::default()
        }
    }

    async fn fetch_dmm_tv(client: Arc<AvWebClient>, detail_url: String) -> CrawlerData {
        let Some(season_id) = DMM_TV_SEASON
            .captures(&detail_url)
            .map(|caps| caps[1].to_string())
        else {
            log::debug!("no season id in dmm tv url: {detail_url}");
            return CrawlerData::default();
        };

        let opts = RequestOptions::default().with_json(tv::dmm_tv_payload(&season_id));
        let response: tv::DmmTvResponse = match client
            .post_json("https://api.tv.dmm.com/graphql", opts)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                log::debug!("dmm tv api failed for season {season_id}: {err}");
                return CrawlerData::default();
            }
        };
        let video = response.data.video;

        let studio = video
            .staffs
            .iter()
            .find(|staff| {
                matches!(
                    staff.role_name.as_str(),
                    "制作プロダクション" | "制作" | "制作著作"
                )
            })
            .map(|staff| staff.staff_name.clone())
            .unwrap_or_default();
        let directors: Vec<String> = video
            .staffs
            .iter()
            .filter(|staff| staff.role_name == "監督")
            .map(|staff| staff.staff_name.clone())
            .collect();

        let year = if video.production_year > 0 {
            video.production_year.to_string()
        } else {
            String::new()
        };
        let score = if video.review_summary.average_point > 0.0 {
            video.review_summary.average_point.to_string()
        } else {
            String::new()
        };

        CrawlerData {
            title: video.title_name.clone(),
            originaltitle: video.title_name,
            outline: video.description.clone(),
            originalplot: video.description,
            actors: video.casts.iter().map(|c| c.actor_name.clone()).collect(),
            all_actors: video.casts.into_iter().map(|c| c.actor_name).collect(),
            poster: video.package_image,
            thumb: video.key_visual_image,
            tags: video.genres.into_iter().map(|g| g.name).collect(),
            release: video.start_public_at,
            year,
            score,
            directors,
            publisher: studio.clone(),
            studio,
            external_id: detail_url,
            ..Default::default()
        }
    }
}

#[async_trait]
impl SiteCrawler for DmmCrawler {
    fn site(&self) -> Website {
        Website::Dmm
    }

    fn base_url(&self) -> String {
        // DMM URLs are not user-overridable.
        String::new()
    }

    fn client(&self) -> &Arc<AvWebClient> {
        &self.client
    }

    fn browser(&self) -> Option<&Arc<BrowserFetcher>> {
        self.browser.as_ref()
    }

    fn adapt_input(&self, input: &CrawlerInput) -> CrawlerInput {
        let mut adapted = input.clone();
        if !input.short_number.is_empty() {
            adapted.number = input.short_number.clone();
        }
        adapted
    }

    fn cookies(&self, _ctx: &Context) -> HashMap<String, String> {
        Self::age_cookies()
    }

    fn browser_cookies(&self, _ctx: &Context) -> Vec<PageCookie> {
        vec![
            PageCookie::new("age_check_done", "1", ".dmm.co.jp"),
            PageCookie::new("age_check_done", "1", ".dmm.com"),
        ]
    }

    fn wants_browser(&self, url: &str) -> bool {
        parse_category(url) == Category::Digital
    }

    async fn generate_search_urls(&self, ctx: &mut Context) -> Result<Vec<String>, CrawlerError> {
        let mut number = ctx.input.number.trim().to_lowercase();
        if number.is_empty() {
            return Err(CrawlerError::NumberEmpty);
        }

        if let Some(caps) = SEARCH_DIGITS.captures(&number) {
            let digits = caps[1].to_string();
            if digits.len() >= 5 && digits.starts_with("00") {
                number = number.replace(&digits, &digits[2..]);
            } else if digits.len() == 4 {
                // Four-digit numbers collide with the site's zero padding.
                number = number.replace('-', "0");
            }
        }

        let number_00 = number.replace('-', "00");
        let number_no_00 = number.replace('-', "");
        ctx.set_scratch(SCRATCH_NUMBER_00, &number_00);
        ctx.set_scratch(SCRATCH_NUMBER_NO_00, &number_no_00);

        Ok(vec![
            format!("https://www.dmm.co.jp/search/=/searchstr={number_00}/sort=ranking/"),
            format!("https://www.dmm.co.jp/search/=/searchstr={number_no_00}/sort=ranking/"),
            format!("https://www.dmm.com/search/=/searchstr={number_no_00}/sort=ranking/"),
        ])
    }

    async fn parse_search_page(
        &self,
        ctx: &mut Context,
        html: &str,
        search_url: &str,
    ) -> Result<Vec<String>, CrawlerError> {
        if NOT_FOUND_SPAN.is_match(html) {
            return Err(CrawlerError::Http {
                status: 404,
                url: search_url.to_string(),
            });
        }

        let mut urls: Vec<String> = DETAIL_URL
            .captures_iter(html)
            .map(|caps| unescape_search_url(&caps[1]))
            .collect();
        urls.sort_unstable();
        urls.dedup();
        if urls.is_empty() {
            ctx.debug(format!("dmm search empty: {search_url}"));
            return Ok(Vec::new());
        }

        let Some((n1, n2)) = Self::number_keys(&ctx.input.number) else {
            ctx.debug(format!("cannot split number: {}", ctx.input.number));
            return Ok(Vec::new());
        };
        let pattern_1 = Regex::new(&format!("[^a-z]{}[^0-9]", regex::escape(&n1)))
            .map_err(|err| CrawlerError::Parse(err.to_string()))?;
        let pattern_2 = Regex::new(&format!("[^a-z]{}[^0-9]", regex::escape(&n2)))
            .map_err(|err| CrawlerError::Parse(err.to_string()))?;

        let matching: Vec<String> = urls
            .into_iter()
            .filter(|url| pattern_1.is_match(url) || pattern_2.is_match(url))
            .collect();
        ctx.debug(format!(
            "dmm search matched {} detail urls on {search_url}",
            matching.len()
        ));
        Ok(matching)
    }

    /// Fetch every category variant concurrently and merge by category
    /// preference, independent of arrival order.
    async fn fetch_detail_set(
        &self,
        ctx: &mut Context,
        detail_urls: Vec<String>,
    ) -> Result<CrawlerData, CrawlerError> {
        let mut by_category: HashMap<Category, Vec<String>> = HashMap::new();
        for url in detail_urls {
            by_category.entry(parse_category(&url)).or_default().push(url);
        }

        let mut group: GatherGroup<CrawlerData> = GatherGroup::with_timeout(self.detail_timeout);
        for &category in Category::MERGE_ORDER {
            let Some(urls) = by_category.get(&category) else {
                continue;
            };
            let mut urls = urls.clone();
            urls.sort_unstable();
            for url in urls {
                let client = self.client.clone();
                match category {
                    Category::FanzaTv => group.add(Self::fetch_fanza_tv(client, url)),
                    Category::DmmTv => group.add(Self::fetch_dmm_tv(client, url)),
                    _ => {
                        let browser = self.browser.clone();
                        group.add(Self::fetch_product(client, browser, category, url));
                    }
                }
            }
        }

        if group.is_empty() {
            return Err(CrawlerError::Parse("no recognized dmm detail urls".into()));
        }

        // Results arrive in add order, which is category priority order.
        let mut merged: Option<CrawlerData> = None;
        for result in group.join().await {
            let data = match result {
                Ok(data) => data,
                Err(err) => {
                    ctx.debug(format!("dmm variant failed: {err}"));
                    continue;
                }
            };
            match merged.as_mut() {
                None => merged = Some(data),
                Some(acc) => update_valid(acc, &data),
            }
        }
        merged.ok_or_else(|| CrawlerError::Parse("all dmm variants failed".into()))
    }

    async fn parse_detail_page(
        &self,
        _ctx: &mut Context,
        html: &str,
        detail_url: &str,
    ) -> Result<CrawlerData, CrawlerError> {
        // Detail handling goes through fetch_detail_set's category fanout.
        Ok(parse_product_page(html, parse_category(detail_url), detail_url))
    }

    async fn post_process(
        &self,
        ctx: &mut Context,
        mut data: CrawlerData,
    ) -> Result<CrawlerData, CrawlerError> {
        if data.number.is_empty() {
            data.number = ctx.input.number.clone();
        }
        data.originaltitle = data.title.clone();
        data.originalplot = data.outline.clone();

        let is_sod = data.studio.to_uppercase().contains("SOD");
        let is_vr = data.title.to_uppercase().contains("VR");
        data.image_download = is_vr || is_sod;

        // Prefer the AWS mirror of the package image when it validates.
        if data.thumb.contains("pics.dmm.co.jp") {
            let mut candidates = vec![data
                .thumb
                .replace("pics.dmm.co.jp", "awsimgsrc.dmm.co.jp/pics_dig")
                .replace("/adult/", "/")];
            for key in [SCRATCH_NUMBER_00, SCRATCH_NUMBER_NO_00] {
                if let Some(number) = ctx.scratch(key) {
                    candidates.push(format!(
                        "https://awsimgsrc.dmm.co.jp/pics_dig/digital/video/{number}/{number}pl.jpg"
                    ));
                }
            }
            for candidate in candidates {
                if media::probe_image(&self.client, &candidate).await.is_some() {
                    ctx.debug(format!("dmm aws cover adopted: {candidate}"));
                    data.thumb = candidate;
                    break;
                }
            }
        }
        if !data.thumb.is_empty() {
            data.poster = data.thumb.replace("pl.jpg", "ps.jpg");
        }

        // SOD covers are sized oddly; when the packaged poster is much
        // smaller than the cover, crop from the cover instead.
        if is_sod && !data.poster.is_empty() && !data.thumb.is_empty() {
            let poster_size = media::content_length(&self.client, &data.poster).await;
            let thumb_size = media::content_length(&self.client, &data.thumb).await;
            if let (Some(poster_size), Some(thumb_size)) = (poster_size, thumb_size) {
                if (poster_size as f64) < (thumb_size as f64) * self.sod_size_ratio {
                    ctx.debug(format!(
                        "dmm sod cover: ps={poster_size}B pl={thumb_size}B, crop mode"
                    ));
                    data.image_download = is_vr;
                }
            }
        }

        if !data.trailer.is_empty() {
            data.trailer = media::upgrade_dmm_trailer(&self.client, &data.trailer).await;
        }

        if data.publisher.is_empty() {
            data.publisher = data.studio.clone();
        }
        if let Some(head) = data.release.get(..4) {
            if head.bytes().all(|b| b.is_ascii_digit()) {
                data.year = head.to_string();
            }
        }
        Ok(data)
    }
}
