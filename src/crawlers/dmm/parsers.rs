//! DMM category routing, product-page parsing, and trailer URL builders.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use crate::crawlers::parse::{
    all_attrs, element_text, first_attr, first_text, normalize_label, normalize_release, sel,
};
use crate::media;
use crate::types::CrawlerData;

/// Detail-URL categories, in merge priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Digital,
    Mono,
    Rental,
    Prime,
    Monthly,
    FanzaTv,
    DmmTv,
    Unknown,
}

impl Category {
    /// Category preference for merging one number's product variants.
    pub const MERGE_ORDER: &'static [Category] = &[
        Category::Digital,
        Category::Mono,
        Category::Rental,
        Category::Prime,
        Category::Monthly,
        Category::FanzaTv,
        Category::DmmTv,
    ];
}

/// Classify a detail URL by its path shape.
pub fn parse_category(url: &str) -> Category {
    let lower = url.to_lowercase();
    if lower.contains("tv.dmm.co.jp") {
        return Category::FanzaTv;
    }
    if lower.contains("tv.dmm.com") {
        return Category::DmmTv;
    }
    if lower.contains("/digital/") {
        return Category::Digital;
    }
    if lower.contains("/mono/") {
        return Category::Mono;
    }
    if lower.contains("/rental/") {
        return Category::Rental;
    }
    if lower.contains("/prime/") {
        return Category::Prime;
    }
    if lower.contains("/monthly/") {
        return Category::Monthly;
    }
    Category::Unknown
}

static TITLE: Lazy<Selector> = Lazy::new(|| sel("h1#title, h1.item"));
static INFO_CELLS: Lazy<Selector> = Lazy::new(|| sel("table tr td.nw, table tr th"));
static PACKAGE_LINK: Lazy<Selector> = Lazy::new(|| sel(r#"a[name="package-image"], #sample-video a"#));
static PACKAGE_IMG: Lazy<Selector> = Lazy::new(|| sel("#sample-video img, #package-src img"));
static SAMPLE_IMAGES: Lazy<Selector> = Lazy::new(|| sel("#sample-image-block img"));
static REVIEW_AVERAGE: Lazy<Selector> = Lazy::new(|| sel(".d-review__average strong"));
static CELL_LINKS: Lazy<Selector> = Lazy::new(|| sel("a"));
static CID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)/cid=([a-z0-9_]+)").unwrap());
static SCORE_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());
static SAMPLE_SMALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"-(\d+)\.jpg$").unwrap());

/// Content id from a detail URL (`/detail/=/cid=ssis00497/`).
pub fn cid_from_url(url: &str) -> Option<String> {
    CID.captures(url).map(|caps| caps[1].to_lowercase())
}

fn sibling_value(cell: scraper::ElementRef<'_>) -> (String, Vec<String>) {
    let mut value = String::new();
    let mut links = Vec::new();
    for sibling in cell.next_siblings() {
        if let Some(element) = scraper::ElementRef::wrap(sibling) {
            value = element_text(&element);
            links = element
                .select(&CELL_LINKS)
                .map(|a| element_text(&a))
                .filter(|text| !text.is_empty())
                .collect();
            break;
        }
    }
    (value, links)
}

/// Parse a DMM product page (digital / mono / rental / prime / monthly).
///
/// The categories share the table layout and differ in the release label
/// and a handful of selectors; `category` picks the right vocabulary.
pub fn parse_product_page(html: &str, category: Category, detail_url: &str) -> CrawlerData {
    let doc = Html::parse_document(html);
    let mut data = CrawlerData::default();

    data.title = first_text(&doc, &TITLE);
    data.originaltitle = data.title.clone();

    let release_labels: &[&str] = match category {
        Category::Digital => &["配信開始日", "商品発売日", "発売日"],
        Category::Rental => &["貸出開始日", "発売日"],
        _ => &["発売日", "商品発売日", "配信開始日"],
    };

    for cell in doc.select(&INFO_CELLS) {
        let label = normalize_label(&element_text(&cell));
        if label.is_empty() {
            continue;
        }
        let (value, links) = sibling_value(cell);
        if value.is_empty() && links.is_empty() {
            continue;
        }

        if release_labels
            .iter()
            .any(|wanted| label == normalize_label(wanted))
        {
            let normalized = normalize_release(&value);
            if data.release.is_empty() && normalized.contains('-') {
                data.release = normalized;
            }
        } else if label == normalize_label("収録時間") {
            if let Some(digits) = crate::crawlers::parse::first_digits(&value) {
                data.runtime = digits.to_string();
            }
        } else if label == normalize_label("出演者") {
            data.actors = if links.is_empty() {
                crate::crawlers::parse::split_names(&value)
            } else {
                links
            };
        } else if label == normalize_label("監督") {
            data.directors = if links.is_empty() {
                crate::crawlers::parse::split_names(&value)
            } else {
                links
            };
        } else if label == normalize_label("シリーズ") {
            data.series = links.first().cloned().unwrap_or(value);
            if data.series == "----" {
                data.series.clear();
            }
        } else if label == normalize_label("メーカー") {
            data.studio = links.first().cloned().unwrap_or(value);
        } else if label == normalize_label("レーベル") {
            data.publisher = links.first().cloned().unwrap_or(value);
            if data.publisher == "----" {
                data.publisher.clear();
            }
        } else if label == normalize_label("ジャンル") {
            data.tags = if links.is_empty() {
                crate::crawlers::parse::split_names(&value)
            } else {
                links
            };
        } else if label == normalize_label("品番") {
            data.number = value;
        }
    }

    data.all_actors = data.actors.clone();

    let score_text = first_text(&doc, &REVIEW_AVERAGE);
    if let Some(m) = SCORE_VALUE.find(&score_text) {
        data.score = m.as_str().to_string();
    }

    data.thumb = first_attr(&doc, &PACKAGE_LINK, "href");
    if !data.thumb.ends_with(".jpg") {
        data.thumb = first_attr(&doc, &PACKAGE_IMG, "src");
    }
    if data.thumb.starts_with("//") {
        data.thumb = format!("https:{}", data.thumb);
    }

    data.extrafanart = all_attrs(&doc, &SAMPLE_IMAGES, "src")
        .into_iter()
        .map(|src| {
            // Sample strips show the small `-N.jpg` variant; the stills
            // themselves are the `jp-N.jpg` files.
            if src.contains("jp-") {
                src
            } else {
                SAMPLE_SMALL.replace(&src, "jp-$1.jpg").into_owned()
            }
        })
        .filter(|src| src.contains(".jpg"))
        .collect();

    data.external_id = detail_url.to_string();
    data
}

// Trailer discovery ---------------------------------------------------------

static JSON_LD_CONTENT_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""contentUrl"\s*:\s*"(https?[^"]+?\.mp4)""#).unwrap());
static GA_SAMPLE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)sampleplay\('([^']+)'\)"#).unwrap());
static PLAYER_IFRAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<iframe[^>]+src="([^"]*(?:html5_player|litevideo)[^"]*)""#).unwrap()
});
static PLAYER_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""src"\s*:\s*"((?:\\/|[^"\\])+\.mp4)""#).unwrap());
static PLAYLIST_CID: Lazy<Regex> = Lazy::new(|| Regex::new(r"/([^/]+)/playlist\.m3u8$").unwrap());
static PV_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"/pv/([^/]+)/").unwrap());

/// JSON-LD / GA-event trailer URL embedded in the detail page itself.
pub fn extract_inline_trailer(html: &str) -> Option<String> {
    if let Some(caps) = JSON_LD_CONTENT_URL.captures(html) {
        return Some(caps[1].to_string());
    }
    GA_SAMPLE_URL.captures(html).map(|caps| {
        let url = caps[1].to_string();
        if let Some(rest) = url.strip_prefix("//") {
            format!("https://{rest}")
        } else {
            url
        }
    })
}

/// Sample-player iframe URL on a detail page.
pub fn extract_player_url(html: &str) -> Option<String> {
    PLAYER_IFRAME.captures(html).map(|caps| {
        let url = caps[1].to_string();
        if let Some(rest) = url.strip_prefix("//") {
            format!("https://{rest}")
        } else {
            url
        }
    })
}

/// MP4 candidates from the player page's `args.bitrates` JSON, deduplicated
/// in appearance order.
pub fn extract_player_candidates(player_html: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    for caps in PLAYER_SRC.captures_iter(player_html) {
        let mut url = caps[1].replace("\\/", "/");
        if let Some(rest) = url.strip_prefix("//") {
            url = format!("https://{rest}");
        }
        if !candidates.contains(&url) {
            candidates.push(url);
        }
    }
    candidates
}

/// Canonical MP4 trailer from a Fanza sample-movie URL.
///
/// `hlsvideo/.../playlist.m3u8` converts to the litevideo `_sm_w.mp4` form;
/// temporary `/pv/` MP4 links pass through unchanged; any other playlist
/// shape is rejected (HLS never qualifies).
pub fn build_fanza_trailer_url(sample_movie_url: &str) -> String {
    let url = sample_movie_url.replace("hlsvideo", "litevideo");
    if url.contains("/pv/") && url.ends_with(".mp4") {
        return url;
    }
    if media::is_hls_playlist(&url) {
        if let Some(caps) = PLAYLIST_CID.captures(&url) {
            let cid = caps[1].to_string();
            if url.contains("/freepv/") {
                return url.replace("playlist.m3u8", &format!("{cid}_sm_w.mp4"));
            }
        }
        return String::new();
    }
    if url.ends_with(".mp4") {
        return url;
    }
    String::new()
}

/// Descending probe ladder built from the sample-movie thumbnail token and
/// the content id: canonical freepv variants first, then the thumbnail's
/// `/pv/{token}/` new-format variants.
pub fn build_fanza_fallback_candidates(sample_movie_thumbnail: &str, cid: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    if cid.is_empty() {
        return candidates;
    }
    for quality in ["4k", "hhb", "mhb", "dmb", "dm", "sm"] {
        candidates.push(media::freepv_url(cid, &format!("_{quality}_w")));
    }
    if let Some(caps) = PV_TOKEN.captures(sample_movie_thumbnail) {
        let token = caps[1].to_string();
        for quality in ["4k", "hhb", "mhb"] {
            candidates.push(format!(
                "https://cc3001.dmm.co.jp/pv/{token}/{cid}{quality}.mp4"
            ));
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_from_url_shapes() {
        assert_eq!(
            parse_category("https://www.dmm.co.jp/digital/videoa/-/detail/=/cid=ssis00497/"),
            Category::Digital
        );
        assert_eq!(
            parse_category("https://www.dmm.com/mono/dvd/-/detail/=/cid=n_709mmrak089sp/"),
            Category::Mono
        );
        assert_eq!(
            parse_category("https://www.dmm.co.jp/rental/-/detail/=/cid=x/"),
            Category::Rental
        );
        assert_eq!(
            parse_category("https://tv.dmm.co.jp/list/?content=mide00726"),
            Category::FanzaTv
        );
        assert_eq!(
            parse_category("https://tv.dmm.com/vod/detail/?season=abc123"),
            Category::DmmTv
        );
    }

    #[test]
    fn cid_extraction() {
        assert_eq!(
            cid_from_url("https://www.dmm.co.jp/digital/videoa/-/detail/=/cid=SSIS00497/"),
            Some("ssis00497".to_string())
        );
        assert_eq!(cid_from_url("https://tv.dmm.co.jp/list/?content=x"), None);
    }

    #[test]
    fn fanza_trailer_from_standard_playlist() {
        let url = "https://cc3001.dmm.co.jp/hlsvideo/freepv/s/ssi/ssis00497/playlist.m3u8";
        assert_eq!(
            build_fanza_trailer_url(url),
            "https://cc3001.dmm.co.jp/litevideo/freepv/s/ssi/ssis00497/ssis00497_sm_w.mp4"
        );
    }

    #[test]
    fn fanza_trailer_passes_temporary_pv_mp4_through() {
        let url = "https://cc3001.dmm.co.jp/pv/temporary_key/asfb00192_mhb_w.mp4";
        assert_eq!(build_fanza_trailer_url(url), url);
    }

    #[test]
    fn fanza_trailer_rejects_non_freepv_playlists() {
        let url = "https://cc3001.dmm.co.jp/litevideo/pv/temporary_key/playlist.m3u8";
        assert_eq!(build_fanza_trailer_url(url), "");
    }

    #[test]
    fn fallback_candidates_order_and_content() {
        let thumbnail = "https://pics.litevideo.dmm.co.jp/pv/TOKEN/cspl00022.jpg";
        let candidates = build_fanza_fallback_candidates(thumbnail, "cspl00022");
        assert!(candidates[0].ends_with("_4k_w.mp4"));
        assert!(candidates[1].ends_with("_hhb_w.mp4"));
        assert_eq!(
            candidates.last().unwrap(),
            "https://cc3001.dmm.co.jp/pv/TOKEN/cspl00022mhb.mp4"
        );
    }

    #[test]
    fn player_iframe_extraction() {
        let html =
            r#"<iframe src="https://www.dmm.co.jp/service/digitalapi/-/html5_player/=/cid=cspl00022/" />"#;
        assert_eq!(
            extract_player_url(html).unwrap(),
            "https://www.dmm.co.jp/service/digitalapi/-/html5_player/=/cid=cspl00022/"
        );
    }

    #[test]
    fn player_candidates_deduplicate_in_order() {
        let player_html = concat!(
            r#"{"src":"\/\/cc3001.dmm.co.jp\/pv\/TOKEN\/cspl00022sm.mp4"},"#,
            r#"{"src":"\/\/cc3001.dmm.co.jp\/pv\/TOKEN\/cspl00022hhb.mp4"},"#,
            r#"{"src":"\/\/cc3001.dmm.co.jp\/pv\/TOKEN\/cspl00022sm.mp4"}"#,
        );
        assert_eq!(
            extract_player_candidates(player_html),
            vec![
                "https://cc3001.dmm.co.jp/pv/TOKEN/cspl00022sm.mp4",
                "https://cc3001.dmm.co.jp/pv/TOKEN/cspl00022hhb.mp4",
            ]
        );
    }

    #[test]
    fn parses_digital_product_page() {
        let html = r#"<html><body>
          <h1 id="title">極上の時間 SSIS-497</h1>
          <table>
            <tr><td class="nw">配信開始日：</td><td>2022/08/09</td></tr>
            <tr><td class="nw">収録時間：</td><td>120分</td></tr>
            <tr><td class="nw">出演者：</td><td><a href="/a">女優A</a></td></tr>
            <tr><td class="nw">監督：</td><td><a href="/d">監督X</a></td></tr>
            <tr><td class="nw">シリーズ：</td><td>----</td></tr>
            <tr><td class="nw">メーカー：</td><td><a href="/m">エスワン</a></td></tr>
            <tr><td class="nw">レーベル：</td><td><a href="/l">S1 NO.1 STYLE</a></td></tr>
            <tr><td class="nw">ジャンル：</td><td><a href="/g1">単体作品</a><a href="/g2">ハイビジョン</a></td></tr>
            <tr><td class="nw">品番：</td><td>ssis00497</td></tr>
          </table>
          <div id="sample-video">
            <a name="package-image" href="https://pics.dmm.co.jp/digital/video/ssis00497/ssis00497pl.jpg"><img src="//pics.dmm.co.jp/digital/video/ssis00497/ssis00497ps.jpg"/></a>
          </div>
        </body></html>"#;
        let data = parse_product_page(
            html,
            Category::Digital,
            "https://www.dmm.co.jp/digital/videoa/-/detail/=/cid=ssis00497/",
        );
        assert_eq!(data.release, "2022-08-09");
        assert_eq!(data.runtime, "120");
        assert_eq!(data.actors, vec!["女優A"]);
        assert_eq!(data.directors, vec!["監督X"]);
        assert_eq!(data.series, "");
        assert_eq!(data.studio, "エスワン");
        assert_eq!(data.publisher, "S1 NO.1 STYLE");
        assert_eq!(data.tags, vec!["単体作品", "ハイビジョン"]);
        assert_eq!(data.number, "ssis00497");
        assert!(data.thumb.ends_with("ssis00497pl.jpg"));
    }
}
