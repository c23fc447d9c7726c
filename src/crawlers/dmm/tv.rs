//! GraphQL payloads and response models for the DMM TV variants.
//!
//! Fanza TV (`api.tv.dmm.co.jp`) and DMM TV (`api.tv.dmm.com`) expose the
//! same catalog entries as the web storefront but behind GraphQL. Models
//! are deliberately lenient: every field defaults so partial responses
//! still parse.

use serde::Deserialize;
use serde_json::{json, Value};

pub fn fanza_tv_payload(cid: &str) -> Value {
    json!({
        "operationName": "GetContent",
        "variables": {"id": cid, "device": "BROWSER", "playDevice": "BROWSER"},
        "query": r#"query GetContent($id: ID!, $device: Device!, $playDevice: PlayDevice!) {
  fanzaTvPlus(device: $device) {
    content(id: $id) {
      id
      title
      description
      startDeliveryAt
      packageImage
      packageLargeImage
      genres { name }
      actresses { name }
      directors { name }
      series { name }
      maker { name }
      label { name }
      playInfo(device: $playDevice) { duration }
      reviewSummary { averagePoint }
      samplePictures { image imageLarge }
      sampleMovie { url }
    }
  }
}"#,
    })
}

pub fn dmm_tv_payload(season_id: &str) -> Value {
    json!({
        "operationName": "GetVideo",
        "variables": {"seasonId": season_id, "device": "BROWSER"},
        "query": r#"query GetVideo($seasonId: ID!, $device: Device!) {
  video(id: $seasonId, device: $device) {
    id
    titleName
    description
    packageImage
    keyVisualImage
    startPublicAt
    productionYear
    genres { name }
    casts { actorName }
    staffs { roleName staffName }
    reviewSummary { averagePoint }
  }
}"#,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Named {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayInfo {
    #[serde(default)]
    pub duration: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSummary {
    #[serde(default)]
    pub average_point: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplePicture {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub image_large: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SampleMovie {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanzaContent {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub start_delivery_at: String,
    #[serde(default)]
    pub package_image: String,
    #[serde(default)]
    pub package_large_image: String,
    #[serde(default)]
    pub genres: Vec<Named>,
    #[serde(default)]
    pub actresses: Vec<Named>,
    #[serde(default)]
    pub directors: Vec<Named>,
    #[serde(default)]
    pub series: Named,
    #[serde(default)]
    pub maker: Named,
    #[serde(default)]
    pub label: Named,
    #[serde(default)]
    pub play_info: PlayInfo,
    #[serde(default)]
    pub review_summary: ReviewSummary,
    #[serde(default)]
    pub sample_pictures: Vec<SamplePicture>,
    #[serde(default)]
    pub sample_movie: SampleMovie,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanzaTvPlus {
    #[serde(default)]
    pub content: FanzaContent,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanzaData {
    #[serde(default)]
    pub fanza_tv_plus: FanzaTvPlus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FanzaResponse {
    #[serde(default)]
    pub data: FanzaData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Staff {
    #[serde(default)]
    pub role_name: String,
    #[serde(default)]
    pub staff_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cast {
    #[serde(default)]
    pub actor_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmmTvVideo {
    #[serde(default)]
    pub title_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub package_image: String,
    #[serde(default)]
    pub key_visual_image: String,
    #[serde(default)]
    pub start_public_at: String,
    #[serde(default)]
    pub production_year: u32,
    #[serde(default)]
    pub genres: Vec<Named>,
    #[serde(default)]
    pub casts: Vec<Cast>,
    #[serde(default)]
    pub staffs: Vec<Staff>,
    #[serde(default)]
    pub review_summary: ReviewSummary,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DmmTvData {
    #[serde(default)]
    pub video: DmmTvVideo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DmmTvResponse {
    #[serde(default)]
    pub data: DmmTvData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanza_response_parses_leniently() {
        let payload = serde_json::json!({
            "data": {"fanzaTvPlus": {"content": {
                "title": "T",
                "startDeliveryAt": "2025-05-17T20:00:00Z",
                "playInfo": {"duration": 7200.0},
                "reviewSummary": {"averagePoint": 4.5},
                "sampleMovie": {"url": "https://cc3001.dmm.co.jp/hlsvideo/freepv/s/ssi/ssis00497/playlist.m3u8"}
            }}}
        });
        let resp: FanzaResponse = serde_json::from_value(payload).unwrap();
        let content = resp.data.fanza_tv_plus.content;
        assert_eq!(content.title, "T");
        assert_eq!(content.play_info.duration, 7200.0);
        assert!(content.sample_movie.url.ends_with("playlist.m3u8"));
        assert!(content.maker.name.is_empty());
    }

    #[test]
    fn dmm_tv_response_parses_staffs() {
        let payload = serde_json::json!({
            "data": {"video": {
                "titleName": "T",
                "productionYear": 2024,
                "staffs": [
                    {"roleName": "監督", "staffName": "X"},
                    {"roleName": "制作", "staffName": "Y"}
                ]
            }}
        });
        let resp: DmmTvResponse = serde_json::from_value(payload).unwrap();
        assert_eq!(resp.data.video.production_year, 2024);
        assert_eq!(resp.data.video.staffs.len(), 2);
    }
}
