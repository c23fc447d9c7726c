//! Core data model shared by the crawlers, the merge engine, and callers.
//!
//! A lookup starts from a [`CrawlerInput`], every site produces a
//! [`CrawlerData`], and the fanout engine folds those into one
//! [`MergedRecord`] whose `field_sources` map records which site won each
//! field.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Website;

/// Release placeholder emitted by several DVD-oriented sites.
pub const EMPTY_RELEASE: &str = "0000-00-00";

/// Scalar values treated as "not populated" during merging.
const SCALAR_PLACEHOLDERS: &[&str] = &["0", "00", "0.0", "0.00", EMPTY_RELEASE];

/// How the downstream filer should derive the poster from the cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageCut {
    /// Crop the center strip of the landscape cover.
    Center,
    /// Crop the right strip (standard JAV cover layout).
    #[default]
    Right,
    /// Do not crop at all.
    No,
}

impl fmt::Display for ImageCut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageCut::Center => write!(f, "center"),
            ImageCut::Right => write!(f, "right"),
            ImageCut::No => write!(f, "no"),
        }
    }
}

/// Input for one logical lookup.
///
/// `number` is the normalized upper-case catalog number; `short_number` is
/// the form with a leading numeric prefix stripped (`200GANA-3327` →
/// `GANA-3327`), empty when no prefix exists. The file path is opaque to
/// the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlerInput {
    pub number: String,
    pub short_number: String,
    pub mosaic: String,
    pub file_path: String,
    /// Appearance-date hint from the filename, ISO formatted when present.
    pub appoint_date: String,
}

impl CrawlerInput {
    pub fn from_number(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            ..Default::default()
        }
    }
}

/// Raw per-site crawl result, one instance per detail page (or merged
/// detail-page set for sites with several product variants).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlerData {
    pub number: String,
    pub title: String,
    pub originaltitle: String,
    pub outline: String,
    pub originalplot: String,
    pub actors: Vec<String>,
    pub all_actors: Vec<String>,
    pub directors: Vec<String>,
    pub tags: Vec<String>,
    pub series: String,
    pub studio: String,
    pub publisher: String,
    /// ISO date; `0000-00-00` is a placeholder and counts as empty.
    pub release: String,
    pub year: String,
    /// Minutes, digits only when non-empty.
    pub runtime: String,
    pub score: String,
    pub mosaic: String,
    /// Landscape cover URL.
    pub thumb: String,
    /// Portrait poster URL.
    pub poster: String,
    pub extrafanart: Vec<String>,
    pub trailer: String,
    pub image_cut: ImageCut,
    /// `true`: download the poster as-is; `false`: crop it from the cover.
    pub image_download: bool,
    /// Site-specific stable identifier.
    pub external_id: String,
}

/// Mergeable output fields, in stable declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Number,
    Title,
    Originaltitle,
    Outline,
    Originalplot,
    Actors,
    AllActors,
    Directors,
    Tags,
    Series,
    Studio,
    Publisher,
    Release,
    Year,
    Runtime,
    Score,
    Mosaic,
    Thumb,
    Poster,
    Extrafanart,
    Trailer,
    ExternalId,
}

impl Field {
    /// All mergeable fields in declaration order.
    pub const ALL: &'static [Field] = &[
        Field::Number,
        Field::Title,
        Field::Originaltitle,
        Field::Outline,
        Field::Originalplot,
        Field::Actors,
        Field::AllActors,
        Field::Directors,
        Field::Tags,
        Field::Series,
        Field::Studio,
        Field::Publisher,
        Field::Release,
        Field::Year,
        Field::Runtime,
        Field::Score,
        Field::Mosaic,
        Field::Thumb,
        Field::Poster,
        Field::Extrafanart,
        Field::Trailer,
        Field::ExternalId,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::Number => "number",
            Field::Title => "title",
            Field::Originaltitle => "originaltitle",
            Field::Outline => "outline",
            Field::Originalplot => "originalplot",
            Field::Actors => "actors",
            Field::AllActors => "all_actors",
            Field::Directors => "directors",
            Field::Tags => "tags",
            Field::Series => "series",
            Field::Studio => "studio",
            Field::Publisher => "publisher",
            Field::Release => "release",
            Field::Year => "year",
            Field::Runtime => "runtime",
            Field::Score => "score",
            Field::Mosaic => "mosaic",
            Field::Thumb => "thumb",
            Field::Poster => "poster",
            Field::Extrafanart => "extrafanart",
            Field::Trailer => "trailer",
            Field::ExternalId => "external_id",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Borrowed view of one field's value, scalar or collection.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Scalar(&'a str),
    List(&'a [String]),
}

impl FieldValue<'_> {
    /// A field is valid iff non-empty and, for scalars, not a known
    /// placeholder (`"0"`, `"0000-00-00"`, …).
    pub fn is_valid(&self) -> bool {
        match self {
            FieldValue::Scalar(s) => !s.is_empty() && !SCALAR_PLACEHOLDERS.contains(s),
            FieldValue::List(items) => !items.is_empty(),
        }
    }
}

impl CrawlerData {
    /// Borrow one field's value.
    pub fn field(&self, field: Field) -> FieldValue<'_> {
        match field {
            Field::Number => FieldValue::Scalar(&self.number),
            Field::Title => FieldValue::Scalar(&self.title),
            Field::Originaltitle => FieldValue::Scalar(&self.originaltitle),
            Field::Outline => FieldValue::Scalar(&self.outline),
            Field::Originalplot => FieldValue::Scalar(&self.originalplot),
            Field::Actors => FieldValue::List(&self.actors),
            Field::AllActors => FieldValue::List(&self.all_actors),
            Field::Directors => FieldValue::List(&self.directors),
            Field::Tags => FieldValue::List(&self.tags),
            Field::Series => FieldValue::Scalar(&self.series),
            Field::Studio => FieldValue::Scalar(&self.studio),
            Field::Publisher => FieldValue::Scalar(&self.publisher),
            Field::Release => FieldValue::Scalar(&self.release),
            Field::Year => FieldValue::Scalar(&self.year),
            Field::Runtime => FieldValue::Scalar(&self.runtime),
            Field::Score => FieldValue::Scalar(&self.score),
            Field::Mosaic => FieldValue::Scalar(&self.mosaic),
            Field::Thumb => FieldValue::Scalar(&self.thumb),
            Field::Poster => FieldValue::Scalar(&self.poster),
            Field::Extrafanart => FieldValue::List(&self.extrafanart),
            Field::Trailer => FieldValue::Scalar(&self.trailer),
            Field::ExternalId => FieldValue::Scalar(&self.external_id),
        }
    }

    /// Whether `field` carries a usable value.
    pub fn has_valid(&self, field: Field) -> bool {
        self.field(field).is_valid()
    }

    /// Copy one field's value from `other`.
    pub fn assign(&mut self, field: Field, other: &CrawlerData) {
        match field {
            Field::Number => self.number = other.number.clone(),
            Field::Title => self.title = other.title.clone(),
            Field::Originaltitle => self.originaltitle = other.originaltitle.clone(),
            Field::Outline => self.outline = other.outline.clone(),
            Field::Originalplot => self.originalplot = other.originalplot.clone(),
            Field::Actors => self.actors = other.actors.clone(),
            Field::AllActors => self.all_actors = other.all_actors.clone(),
            Field::Directors => self.directors = other.directors.clone(),
            Field::Tags => self.tags = other.tags.clone(),
            Field::Series => self.series = other.series.clone(),
            Field::Studio => self.studio = other.studio.clone(),
            Field::Publisher => self.publisher = other.publisher.clone(),
            Field::Release => self.release = other.release.clone(),
            Field::Year => self.year = other.year.clone(),
            Field::Runtime => self.runtime = other.runtime.clone(),
            Field::Score => self.score = other.score.clone(),
            Field::Mosaic => self.mosaic = other.mosaic.clone(),
            Field::Thumb => {
                self.thumb = other.thumb.clone();
                // Crop directives ride along with the cover they describe.
                self.image_cut = other.image_cut;
                self.image_download = other.image_download;
            }
            Field::Poster => self.poster = other.poster.clone(),
            Field::Extrafanart => self.extrafanart = other.extrafanart.clone(),
            Field::Trailer => self.trailer = other.trailer.clone(),
            Field::ExternalId => self.external_id = other.external_id.clone(),
        }
    }

    /// Normalize list fields: drop empties and duplicates preserving
    /// first-seen order, and keep `all_actors ⊇ actors`.
    pub fn normalize(&mut self) {
        self.actors = dedupe(std::mem::take(&mut self.actors));
        self.directors = dedupe(std::mem::take(&mut self.directors));
        self.tags = dedupe(std::mem::take(&mut self.tags));
        self.extrafanart = dedupe(std::mem::take(&mut self.extrafanart));

        let mut all = std::mem::take(&mut self.all_actors);
        let mut combined = self.actors.clone();
        combined.append(&mut all);
        self.all_actors = dedupe(combined);

        if self.release == EMPTY_RELEASE {
            self.release.clear();
        }
    }
}

/// Final output of one lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    #[serde(flatten)]
    pub data: CrawlerData,
    /// Which site won each populated field.
    pub field_sources: HashMap<Field, Website>,
}

impl MergedRecord {
    pub fn source_of(&self, field: Field) -> Option<Website> {
        self.field_sources.get(&field).copied()
    }
}

/// Deduplicate strings preserving first-seen order; empties are dropped.
pub fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .collect()
}

/// `true` when the string starts with an ISO `YYYY-MM-DD` date.
pub fn is_iso_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() >= 10
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(u8::is_ascii_digit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_scalars_are_invalid() {
        for placeholder in ["", "0", "00", "0.0", "0.00", "0000-00-00"] {
            assert!(
                !FieldValue::Scalar(placeholder).is_valid(),
                "{placeholder:?} should be invalid"
            );
        }
        assert!(FieldValue::Scalar("120").is_valid());
        assert!(FieldValue::Scalar("2024-01-02").is_valid());
    }

    #[test]
    fn empty_collections_are_invalid() {
        assert!(!FieldValue::List(&[]).is_valid());
        assert!(FieldValue::List(&["a".to_string()]).is_valid());
    }

    #[test]
    fn dedupe_preserves_first_seen_order() {
        let items = vec![
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
            String::new(),
            "c".to_string(),
            "a".to_string(),
        ];
        assert_eq!(dedupe(items), vec!["b", "a", "c"]);
    }

    #[test]
    fn normalize_keeps_all_actors_superset() {
        let mut data = CrawlerData {
            actors: vec!["A".into(), "B".into(), "A".into()],
            all_actors: vec!["C".into(), "B".into()],
            release: EMPTY_RELEASE.into(),
            ..Default::default()
        };
        data.normalize();
        assert_eq!(data.actors, vec!["A", "B"]);
        assert_eq!(data.all_actors, vec!["A", "B", "C"]);
        assert!(data.release.is_empty());
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut data = CrawlerData {
            number: "SSIS-497".into(),
            title: "title".into(),
            actors: vec!["A".into()],
            release: "2022-08-09".into(),
            year: "2022".into(),
            image_cut: ImageCut::Right,
            image_download: true,
            ..Default::default()
        };
        data.normalize();
        let record = MergedRecord {
            data,
            field_sources: HashMap::from([(Field::Title, Website::Dmm)]),
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: MergedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn iso_date_detection() {
        assert!(is_iso_date("2024-01-02"));
        assert!(is_iso_date("2024-01-02T10:00:00Z"));
        assert!(!is_iso_date("Jan 2 2024"));
        assert!(!is_iso_date("2024"));
    }
}
