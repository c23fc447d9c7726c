//! Field-level merge rules.
//!
//! Both merges in the pipeline use the same validity test: the inter-site
//! merge in the fanout engine and the intra-site merge of one number's
//! product variants (e.g. DMM digital vs. DVD vs. rental).

use std::collections::HashMap;

use crate::config::{FieldPriorities, Website};
use crate::types::{is_iso_date, CrawlerData, Field, MergedRecord};

/// Fill every invalid field of `acc` from `other`. `acc`'s valid fields
/// always win, so folding results in priority order keeps the highest
/// priority value per field.
pub fn update_valid(acc: &mut CrawlerData, other: &CrawlerData) {
    for &field in Field::ALL {
        if !acc.has_valid(field) && other.has_valid(field) {
            acc.assign(field, other);
        }
    }
}

/// Merge per-site results under the per-field priority policy.
///
/// For each field the configured site order is walked; the first site with
/// a valid value wins and is stamped into `field_sources`. `year` is
/// coupled to the winning ISO release unless an earlier site in the year
/// priority list populated it explicitly.
pub fn merge_by_priority(
    results: &HashMap<Website, CrawlerData>,
    priorities: &FieldPriorities,
) -> MergedRecord {
    let mut record = MergedRecord::default();

    for &field in Field::ALL {
        for &site in priorities.get(field) {
            let Some(data) = results.get(&site) else {
                continue;
            };
            if data.has_valid(field) {
                record.data.assign(field, data);
                record.field_sources.insert(field, site);
                break;
            }
        }
    }

    // Year follows the winning release when that release is ISO-formatted.
    if record.source_of(Field::Year).is_none() && is_iso_date(&record.data.release) {
        record.data.year = record.data.release[..4].to_string();
        if let Some(site) = record.source_of(Field::Release) {
            record.field_sources.insert(Field::Year, site);
        }
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageCut;

    fn data(number: &str, title: &str) -> CrawlerData {
        CrawlerData {
            number: number.to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn update_valid_fills_only_invalid_fields() {
        let mut acc = data("SSIS-497", "");
        acc.runtime = "0".to_string();
        let mut other = data("OTHER-1", "backfill title");
        other.runtime = "120".to_string();

        update_valid(&mut acc, &other);
        assert_eq!(acc.number, "SSIS-497");
        assert_eq!(acc.title, "backfill title");
        assert_eq!(acc.runtime, "120", "placeholder runtime is invalid");
    }

    #[test]
    fn merge_walks_priority_and_stamps_sources() {
        let mut priorities = FieldPriorities::new();
        priorities.set(Field::Title, vec![Website::Dmm, Website::Javbus]);
        priorities.set(Field::Outline, vec![Website::Dmm, Website::Javbus]);
        priorities.set(Field::Number, vec![Website::Dmm, Website::Javbus]);

        let mut dmm = data("SSIS-497", "dmm title");
        dmm.outline = String::new();
        let mut javbus = data("SSIS-497", "javbus title");
        javbus.outline = "javbus outline".to_string();

        let results = HashMap::from([(Website::Dmm, dmm), (Website::Javbus, javbus)]);
        let record = merge_by_priority(&results, &priorities);

        assert_eq!(record.data.title, "dmm title");
        assert_eq!(record.source_of(Field::Title), Some(Website::Dmm));
        assert_eq!(record.data.outline, "javbus outline");
        assert_eq!(record.source_of(Field::Outline), Some(Website::Javbus));
    }

    #[test]
    fn year_follows_iso_release() {
        let mut priorities = FieldPriorities::new();
        priorities.set(Field::Release, vec![Website::Javbus]);
        priorities.set(Field::Year, vec![Website::Javbus]);

        let mut javbus = data("ABC-123", "t");
        javbus.release = "2024-01-02".to_string();
        let results = HashMap::from([(Website::Javbus, javbus)]);

        let record = merge_by_priority(&results, &priorities);
        assert_eq!(record.data.year, "2024");
        assert_eq!(record.source_of(Field::Year), Some(Website::Javbus));
    }

    #[test]
    fn placeholder_release_never_wins() {
        let mut priorities = FieldPriorities::new();
        priorities.set(Field::Release, vec![Website::Javbus, Website::Mgstage]);

        let mut javbus = data("ABC-123", "t");
        javbus.release = "0000-00-00".to_string();
        let mut mgstage = data("ABC-123", "t");
        mgstage.release = "2024-03-15".to_string();
        let results = HashMap::from([(Website::Javbus, javbus), (Website::Mgstage, mgstage)]);

        let record = merge_by_priority(&results, &priorities);
        assert_eq!(record.data.release, "2024-03-15");
        assert_eq!(record.source_of(Field::Release), Some(Website::Mgstage));
    }

    #[test]
    fn crop_directives_follow_the_thumb_winner() {
        let mut priorities = FieldPriorities::new();
        priorities.set(Field::Thumb, vec![Website::Avbase]);

        let mut avbase = data("ABC-123", "t");
        avbase.thumb = "https://x/pl.jpg".to_string();
        avbase.image_cut = ImageCut::Right;
        avbase.image_download = true;
        let results = HashMap::from([(Website::Avbase, avbase)]);

        let record = merge_by_priority(&results, &priorities);
        assert_eq!(record.data.image_cut, ImageCut::Right);
        assert!(record.data.image_download);
    }
}
