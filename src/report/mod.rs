//! Reports built purely from history contents.
//!
//! - `text`: plain text summary
//! - `workbook`: CSV sheets (summary, classes, history, detections)

mod text;
mod workbook;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::history::{HistoryStats, HistoryStore, QueryRecord};

pub use text::{render_text_report, RECENT_QUERY_ROWS};
pub use workbook::{history_csv, workbook_zip, write_csv_workbook, WORKBOOK_SHEETS};

/// Snapshot of history used by every renderer.
#[derive(Clone, Debug)]
pub struct ReportData {
    pub generated_at: DateTime<Utc>,
    pub stats: HistoryStats,
    /// Most recent first.
    pub history: Vec<QueryRecord>,
    /// Detection count per class, most frequent first, ties by label.
    pub class_counts: Vec<(String, u64)>,
}

impl ReportData {
    pub fn collect(store: &dyn HistoryStore, limit: usize) -> Result<Self> {
        let stats = store.stats()?;
        let history = store.list(limit, 0)?;
        let class_counts = count_classes(&history);
        Ok(Self {
            generated_at: Utc::now(),
            stats,
            history,
            class_counts,
        })
    }
}

fn count_classes(history: &[QueryRecord]) -> Vec<(String, u64)> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for detection in history.iter().flat_map(|record| &record.detections) {
        *counts.entry(detection.class_label.as_str()).or_default() += 1;
    }
    let mut sorted: Vec<(String, u64)> = counts
        .into_iter()
        .map(|(label, count)| (label.to_string(), count))
        .collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted
}

/// Distinct class labels of one record, comma separated.
pub(crate) fn record_classes(record: &QueryRecord) -> String {
    let classes: BTreeSet<&str> = record
        .detections
        .iter()
        .map(|detection| detection.class_label.as_str())
        .collect();
    classes.into_iter().collect::<Vec<_>>().join(", ")
}

/// First `max` characters of `value`.
pub(crate) fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::detect::Detection;
    use crate::history::{HistoryStore, InMemoryHistoryStore, SourceKind};

    pub fn detection(label: &str, confidence: f64) -> Detection {
        Detection {
            class_label: label.into(),
            confidence,
            bbox: [0.0, 0.0, 10.0, 10.0],
            frame_index: None,
            time_offset_sec: None,
        }
    }

    pub fn populated_store() -> InMemoryHistoryStore {
        let mut store = InMemoryHistoryStore::default();
        store
            .save(
                SourceKind::Upload,
                Some("range_day_with_a_very_long_descriptive_name.jpg"),
                &[detection("pistol", 0.91), detection("knife", 0.5)],
                12.5,
            )
            .unwrap();
        store.save(SourceKind::Camera, None, &[], 8.0).unwrap();
        store
            .save(
                SourceKind::Video,
                Some("clip.mp4"),
                &[
                    detection("knife", 0.66).at_frame(30, 1.0),
                    detection("knife", 0.71).at_frame(60, 2.0),
                ],
                120.0,
            )
            .unwrap();
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_counts_sorted_by_frequency_then_label() {
        let store = fixtures::populated_store();
        let data = ReportData::collect(&store, 100).unwrap();
        assert_eq!(
            data.class_counts,
            vec![("knife".to_string(), 3), ("pistol".to_string(), 1)]
        );
        assert_eq!(data.history.len(), 3);
        assert_eq!(data.stats.total_queries, 3);
    }

    #[test]
    fn record_classes_are_distinct_and_sorted() {
        let store = fixtures::populated_store();
        let data = ReportData::collect(&store, 100).unwrap();
        assert_eq!(record_classes(&data.history[0]), "knife");
        assert_eq!(record_classes(&data.history[2]), "knife, pistol");
        assert_eq!(record_classes(&data.history[1]), "");
    }
}
