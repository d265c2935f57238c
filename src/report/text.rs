use std::fmt::Write;

use super::{record_classes, truncate_chars, ReportData};

/// Rows in the recent queries table.
pub const RECENT_QUERY_ROWS: usize = 50;

const FILE_COLUMN: usize = 25;
const CLASSES_COLUMN: usize = 20;

/// Plain text summary: statistics, detected classes and recent queries.
pub fn render_text_report(data: &ReportData) -> String {
    let mut out = String::new();
    let stats = &data.stats;

    let _ = writeln!(out, "Weapon Detection Report");
    let _ = writeln!(out, "Generated: {}", data.generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(out);

    let _ = writeln!(out, "Statistics");
    let _ = writeln!(out, "{:<32} {:>12}", "Indicator", "Value");
    let mut rows = vec![
        ("Total queries".to_string(), stats.total_queries.to_string()),
        (
            "With detections".to_string(),
            stats.queries_with_detection.to_string(),
        ),
        (
            "Without detections".to_string(),
            stats
                .total_queries
                .saturating_sub(stats.queries_with_detection)
                .to_string(),
        ),
        (
            "Avg processing time (ms)".to_string(),
            stats.avg_processing_time_ms.to_string(),
        ),
    ];
    rows.extend(
        stats
            .by_source
            .iter()
            .map(|(source, count)| (format!("By source: {}", source), count.to_string())),
    );
    for (label, value) in rows {
        let _ = writeln!(out, "{:<32} {:>12}", label, value);
    }

    if !data.class_counts.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Detected classes");
        let _ = writeln!(out, "{:<24} {:>8}", "Class", "Count");
        for (label, count) in &data.class_counts {
            let _ = writeln!(out, "{:<24} {:>8}", label, count);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Recent queries (up to {})", RECENT_QUERY_ROWS);
    if data.history.is_empty() {
        let _ = writeln!(out, "History is empty.");
        return out;
    }
    let _ = writeln!(
        out,
        "{:<19}  {:<7}  {:<25}  {:>7}  {:>9}  {}",
        "Date", "Source", "File", "Detect.", "Time (ms)", "Classes"
    );
    for record in data.history.iter().take(RECENT_QUERY_ROWS) {
        let date = truncate_chars(&record.timestamp, 19).replace('T', " ");
        let file = record
            .filename
            .as_deref()
            .map(|name| truncate_chars(name, FILE_COLUMN))
            .unwrap_or_else(|| "-".to_string());
        let classes = truncate_chars(&record_classes(record), CLASSES_COLUMN);
        let _ = writeln!(
            out,
            "{:<19}  {:<7}  {:<25}  {:>7}  {:>9.1}  {}",
            date,
            record.source,
            file,
            record.detections_count,
            record.processing_time_ms,
            if classes.is_empty() { "-" } else { classes.as_str() }
        );
    }
    out
}
