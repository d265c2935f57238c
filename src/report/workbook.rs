use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use super::{record_classes, truncate_chars, ReportData};
use crate::history::QueryRecord;
use crate::round_to;

/// Sheet files written by [`write_csv_workbook`], in order.
pub const WORKBOOK_SHEETS: [&str; 4] = ["summary.csv", "classes.csv", "history.csv", "detections.csv"];

const FILENAME_COLUMN: usize = 50;

/// Write every sheet into `dir`, creating it if needed.
pub fn write_csv_workbook(data: &ReportData, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let mut written = Vec::with_capacity(WORKBOOK_SHEETS.len());
    for sheet in WORKBOOK_SHEETS {
        let path = dir.join(sheet);
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        write_sheet(sheet, data, file)?;
        written.push(path);
    }
    log::info!("wrote {} report sheets to {}", written.len(), dir.display());
    Ok(written)
}

/// Every sheet packed into one uncompressed zip archive.
pub fn workbook_zip(data: &ReportData) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for sheet in WORKBOOK_SHEETS {
        zip.start_file(sheet, options)
            .with_context(|| format!("start {} in workbook archive", sheet))?;
        write_sheet(sheet, data, &mut zip)?;
    }
    let archive = zip.finish().context("finish workbook archive")?;
    Ok(archive.into_inner())
}

fn write_sheet<W: Write>(sheet: &str, data: &ReportData, out: W) -> Result<()> {
    match sheet {
        "summary.csv" => write_summary(data, out),
        "classes.csv" => write_classes(data, out),
        "history.csv" => write_history(&data.history, out),
        _ => write_detections(&data.history, out),
    }
}

/// The history sheet as CSV bytes.
pub fn history_csv(records: &[QueryRecord]) -> Result<Vec<u8>> {
    let mut csv_data = Vec::new();
    write_history(records, &mut csv_data)?;
    Ok(csv_data)
}

fn write_summary<W: Write>(data: &ReportData, out: W) -> Result<()> {
    let stats = &data.stats;
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(["indicator", "value"])?;
    wtr.write_record(["generated_at", data.generated_at.to_rfc3339().as_str()])?;
    let rows = [
        ("total_queries", stats.total_queries.to_string()),
        (
            "queries_with_detection",
            stats.queries_with_detection.to_string(),
        ),
        (
            "queries_without_detection",
            stats
                .total_queries
                .saturating_sub(stats.queries_with_detection)
                .to_string(),
        ),
        (
            "avg_processing_time_ms",
            stats.avg_processing_time_ms.to_string(),
        ),
    ];
    for (indicator, value) in rows {
        wtr.write_record([indicator, value.as_str()])?;
    }
    for (source, count) in &stats.by_source {
        wtr.write_record([format!("source:{}", source), count.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_classes<W: Write>(data: &ReportData, out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(["class", "count"])?;
    for (label, count) in &data.class_counts {
        wtr.write_record([label.clone(), count.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_history<W: Write>(records: &[QueryRecord], out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record([
        "id",
        "timestamp",
        "source",
        "filename",
        "detections_count",
        "processing_time_ms",
        "classes",
    ])?;
    for record in records {
        wtr.write_record([
            record.id.clone(),
            record.timestamp.clone(),
            record.source.to_string(),
            truncate_chars(record.filename.as_deref().unwrap_or(""), FILENAME_COLUMN),
            record.detections_count.to_string(),
            record.processing_time_ms.to_string(),
            record_classes(record),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_detections<W: Write>(records: &[QueryRecord], out: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record([
        "query_id",
        "timestamp",
        "source",
        "class",
        "confidence_pct",
        "time_sec",
    ])?;
    for record in records {
        let timestamp = truncate_chars(&record.timestamp, 19);
        for detection in &record.detections {
            wtr.write_record([
                record.id.clone(),
                timestamp.clone(),
                record.source.to_string(),
                detection.class_label.clone(),
                format!("{:.1}", round_to(detection.confidence * 100.0, 1)),
                detection
                    .time_offset_sec
                    .map(|t| format!("{:.1}", t))
                    .unwrap_or_default(),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}
