//! Append-mostly log of past detection queries.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::{open_db_connection, round_to};

/// Records written by [`export_json`].
pub const EXPORT_LIMIT: usize = 10_000;

/// Where a query's media came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Upload,
    Camera,
    Video,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Upload => "upload",
            SourceKind::Camera => "camera",
            SourceKind::Video => "video",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "upload" => Ok(SourceKind::Upload),
            "camera" => Ok(SourceKind::Camera),
            "video" => Ok(SourceKind::Video),
            other => Err(anyhow!("unknown query source '{}'", other)),
        }
    }
}

/// One saved query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: String,
    /// UTC, RFC 3339 with microseconds.
    pub timestamp: String,
    pub source: SourceKind,
    pub filename: Option<String>,
    pub detections_count: usize,
    pub detections: Vec<Detection>,
    pub processing_time_ms: f64,
    pub has_detection: bool,
}

impl QueryRecord {
    fn new(
        source: SourceKind,
        filename: Option<&str>,
        detections: &[Detection],
        elapsed_ms: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            source,
            filename: filename.filter(|name| !name.is_empty()).map(str::to_string),
            detections_count: detections.len(),
            detections: detections.to_vec(),
            processing_time_ms: elapsed_ms,
            has_detection: !detections.is_empty(),
        }
    }
}

/// Aggregate figures over the whole history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_queries: u64,
    pub queries_with_detection: u64,
    pub by_source: BTreeMap<String, u64>,
    pub avg_processing_time_ms: f64,
}

pub trait HistoryStore {
    /// Append one query. Returns the new record id.
    fn save(
        &mut self,
        source: SourceKind,
        filename: Option<&str>,
        detections: &[Detection],
        elapsed_ms: f64,
    ) -> Result<String>;

    /// Most recent first.
    fn list(&self, limit: usize, offset: usize) -> Result<Vec<QueryRecord>>;

    fn stats(&self) -> Result<HistoryStats>;
}

pub struct SqliteHistoryStore {
    conn: Connection,
}

impl SqliteHistoryStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open history database {}", db_path))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS query_history (
              id TEXT PRIMARY KEY,
              timestamp TEXT NOT NULL,
              source TEXT NOT NULL,
              filename TEXT,
              detections_count INTEGER NOT NULL DEFAULT 0,
              detections_json TEXT NOT NULL,
              processing_time_ms REAL NOT NULL,
              has_detection INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_history_timestamp ON query_history(timestamp);
            "#,
        )?;
        Ok(())
    }
}

/// Row as stored, before JSON and enum decoding.
struct RawRecord {
    id: String,
    timestamp: String,
    source: String,
    filename: Option<String>,
    detections_count: i64,
    detections_json: String,
    processing_time_ms: f64,
    has_detection: bool,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            source: row.get(2)?,
            filename: row.get(3)?,
            detections_count: row.get(4)?,
            detections_json: row.get(5)?,
            processing_time_ms: row.get(6)?,
            has_detection: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<QueryRecord> {
        let detections: Vec<Detection> = serde_json::from_str(&self.detections_json)
            .with_context(|| format!("corrupt detections for query {}", self.id))?;
        Ok(QueryRecord {
            source: self.source.parse()?,
            detections_count: usize::try_from(self.detections_count)
                .map_err(|_| anyhow!("negative detection count for query {}", self.id))?,
            id: self.id,
            timestamp: self.timestamp,
            filename: self.filename,
            detections,
            processing_time_ms: self.processing_time_ms,
            has_detection: self.has_detection,
        })
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn save(
        &mut self,
        source: SourceKind,
        filename: Option<&str>,
        detections: &[Detection],
        elapsed_ms: f64,
    ) -> Result<String> {
        let record = QueryRecord::new(source, filename, detections, elapsed_ms);
        let detections_json = serde_json::to_string(&record.detections)?;
        self.conn.execute(
            r#"
            INSERT INTO query_history(id, timestamp, source, filename, detections_count,
                                      detections_json, processing_time_ms, has_detection)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.id,
                record.timestamp,
                record.source.as_str(),
                record.filename,
                record.detections_count as i64,
                detections_json,
                record.processing_time_ms,
                record.has_detection
            ],
        )?;
        log::debug!(
            "saved {} query {} ({} detections)",
            record.source,
            record.id,
            record.detections_count
        );
        Ok(record.id)
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<QueryRecord>> {
        let raw = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, timestamp, source, filename, detections_count, detections_json,
                       processing_time_ms, has_detection
                FROM query_history
                ORDER BY timestamp DESC, rowid DESC
                LIMIT ?1 OFFSET ?2
                "#,
            )?;
            let rows = stmt.query_map(params![limit as i64, offset as i64], RawRecord::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raw.into_iter().map(RawRecord::into_record).collect()
    }

    fn stats(&self) -> Result<HistoryStats> {
        let (total, with_detection, avg): (i64, Option<i64>, Option<f64>) = self.conn.query_row(
            "SELECT COUNT(*), SUM(has_detection), AVG(processing_time_ms) FROM query_history",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut by_source = BTreeMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT source, COUNT(*) FROM query_history GROUP BY source")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let source: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            by_source.insert(source, count as u64);
        }

        Ok(HistoryStats {
            total_queries: total as u64,
            queries_with_detection: with_detection.unwrap_or(0) as u64,
            by_source,
            avg_processing_time_ms: round_to(avg.unwrap_or(0.0), 2),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryHistoryStore {
    records: Vec<QueryRecord>,
}

impl HistoryStore for InMemoryHistoryStore {
    fn save(
        &mut self,
        source: SourceKind,
        filename: Option<&str>,
        detections: &[Detection],
        elapsed_ms: f64,
    ) -> Result<String> {
        let record = QueryRecord::new(source, filename, detections, elapsed_ms);
        let id = record.id.clone();
        self.records.push(record);
        Ok(id)
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<QueryRecord>> {
        Ok(self
            .records
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn stats(&self) -> Result<HistoryStats> {
        let mut stats = HistoryStats {
            total_queries: self.records.len() as u64,
            ..HistoryStats::default()
        };
        for record in &self.records {
            if record.has_detection {
                stats.queries_with_detection += 1;
            }
            *stats
                .by_source
                .entry(record.source.as_str().to_string())
                .or_default() += 1;
        }
        if !self.records.is_empty() {
            let total: f64 = self.records.iter().map(|r| r.processing_time_ms).sum();
            stats.avg_processing_time_ms = round_to(total / self.records.len() as f64, 2);
        }
        Ok(stats)
    }
}

/// Write up to [`EXPORT_LIMIT`] records as pretty JSON, creating parent
/// directories.
pub fn export_json(store: &dyn HistoryStore, path: &Path) -> Result<PathBuf> {
    let records = store.list(EXPORT_LIMIT, 0)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create export directory {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(&records)?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    log::info!("exported {} history records to {}", records.len(), path.display());
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(label: &str) -> Detection {
        Detection {
            class_label: label.into(),
            confidence: 0.8123,
            bbox: [1.0, 2.0, 3.0, 4.0],
            frame_index: None,
            time_offset_sec: None,
        }
    }

    fn exercise(store: &mut dyn HistoryStore) {
        store
            .save(SourceKind::Upload, Some("a.jpg"), &[detection("pistol")], 10.0)
            .unwrap();
        store.save(SourceKind::Camera, None, &[], 20.0).unwrap();
        let last = store
            .save(
                SourceKind::Video,
                Some("clip.mp4"),
                &[detection("knife"), detection("knife").at_frame(30, 1.0)],
                35.555,
            )
            .unwrap();

        let listed = store.list(10, 0).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].id, last);
        assert_eq!(listed[0].detections_count, 2);
        assert_eq!(listed[0].detections[1].frame_index, Some(30));
        assert_eq!(listed[1].filename, None);
        assert!(!listed[1].has_detection);

        let page = store.list(1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].source, SourceKind::Camera);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_queries, 3);
        assert_eq!(stats.queries_with_detection, 2);
        assert_eq!(stats.by_source.get("upload"), Some(&1));
        assert_eq!(stats.by_source.get("video"), Some(&1));
        assert_eq!(stats.avg_processing_time_ms, 21.85);
    }

    #[test]
    fn in_memory_store_semantics() {
        exercise(&mut InMemoryHistoryStore::default());
    }

    #[test]
    fn sqlite_store_semantics() {
        let mut store = SqliteHistoryStore::open(&crate::shared_memory_uri()).unwrap();
        exercise(&mut store);
    }

    #[test]
    fn empty_stats_are_zero() {
        let store = SqliteHistoryStore::open(&crate::shared_memory_uri()).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_queries, 0);
        assert_eq!(stats.avg_processing_time_ms, 0.0);
        assert!(stats.by_source.is_empty());
    }

    #[test]
    fn source_kind_wire_names() {
        assert_eq!(serde_json::to_value(SourceKind::Camera).unwrap(), "camera");
        assert_eq!("video".parse::<SourceKind>().unwrap(), SourceKind::Video);
        assert!("email".parse::<SourceKind>().is_err());
    }
}
