use anyhow::Result;
use tempfile::tempdir;
use weapon_detect::history::{export_json, QueryRecord};
use weapon_detect::{Detection, HistoryStore, SourceKind, SqliteHistoryStore};

fn detection(label: &str, frame: Option<u64>) -> Detection {
    Detection {
        class_label: label.to_string(),
        confidence: 0.7321,
        bbox: [10.5, 20.0, 30.25, 44.0],
        frame_index: frame,
        time_offset_sec: frame.map(|f| f as f64 / 30.0),
    }
}

#[test]
fn records_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("nested/history.db");
    let db_path = db_path.to_string_lossy().into_owned();

    let id = {
        let mut store = SqliteHistoryStore::open(&db_path)?;
        store.save(
            SourceKind::Video,
            Some("lobby.mp4"),
            &[detection("rifle", Some(30)), detection("knife", Some(60))],
            812.5,
        )?
    };

    let store = SqliteHistoryStore::open(&db_path)?;
    let mut records = store.list(10, 0)?;
    assert_eq!(records.len(), 1);
    let record = records.remove(0);
    assert_eq!(record.id, id);
    assert_eq!(record.source, SourceKind::Video);
    assert_eq!(record.filename.as_deref(), Some("lobby.mp4"));
    assert_eq!(record.detections_count, 2);
    assert_eq!(record.detections[1].frame_index, Some(60));
    assert_eq!(record.detections[1].time_offset_sec, Some(2.0));
    assert!(record.has_detection);
    assert!(record.timestamp.ends_with('Z'));
    Ok(())
}

#[test]
fn list_pages_most_recent_first() -> Result<()> {
    let mut store = SqliteHistoryStore::open(&weapon_detect::shared_memory_uri())?;
    let mut ids = Vec::new();
    for i in 0..5 {
        let name = format!("img{i}.jpg");
        ids.push(store.save(SourceKind::Upload, Some(name.as_str()), &[], 10.0)?);
    }

    let page: Vec<String> = store.list(2, 0)?.into_iter().map(|r| r.id).collect();
    assert_eq!(page, vec![ids[4].clone(), ids[3].clone()]);
    let page: Vec<String> = store.list(2, 4)?.into_iter().map(|r| r.id).collect();
    assert_eq!(page, vec![ids[0].clone()]);
    assert!(store.list(10, 5)?.is_empty());
    Ok(())
}

#[test]
fn stats_aggregate_all_records() -> Result<()> {
    let mut store = SqliteHistoryStore::open(&weapon_detect::shared_memory_uri())?;
    assert_eq!(store.stats()?.total_queries, 0);
    assert_eq!(store.stats()?.avg_processing_time_ms, 0.0);

    store.save(SourceKind::Upload, Some("a.png"), &[detection("pistol", None)], 10.0)?;
    store.save(SourceKind::Camera, None, &[], 20.0)?;
    store.save(SourceKind::Camera, Some(""), &[detection("knife", None)], 35.555)?;

    let stats = store.stats()?;
    assert_eq!(stats.total_queries, 3);
    assert_eq!(stats.queries_with_detection, 2);
    assert_eq!(stats.by_source.get("camera"), Some(&2));
    assert_eq!(stats.by_source.get("upload"), Some(&1));
    assert_eq!(stats.by_source.get("video"), None);
    assert_eq!(stats.avg_processing_time_ms, 21.85);

    let camera = store.list(1, 0)?.remove(0);
    assert_eq!(camera.filename, None);
    Ok(())
}

#[test]
fn json_export_matches_listing() -> Result<()> {
    let dir = tempdir()?;
    let mut store = SqliteHistoryStore::open(&weapon_detect::shared_memory_uri())?;
    store.save(SourceKind::Upload, Some("a.png"), &[detection("pistol", None)], 12.0)?;
    store.save(SourceKind::Video, Some("b.mp4"), &[], 40.0)?;

    let path = export_json(&store, &dir.path().join("exports/history.json"))?;
    let exported: Vec<QueryRecord> = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(exported, store.list(100, 0)?);
    assert_eq!(exported[0].source, SourceKind::Video);

    let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(raw[1]["detections"][0]["class"], "pistol");
    assert!(raw[1]["detections"][0].get("frame_no").is_none());
    Ok(())
}
