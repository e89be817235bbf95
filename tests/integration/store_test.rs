// Log store persistence, retention and offline analysis

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use std::fs;
use tempfile::TempDir;

use querylens::analysis::{analyze, AnalysisOptions};
use querylens::config::StorageConfig;
use querylens::record::{NPlusOnePattern, QueryRecord, RequestMetadata};
use querylens::store::{date_from_file_name, LogStore};
use querylens::{QueryEvent, QueryLens};

use super::test_harness::test_config;

fn store_in(dir: &TempDir, max_file_size_mb: u64) -> LogStore {
    LogStore::new(&StorageConfig {
        path: dir.path().to_path_buf(),
        max_file_size_mb,
        retention_days: 7,
    })
}

fn record_on(date: NaiveDate, sql: &str, time_ms: f64) -> QueryRecord {
    let mut record = QueryRecord::new("req-1", "default", sql, vec![], time_ms)
        .with_metadata(RequestMetadata::default().with_route("/reports"));
    record.timestamp = Utc.from_utc_datetime(&date.and_hms_opt(12, 0, 0).unwrap());
    record
}

#[test]
fn test_records_round_trip_through_engine() {
    let dir = TempDir::new().unwrap();
    let engine = QueryLens::new(test_config(&dir)).unwrap();

    let mut aggregator = engine.aggregator();
    aggregator.start(Some("req-7".to_string()), RequestMetadata::default().with_route("/a/b"));
    let tracked = aggregator
        .track(QueryEvent::new("SELECT * FROM users WHERE email = ?", vec!["a@b.c".into()], 4.2))
        .unwrap();
    aggregator.finish();
    engine.flush();

    let stored = engine.store().read(tracked.timestamp.date_naive(), None);
    assert_eq!(stored, vec![tracked]);

    // slashes are written unescaped
    let text = fs::read_to_string(engine.store().path_for(stored[0].timestamp.date_naive())).unwrap();
    assert!(text.contains("\"/a/b\""));
    assert!(text.starts_with("[\n"));
}

#[test]
fn test_records_partition_by_day() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, 50);
    let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
    let tuesday = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();

    store.try_append(&record_on(monday, "SELECT 1", 1.0)).unwrap();
    store.try_append(&record_on(tuesday, "SELECT 2", 1.0)).unwrap();
    store.try_append(&record_on(tuesday, "SELECT 3", 1.0)).unwrap();

    assert_eq!(store.read(monday, None).len(), 1);
    let tuesday_records = store.read(tuesday, None);
    assert_eq!(tuesday_records.len(), 2);
    assert_eq!(tuesday_records[1].sql, "SELECT 3");
    assert_eq!(store.read(tuesday, Some(1)).len(), 1);
    assert!(store
        .path_for(monday)
        .ends_with("queries-2024-03-04.json"));
}

#[test]
fn test_rotation_keeps_every_record() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, 0);
    let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

    for i in 0..3 {
        store
            .try_append(&record_on(day, &format!("SELECT {}", i), 1.0))
            .unwrap();
    }

    // every append overflows a zero-byte cap, so each lands in its own rotated file
    let files = store.log_files();
    assert_eq!(files.len(), 3);
    assert!(!store.path_for(day).exists());

    let mut total = 0;
    for file in &files {
        let name = file.file_name().unwrap().to_str().unwrap();
        assert_eq!(date_from_file_name(name), Some(day));
        let values: Vec<serde_json::Value> =
            serde_json::from_str(&fs::read_to_string(file).unwrap()).unwrap();
        total += values.len();
    }
    assert_eq!(total, 3);
}

#[test]
fn test_cleanup_respects_retention() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, 50);
    let today = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();

    for age in [0i64, 3, 7, 8, 30] {
        let day = today - Duration::days(age);
        store.try_append(&record_on(day, "SELECT 1", 1.0)).unwrap();
    }
    fs::write(dir.path().join("queries-notes.json"), "[]").unwrap();

    let deleted = store.cleanup_as_of(today, 7);
    assert_eq!(deleted, 2);

    let remaining: Vec<String> = store
        .log_files()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        remaining,
        vec![
            "queries-2024-03-13.json",
            "queries-2024-03-17.json",
            "queries-2024-03-20.json",
            "queries-notes.json",
        ]
    );
}

#[test]
fn test_analysis_over_stored_day() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, 50);
    let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

    let mut slow = record_on(day, "SELECT * FROM reports", 240.0);
    slow.slow_query = true;
    let mut storm = record_on(day, "SELECT * FROM users WHERE id=3", 2.0);
    storm.n_plus_one = Some(NPlusOnePattern {
        query_pattern: "SELECT * FROM users WHERE id=?".to_string(),
        count: 3,
        route: "/reports".to_string(),
        location: None,
        suggestion: "Consider eager loading `users`".to_string(),
    });

    for record in [slow, storm, record_on(day, "SELECT 1", 1.0)] {
        store.try_append(&record).unwrap();
    }

    let records = store.read(day, None);
    let report = analyze(&records, &AnalysisOptions::default());
    assert_eq!(report.total_queries, 3);
    assert_eq!(report.total_time_ms, 243.0);
    assert_eq!(report.average_time_ms, 81.0);
    assert_eq!(report.slow_queries, 1);
    assert_eq!(report.n_plus_one_patterns, 1);

    let options = AnalysisOptions {
        n_plus_one_only: true,
        ..Default::default()
    };
    let text = analyze(&records, &options).render(&options);
    assert!(text.contains("=== N+1 Query Patterns ==="));
    assert!(text.contains("SELECT * FROM users WHERE id=?"));
    assert!(text.contains("/reports"));
}
