// End-to-end tests of the request-scoped engine

use fs2::FileExt;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use querylens::aggregator::inject::{inject_into, response_headers, should_inject};
use querylens::alert::{AlertDispatcher, AlertKind};
use querylens::constants::LOCK_FILE_NAME;
use querylens::plan::{ExecutionPlan, PlanError, PlanProvider, PlanRequest};
use querylens::record::Issue;
use querylens::{QueryEvent, QueryLens, RequestMetadata};

use super::test_harness::{engine_with_recorder, test_config, RecordingChannel};

struct FakePlanner;

impl PlanProvider for FakePlanner {
    fn explain(&self, request: &PlanRequest<'_>) -> Result<ExecutionPlan, PlanError> {
        if request.connection == "replica" {
            return Err(PlanError::UnknownConnection(request.connection.to_string()));
        }
        Ok(ExecutionPlan::Structured(json!([{
            "table": "users",
            "type": "ALL",
            "statement": request.explain_sql(),
        }])))
    }
}

#[test]
fn test_n_plus_one_storm_end_to_end() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.n_plus_one.threshold = 3;
    config.n_plus_one.time_window_ms = 100;
    config.slow_query_threshold_ms = 100.0;
    let (engine, recorder) = engine_with_recorder(config);

    let mut aggregator = engine.aggregator();
    aggregator.start(None, RequestMetadata::default().with_route("/users"));

    let base = Instant::now();
    let records: Vec<_> = (1..=3u64)
        .map(|id| {
            let event = QueryEvent::new(format!("SELECT * FROM users WHERE id={}", id), vec![], 5.0);
            aggregator
                .track_at(event, base + Duration::from_millis((id - 1) * 10))
                .expect("tracked while active")
        })
        .collect();

    assert!(records[0].n_plus_one.is_none());
    assert!(records[1].n_plus_one.is_none());
    let pattern = records[2].n_plus_one.as_ref().expect("third execution is N+1");
    assert_eq!(pattern.count, 3);
    assert_eq!(pattern.query_pattern, "SELECT * FROM users WHERE id=?");
    assert_eq!(pattern.route, "/users");
    assert!(records.iter().all(|r| !r.slow_query));

    let alerts = recorder.events();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::NPlusOne);
    assert_eq!(alerts[0].field("count"), Some(&json!(3)));

    // further executions keep the classification but never alert again
    for id in 4..=6u64 {
        let event = QueryEvent::new(format!("SELECT * FROM users WHERE id={}", id), vec![], 5.0);
        let record = aggregator
            .track_at(event, base + Duration::from_millis(20 + id))
            .unwrap();
        assert_eq!(record.n_plus_one.unwrap().count, id as usize);
    }
    assert_eq!(recorder.events().len(), 1);

    let summary = aggregator.finish().unwrap();
    assert_eq!(summary.total_queries, 6);
    assert_eq!(summary.total_time_ms, 30.0);
    assert_eq!(summary.n_plus_one_count, 4);
    assert_eq!(summary.n_plus_one_patterns.len(), 1);
    assert_eq!(summary.n_plus_one_patterns[0].count, 6);
}

#[test]
fn test_concurrent_requests_do_not_share_state() {
    let dir = TempDir::new().unwrap();
    let engine = QueryLens::new(test_config(&dir)).unwrap();

    let handles: Vec<_> = (0..8usize)
        .map(|worker| {
            let engine = engine.clone();
            thread::spawn(move || {
                let mut aggregator = engine.aggregator();
                let request_id = format!("worker-{}", worker);
                let mut scope = aggregator.scope(
                    Some(request_id.clone()),
                    RequestMetadata::default().with_route(format!("/worker/{}", worker)),
                );
                for i in 0..(worker + 1) {
                    let event = QueryEvent::new(
                        "SELECT * FROM orders WHERE id=?",
                        vec![(i as i64).into()],
                        1.0,
                    );
                    let record = scope.track(event).unwrap();
                    assert_eq!(record.request_id, request_id);
                }
                scope.finish().unwrap()
            })
        })
        .collect();

    let mut total = 0;
    for (worker, handle) in handles.into_iter().enumerate() {
        let summary = handle.join().unwrap();
        assert_eq!(summary.request_id, format!("worker-{}", worker));
        assert_eq!(summary.total_queries, worker + 1);
        assert!(summary
            .queries
            .iter()
            .all(|q| q.metadata.route.as_deref() == Some(format!("/worker/{}", worker).as_str())));
        total += summary.total_queries;
    }

    engine.flush();
    let stored: usize = engine
        .store()
        .log_files()
        .iter()
        .map(|path| {
            let text = fs::read_to_string(path).unwrap();
            serde_json::from_str::<Vec<serde_json::Value>>(&text).unwrap().len()
        })
        .sum();
    assert_eq!(stored, total);
}

#[test]
fn test_disabled_engine_records_nothing() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.enabled = false;
    let engine = QueryLens::new(config).unwrap();

    let mut aggregator = engine.aggregator();
    aggregator.start(None, RequestMetadata::default());
    assert!(aggregator
        .track(QueryEvent::new("SELECT * FROM users", vec![], 500.0))
        .is_none());
    assert_eq!(aggregator.finish().unwrap().total_queries, 0);
    assert!(engine.store().log_files().is_empty());
}

#[test]
fn test_slow_queries_carry_plans_and_alerts() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.analyze_queries = true;

    let recorder = RecordingChannel::default();
    let mut alerts = config.alerts.clone();
    alerts.enabled = true;
    let dispatcher = AlertDispatcher::with_channels(&alerts, vec![Box::new(recorder.clone())]);
    let engine = QueryLens::builder(config)
        .plan_provider(FakePlanner)
        .alert_dispatcher(dispatcher)
        .build()
        .unwrap();

    let mut aggregator = engine.aggregator();
    aggregator.start(None, RequestMetadata::default());

    let slow = aggregator
        .track(QueryEvent::new("SELECT * FROM users", vec![], 250.0))
        .unwrap();
    assert!(slow.has_issue(Issue::SlowQuery));
    match slow.explain.as_ref().unwrap() {
        ExecutionPlan::Structured(rows) => {
            assert_eq!(rows[0]["statement"], "EXPLAIN SELECT * FROM users")
        }
        other => panic!("unexpected plan {:?}", other),
    }

    let failed = aggregator
        .track(QueryEvent::new("SELECT * FROM users", vec![], 300.0).on("replica"))
        .unwrap();
    assert!(failed.explain.as_ref().unwrap().is_error());

    let fast = aggregator
        .track(QueryEvent::new("SELECT 1", vec![], 1.0))
        .unwrap();
    assert!(fast.explain.is_none());

    let slow_alerts: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|e| e.kind == AlertKind::SlowQuery)
        .collect();
    assert_eq!(slow_alerts.len(), 2);
    assert_eq!(slow_alerts[0].field("sql"), Some(&json!("SELECT * FROM users")));
}

#[test]
fn test_summary_injection_into_response() {
    let dir = TempDir::new().unwrap();
    let engine = QueryLens::new(test_config(&dir)).unwrap();
    let config = engine.config().response.clone();

    let mut aggregator = engine.aggregator();
    aggregator.start(None, RequestMetadata::default());
    aggregator.track(QueryEvent::new("SELECT * FROM posts", vec![], 12.5));
    aggregator.track(QueryEvent::new("SELECT * FROM tags", vec![], 7.5));
    let summary = aggregator.finish().unwrap();

    assert!(!should_inject(&config, None));
    assert!(should_inject(&config, Some("true")));

    let mut body = json!({"posts": []});
    assert!(inject_into(&mut body, &config, &summary));
    assert_eq!(body["_query_debug"]["total_queries"], 2);
    assert_eq!(body["_query_debug"]["total_time_ms"], 20.0);

    let headers = response_headers(&summary);
    assert_eq!(headers[0].1, "2");
    assert_eq!(headers[1].1, "20");
}

#[test]
fn test_high_query_count_alert_on_finish() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.alerts.conditions.query_count_threshold = 5;
    config.n_plus_one.enabled = false;
    let (engine, recorder) = engine_with_recorder(config);

    let mut aggregator = engine.aggregator();
    aggregator.start(None, RequestMetadata::default().with_route("/feed"));
    for i in 0..5i64 {
        aggregator.track(QueryEvent::new("SELECT * FROM items WHERE id=?", vec![i.into()], 1.0));
    }
    assert!(recorder.events().is_empty());

    aggregator.finish();
    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AlertKind::HighQueryCount);
    assert_eq!(events[0].field("route"), Some(&json!("/feed")));
    assert_eq!(
        events[0].field("message"),
        Some(&json!("Request generated 5 queries (threshold: 5)"))
    );
}

#[test]
fn test_tracking_does_not_wait_for_a_locked_store() {
    let dir = TempDir::new().unwrap();
    let engine = QueryLens::new(test_config(&dir)).unwrap();

    // another process holding the store lock
    fs::create_dir_all(dir.path()).unwrap();
    let held = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(dir.path().join(LOCK_FILE_NAME))
        .unwrap();
    held.lock_exclusive().unwrap();

    let mut aggregator = engine.aggregator();
    aggregator.start(None, RequestMetadata::default().with_route("/orders"));

    let started = Instant::now();
    let records: Vec<_> = (0..10i64)
        .map(|id| {
            aggregator
                .track(QueryEvent::new("SELECT * FROM orders WHERE id=?", vec![id.into()], 1.0))
                .unwrap()
        })
        .collect();
    let summary = aggregator.finish().unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(summary.total_queries, 10);

    let date = records[0].timestamp.date_naive();
    assert!(engine.store().read(date, None).is_empty());

    FileExt::unlock(&held).unwrap();
    engine.flush();
    assert_eq!(engine.store().read(date, None), records);
}
