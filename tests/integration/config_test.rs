// Loading configuration files and building engines from them

use std::io::Write;
use tempfile::NamedTempFile;

use querylens::{Config, QueryLens, QueryLensError};

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn test_engine_from_yaml_file_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("QUERYLENS_IT_WEBHOOK_URL", "http://127.0.0.1:9/hooks/alerts");
    std::env::set_var("QUERYLENS_IT_STORAGE", dir.path().to_str().unwrap());

    let file = write_config(
        r#"
enabled: true
connections: ["primary", "replica"]
slow_query_threshold_ms: 250
sampling: 50
n_plus_one:
  threshold: 5
  time_window_ms: 200
alerts:
  enabled: true
  channels: ["log", "slack"]
  conditions:
    query_count_threshold: 0
  webhook:
    url: "${QUERYLENS_IT_WEBHOOK_URL}"
    timeout_ms: 500
storage:
  path: "${QUERYLENS_IT_STORAGE}"
  retention_days: 3
backtrace:
  enabled: false
"#,
    );

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.connections, vec!["primary", "replica"]);
    assert_eq!(config.slow_query_threshold_ms, 250.0);
    assert_eq!(config.sampling, 50);
    assert_eq!(config.n_plus_one.threshold, 5);
    assert_eq!(config.n_plus_one.similarity_threshold, 80.0);
    assert_eq!(
        config.alerts.webhook.url.as_deref(),
        Some("http://127.0.0.1:9/hooks/alerts")
    );
    assert_eq!(config.storage.path, dir.path());
    assert!(!config.exclude_patterns.is_empty());

    let engine = QueryLens::new(config).unwrap();
    assert_eq!(engine.store().retention_days(), 3);
    assert!(engine.config().tracks_connection("replica"));
    assert!(!engine.config().tracks_connection("analytics"));
}

#[test]
fn test_missing_env_var_is_reported() {
    let file = write_config("storage:\n  path: \"${QUERYLENS_IT_NEVER_SET}\"\n");
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.contains("QUERYLENS_IT_NEVER_SET"));
}

#[test]
fn test_invalid_configurations_fail_at_startup() {
    let cases = [
        "sampling: 0\n",
        "sampling: 101\n",
        "exclude_patterns: [\"(unclosed\"]\n",
        "alerts:\n  enabled: true\n  channels: [webhook]\n",
        "n_plus_one:\n  threshold: 1\n",
    ];

    for yaml in cases {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = QueryLens::new(config).unwrap_err();
        assert!(
            matches!(err, QueryLensError::Config(_)),
            "expected config error for {:?}, got {:?}",
            yaml,
            err
        );
    }
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = write_config("{}\n");
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config, Config::default());
}
