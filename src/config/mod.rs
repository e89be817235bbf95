// Configuration module
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod alerts;
pub mod storage;

pub use alerts::{
    AlertConditions, AlertsConfig, WebhookConfig, LOG_CHANNEL, SLACK_CHANNEL, WEBHOOK_CHANNEL,
};
pub use storage::{BacktraceConfig, StorageConfig};

use crate::constants::{
    DEFAULT_N_PLUS_ONE_THRESHOLD, DEFAULT_N_PLUS_ONE_WINDOW_MS, DEFAULT_RESPONSE_KEY,
    DEFAULT_SAMPLING_PERCENT, DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_SLOW_QUERY_THRESHOLD_MS,
};

/// Connection name that matches every connection
pub const ALL_CONNECTIONS: &str = "*";

fn default_true() -> bool {
    true
}

fn default_connections() -> Vec<String> {
    vec![ALL_CONNECTIONS.to_string()]
}

fn default_slow_query_threshold_ms() -> f64 {
    DEFAULT_SLOW_QUERY_THRESHOLD_MS
}

fn default_sampling() -> u8 {
    DEFAULT_SAMPLING_PERCENT
}

fn default_n_plus_one_threshold() -> usize {
    DEFAULT_N_PLUS_ONE_THRESHOLD
}

fn default_n_plus_one_window_ms() -> u64 {
    DEFAULT_N_PLUS_ONE_WINDOW_MS
}

fn default_similarity_threshold() -> f64 {
    DEFAULT_SIMILARITY_THRESHOLD
}

fn default_response_key() -> String {
    DEFAULT_RESPONSE_KEY.to_string()
}

// Schema introspection and migration bookkeeping issued by drivers and
// migration tools. Matched case-insensitively against the raw SQL.
fn default_exclude_patterns() -> Vec<String> {
    vec![
        r"(?i)^SHOW FULL COLUMNS FROM".to_string(),
        r"(?i)^SHOW TABLES LIKE".to_string(),
        r"(?i)^select \* from .?migrations".to_string(),
        r"(?i)information_schema".to_string(),
        r"(?i)^SELECT DATABASE\(\)".to_string(),
        r"_sqlx_migrations".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Master switch (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Connection names to track; "*" tracks all
    #[serde(default = "default_connections")]
    pub connections: Vec<String>,

    /// Queries at or above this duration are slow (default: 100ms)
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: f64,

    /// Fetch an EXPLAIN plan for slow queries
    #[serde(default)]
    pub analyze_queries: bool,

    /// Fetch an EXPLAIN plan for every query
    #[serde(default)]
    pub analyze_all_queries: bool,

    /// Fetch an EXPLAIN ANALYZE plan for slow queries
    #[serde(default)]
    pub explain_analyze: bool,

    /// Fetch an EXPLAIN ANALYZE plan for every query
    #[serde(default)]
    pub explain_analyze_all_queries: bool,

    /// Percentage of queries tracked, 1-100 (default: 100)
    #[serde(default = "default_sampling")]
    pub sampling: u8,

    /// Regexes; matching queries are neither stored nor counted
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    #[serde(default)]
    pub n_plus_one: NPlusOneConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub backtrace: BacktraceConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub response: ResponseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            connections: default_connections(),
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
            analyze_queries: false,
            analyze_all_queries: false,
            explain_analyze: false,
            explain_analyze_all_queries: false,
            sampling: default_sampling(),
            exclude_patterns: default_exclude_patterns(),
            n_plus_one: NPlusOneConfig::default(),
            alerts: AlertsConfig::default(),
            storage: StorageConfig::default(),
            backtrace: BacktraceConfig::default(),
            metadata: MetadataConfig::default(),
            response: ResponseConfig::default(),
        }
    }
}

/// N+1 detection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NPlusOneConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Executions of one pattern needed to flag a storm (default: 3)
    #[serde(default = "default_n_plus_one_threshold")]
    pub threshold: usize,

    /// First-to-last execution span allowed (default: 100ms)
    #[serde(default = "default_n_plus_one_window_ms")]
    pub time_window_ms: u64,

    /// Percentage above which two patterns count as related (default: 80)
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for NPlusOneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_n_plus_one_threshold(),
            time_window_ms: default_n_plus_one_window_ms(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// Request metadata captured into every record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataConfig {
    #[serde(default = "default_true")]
    pub user_id: bool,

    /// Off unless the host is multi-tenant
    #[serde(default)]
    pub tenant_id: bool,

    #[serde(default = "default_true")]
    pub ip: bool,

    #[serde(default)]
    pub user_agent: bool,

    /// Honor host-supplied request ids (otherwise always generate one)
    #[serde(default = "default_true")]
    pub request_id: bool,

    #[serde(default = "default_true")]
    pub memory_usage: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            user_id: true,
            tenant_id: false,
            ip: true,
            user_agent: false,
            request_id: true,
            memory_usage: true,
        }
    }
}

/// Debug payload injected into responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseConfig {
    #[serde(default)]
    pub inject: bool,

    #[serde(default = "default_response_key")]
    pub response_key: String,

    /// Include every record instead of counts only
    #[serde(default)]
    pub include_full_queries: bool,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            inject: false,
            response_key: default_response_key(),
            include_full_queries: false,
        }
    }
}

impl Config {
    pub fn from_yaml_with_env(yaml: &str) -> Result<Self, String> {
        // Replace ${VAR_NAME} with environment variable values
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").map_err(|e| e.to_string())?;

        let mut missing = Vec::new();
        let substituted = re.replace_all(yaml, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    missing.push(var_name.to_string());
                    String::new()
                }
            }
        });

        if let Some(var_name) = missing.first() {
            return Err(format!(
                "Environment variable '{}' is referenced but not set",
                var_name
            ));
        }

        serde_yaml::from_str(&substituted).map_err(|e| e.to_string())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_yaml_with_env(&yaml)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sampling == 0 || self.sampling > 100 {
            return Err(format!(
                "sampling must be between 1 and 100, got {}",
                self.sampling
            ));
        }

        if !self.slow_query_threshold_ms.is_finite() || self.slow_query_threshold_ms < 0.0 {
            return Err(format!(
                "slow_query_threshold_ms must be a non-negative number, got {}",
                self.slow_query_threshold_ms
            ));
        }

        if self.connections.is_empty() {
            return Err("connections cannot be empty (use \"*\" to track all)".to_string());
        }

        if self.n_plus_one.threshold < 2 {
            return Err(format!(
                "n_plus_one.threshold must be at least 2, got {}",
                self.n_plus_one.threshold
            ));
        }

        if !(0.0..=100.0).contains(&self.n_plus_one.similarity_threshold) {
            return Err(format!(
                "n_plus_one.similarity_threshold must be between 0 and 100, got {}",
                self.n_plus_one.similarity_threshold
            ));
        }

        self.compile_exclusions()?;
        self.alerts.validate()?;

        if self.response.inject && self.response.response_key.is_empty() {
            return Err("response.response_key cannot be empty when inject is enabled".to_string());
        }

        Ok(())
    }

    /// Compile `exclude_patterns`, naming the first invalid entry
    pub fn compile_exclusions(&self) -> Result<Vec<Regex>, String> {
        self.exclude_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| format!("Invalid exclude pattern '{}': {}", pattern, e))
            })
            .collect()
    }

    pub fn tracks_connection(&self, connection: &str) -> bool {
        self.connections
            .iter()
            .any(|c| c == ALL_CONNECTIONS || c == connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(!config.enabled);
        assert!(!config.metadata.tenant_id);
        assert!(!config.metadata.user_agent);
        assert!(config.metadata.user_id);
        assert_eq!(config.sampling, 100);
        assert_eq!(config.slow_query_threshold_ms, 100.0);
        assert_eq!(config.n_plus_one.threshold, 3);
        assert_eq!(config.n_plus_one.time_window_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = Config::from_yaml_with_env("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_can_parse_full_yaml() {
        let yaml = r#"
enabled: true
connections: [primary, reporting]
slow_query_threshold_ms: 250.5
analyze_queries: true
explain_analyze: true
sampling: 25
exclude_patterns:
  - "(?i)^SELECT 1$"
n_plus_one:
  threshold: 5
  time_window_ms: 500
alerts:
  enabled: true
  channels: [log]
storage:
  path: /tmp/querylens
  retention_days: 3
backtrace:
  limit: 4
metadata:
  ip: false
response:
  inject: true
  response_key: debug
"#;
        let config = Config::from_yaml_with_env(yaml).unwrap();
        assert_eq!(config.connections, vec!["primary", "reporting"]);
        assert_eq!(config.slow_query_threshold_ms, 250.5);
        assert!(config.analyze_queries);
        assert!(!config.analyze_all_queries);
        assert!(config.explain_analyze);
        assert_eq!(config.sampling, 25);
        assert_eq!(config.exclude_patterns.len(), 1);
        assert_eq!(config.n_plus_one.threshold, 5);
        assert_eq!(config.n_plus_one.time_window_ms, 500);
        assert!(config.n_plus_one.enabled);
        assert!(config.alerts.enabled);
        assert_eq!(config.storage.retention_days, 3);
        assert_eq!(config.backtrace.limit, 4);
        assert!(!config.metadata.ip);
        assert!(!config.metadata.user_agent);
        assert!(config.response.inject);
        assert_eq!(config.response.response_key, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("QUERYLENS_TEST_WEBHOOK", "https://hooks.example.com/xyz");
        let yaml = r#"
alerts:
  enabled: true
  channels: [webhook]
  webhook:
    url: "${QUERYLENS_TEST_WEBHOOK}"
"#;
        let config = Config::from_yaml_with_env(yaml).unwrap();
        assert_eq!(
            config.alerts.webhook.url.as_deref(),
            Some("https://hooks.example.com/xyz")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        let yaml = "storage:\n  path: \"${QUERYLENS_TEST_UNSET_VARIABLE}\"\n";
        let err = Config::from_yaml_with_env(yaml).unwrap_err();
        assert!(err.contains("QUERYLENS_TEST_UNSET_VARIABLE"));
    }

    #[test]
    fn test_sampling_out_of_range_is_rejected() {
        let config = Config {
            sampling: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            sampling: 101,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_exclusion_regex_is_rejected() {
        let config = Config {
            exclude_patterns: vec!["(unclosed".to_string()],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("(unclosed"));
    }

    #[test]
    fn test_threshold_below_two_is_rejected() {
        let mut config = Config::default();
        config.n_plus_one.threshold = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_exclusions_match_schema_queries() {
        let exclusions = Config::default().compile_exclusions().unwrap();
        let excluded = |sql: &str| exclusions.iter().any(|re| re.is_match(sql));

        assert!(excluded("show full columns from `users`"));
        assert!(excluded("select * from `migrations`"));
        assert!(excluded("SELECT column_name FROM information_schema.columns"));
        assert!(!excluded("SELECT * FROM users WHERE id = 1"));
    }

    #[test]
    fn test_tracks_connection() {
        let config = Config::default();
        assert!(config.tracks_connection("anything"));

        let config = Config {
            connections: vec!["primary".to_string()],
            ..Default::default()
        };
        assert!(config.tracks_connection("primary"));
        assert!(!config.tracks_connection("replica"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("querylens.yaml");
        std::fs::write(&path, "slow_query_threshold_ms: 42\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.slow_query_threshold_ms, 42.0);

        assert!(Config::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
