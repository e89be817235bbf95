//! Storage and backtrace configuration types.
//!
//! Default values for file sizes and retention are sourced from
//! `crate::constants` to maintain centralized configuration defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_BACKTRACE_LIMIT, DEFAULT_MAX_FILE_SIZE_MB, DEFAULT_RETENTION_DAYS,
    DEFAULT_STORAGE_PATH,
};

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

fn default_max_file_size_mb() -> u64 {
    DEFAULT_MAX_FILE_SIZE_MB
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_backtrace_limit() -> usize {
    DEFAULT_BACKTRACE_LIMIT
}

fn default_true() -> bool {
    true
}

fn default_exclude_paths() -> Vec<String> {
    vec![
        "/rustc/".to_string(),
        "/.cargo/registry/".to_string(),
        "/.cargo/git/".to_string(),
        "library/std/".to_string(),
        "library/core/".to_string(),
    ]
}

/// Log store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory holding the period files
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Maximum file size in MB before rotation (default: 50)
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Days of logs kept by cleanup (default: 7)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            max_file_size_mb: default_max_file_size_mb(),
            retention_days: default_retention_days(),
        }
    }
}

impl StorageConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Backtrace capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BacktraceConfig {
    /// Capture call stacks for each tracked query (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum frames kept per query (default: 10)
    #[serde(default = "default_backtrace_limit")]
    pub limit: usize,

    /// Frames whose file path contains any of these fragments are dropped
    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: Vec<String>,

    /// Prefix stripped from file paths (default: current directory)
    #[serde(default)]
    pub project_root: Option<PathBuf>,
}

impl Default for BacktraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: default_backtrace_limit(),
            exclude_paths: default_exclude_paths(),
            project_root: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.path, PathBuf::from("storage/logs/queries"));
        assert_eq!(config.max_file_size_mb, 50);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.max_file_size_bytes(), 50 * 1024 * 1024);
    }

    #[test]
    fn test_backtrace_defaults_exclude_toolchain_frames() {
        let config = BacktraceConfig::default();
        assert!(config.enabled);
        assert_eq!(config.limit, 10);
        assert!(config.exclude_paths.iter().any(|p| p == "/rustc/"));
        assert!(config.exclude_paths.iter().any(|p| p == "/.cargo/registry/"));
    }

    #[test]
    fn test_can_parse_storage_yaml() {
        let yaml = r#"
path: /var/log/querylens
max_file_size_mb: 5
"#;
        let config: StorageConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.path, PathBuf::from("/var/log/querylens"));
        assert_eq!(config.max_file_size_mb, 5);
        assert_eq!(config.retention_days, 7);
    }
}
