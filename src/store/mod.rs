//! Append-only, date-partitioned JSON log of query records
//!
//! One pretty-printed JSON array per day (`queries-YYYY-MM-DD.json`).
//! Oversized files are renamed to a timestamped sibling and the next append
//! starts a fresh array. Every read-modify-write-rotate cycle runs under an
//! exclusive advisory lock on a sidecar file in the same directory, so
//! concurrent writers in one or several processes never interleave.
//!
//! The engine never appends on the request path; [`StoreWriter`] queues
//! records for a background thread that appends them in batches.

use chrono::{Duration, NaiveDate, Utc};
use fs2::FileExt;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::config::StorageConfig;
use crate::constants::{LOCK_FILE_NAME, LOG_FILE_PREFIX};
use crate::metrics::QueryLensMetrics;
use crate::record::QueryRecord;

pub mod writer;

pub use writer::StoreWriter;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt query log {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

fn log_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^queries-(\d{4}-\d{2}-\d{2})(?:-\d+)?\.json$").expect("valid log file regex")
    })
}

/// Date embedded in a log file name, current or rotated
pub fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let caps = log_file_regex().captures(name)?;
    NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok()
}

/// Held for the duration of one locked section
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "Failed to release store lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogStore {
    dir: PathBuf,
    max_file_size_bytes: u64,
    retention_days: u32,
}

impl LogStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            dir: config.path.clone(),
            max_file_size_bytes: config.max_file_size_bytes(),
            retention_days: config.retention_days,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Path of the current (unrotated) file for `date`
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}{}.json", LOG_FILE_PREFIX, date.format("%Y-%m-%d")))
    }

    /// Persist one record, logging and swallowing any failure
    pub fn append(&self, record: &QueryRecord) {
        self.append_batch(std::slice::from_ref(record));
    }

    /// Persist `records`, logging and swallowing any failure
    pub fn append_batch(&self, records: &[QueryRecord]) {
        if let Err(e) = self.try_append_batch(records) {
            QueryLensMetrics::global()
                .store_failures
                .inc_by(records.len() as u64);
            tracing::error!(
                error = %e,
                dir = %self.dir.display(),
                records = records.len(),
                "Failed to persist query records"
            );
        }
    }

    /// Persist one record into the file for its timestamp's day
    pub fn try_append(&self, record: &QueryRecord) -> Result<(), StoreError> {
        self.try_append_batch(std::slice::from_ref(record))
    }

    /// Persist `records`, each into the file for its timestamp's day
    ///
    /// One lock acquisition for the whole batch and one rewrite per day
    /// file; records keep their order within a day.
    pub fn try_append_batch(&self, records: &[QueryRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        let _lock = self.lock()?;

        let mut by_day: BTreeMap<NaiveDate, Vec<&QueryRecord>> = BTreeMap::new();
        for record in records {
            by_day
                .entry(record.timestamp.date_naive())
                .or_default()
                .push(record);
        }

        for (date, day_records) in by_day {
            let path = self.path_for(date);
            let mut values = load_for_append(&path)?;
            for record in day_records {
                values.push(serde_json::to_value(record)?);
            }

            write_atomically(&path, &serde_json::to_vec_pretty(&values)?)?;
            self.rotate_if_oversized(&path)?;
        }

        Ok(())
    }

    fn lock(&self) -> Result<StoreLock, StoreError> {
        let path = self.dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.lock_exclusive()
            .map_err(|source| StoreError::Lock { path, source })?;
        Ok(StoreLock { file })
    }

    /// Rename `path` to a timestamped sibling when it exceeds the size cap
    ///
    /// Returns the new path when a rotation happened. Callers must hold the
    /// store lock.
    pub fn rotate_if_oversized(&self, path: &Path) -> Result<Option<PathBuf>, StoreError> {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if size <= self.max_file_size_bytes {
            return Ok(None);
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let millis = Utc::now().timestamp_millis();

        let mut rotated = path.with_file_name(format!("{}-{}.json", stem, millis));
        let mut bump = 1;
        while rotated.exists() {
            rotated = path.with_file_name(format!("{}-{}.json", stem, millis + bump));
            bump += 1;
        }

        fs::rename(path, &rotated)?;
        tracing::info!(
            from = %path.display(),
            to = %rotated.display(),
            size_bytes = size,
            "Rotated query log"
        );
        Ok(Some(rotated))
    }

    /// Delete log files older than `retention_days` days, counted from today
    pub fn cleanup(&self, retention_days: u32) -> usize {
        self.cleanup_as_of(Utc::now().date_naive(), retention_days)
    }

    /// Delete log files whose date is before `today - retention_days`
    ///
    /// Files with names that do not carry a date are left alone.
    pub fn cleanup_as_of(&self, today: NaiveDate, retention_days: u32) -> usize {
        let cutoff = today - Duration::days(i64::from(retention_days));
        let mut deleted = 0;

        let _lock = match fs::create_dir_all(&self.dir)
            .map_err(StoreError::from)
            .and_then(|_| self.lock())
        {
            Ok(lock) => lock,
            Err(e) => {
                tracing::error!(error = %e, dir = %self.dir.display(), "Cleanup skipped");
                return 0;
            }
        };

        for path in self.log_files() {
            let Some(date) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(date_from_file_name)
            else {
                continue;
            };

            if date >= cutoff {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!(path = %path.display(), "Deleted expired query log");
                }
                Err(e) => {
                    tracing::error!(error = %e, path = %path.display(), "Failed to delete query log")
                }
            }
        }

        deleted
    }

    /// Records of the current file for `date`, first `limit` only
    ///
    /// Missing, empty or corrupt files read as empty; a corrupt file is
    /// left in place.
    pub fn read(&self, date: NaiveDate, limit: Option<usize>) -> Vec<QueryRecord> {
        let path = self.path_for(date);
        let values = load_records(&path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, path = %path.display(), "Failed to read query log");
            Vec::new()
        });
        let limit = limit.unwrap_or(usize::MAX);

        values
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<QueryRecord>(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "Skipping unreadable record");
                    None
                }
            })
            .take(limit)
            .collect()
    }

    /// All `queries-*.json` files in the store directory, sorted by name
    pub fn log_files(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(LOG_FILE_PREFIX) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }
}

/// Records of a period file; missing or blank files are empty
///
/// Every other failure is returned so a writer never replaces a file it
/// could not read.
fn load_records(path: &Path) -> Result<Vec<serde_json::Value>, StoreError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    if content.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }

    serde_json::from_slice::<Vec<serde_json::Value>>(&content).map_err(|source| {
        StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Existing array for an append; a corrupt file is moved aside and a new
/// array started
fn load_for_append(path: &Path) -> Result<Vec<serde_json::Value>, StoreError> {
    match load_records(path) {
        Err(StoreError::Corrupt { path, source }) => {
            let aside = set_aside(&path)?;
            tracing::warn!(
                error = %source,
                path = %path.display(),
                moved_to = %aside.display(),
                "Query log is corrupt, moved aside and starting a new array"
            );
            Ok(Vec::new())
        }
        other => other,
    }
}

/// Rename `path` to `<name>.corrupt-<millis>`, which no reader picks up
fn set_aside(path: &Path) -> Result<PathBuf, StoreError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let aside = path.with_file_name(format!(
        "{}.corrupt-{}",
        name,
        Utc::now().timestamp_millis()
    ));
    fs::rename(path, &aside)?;
    Ok(aside)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
