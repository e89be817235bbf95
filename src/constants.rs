// Constants module - centralized default values for configuration
//
// This module defines all default values used throughout the codebase.
// Using constants instead of magic numbers improves maintainability
// and makes it easier to understand and modify defaults.

// =============================================================================
// Classification defaults
// =============================================================================

/// Default slow query threshold in milliseconds
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: f64 = 100.0;

/// Default number of executions of one pattern before it counts as N+1
pub const DEFAULT_N_PLUS_ONE_THRESHOLD: usize = 3;

/// Default N+1 time window in milliseconds
pub const DEFAULT_N_PLUS_ONE_WINDOW_MS: u64 = 100;

/// Default similarity percentage for related queries
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 80.0;

/// Prefix length used when computing query similarity
pub const SIMILARITY_PREFIX_LEN: usize = 255;

// =============================================================================
// Sampling defaults
// =============================================================================

/// Default sampling percentage (100 = every query)
pub const DEFAULT_SAMPLING_PERCENT: u8 = 100;

// =============================================================================
// Storage defaults
// =============================================================================

/// Default storage directory for query logs
pub const DEFAULT_STORAGE_PATH: &str = "storage/logs/queries";

/// Default maximum log file size in megabytes
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 50;

/// Default retention in days
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Prefix shared by every period file
pub const LOG_FILE_PREFIX: &str = "queries-";

/// Name of the advisory lock file inside the storage directory
pub const LOCK_FILE_NAME: &str = ".querylens.lock";

/// Capacity of the background writer queue; records beyond it are dropped
pub const STORE_QUEUE_CAPACITY: usize = 4096;

/// Most records written in one locked append
pub const STORE_BATCH_MAX: usize = 512;

// =============================================================================
// Backtrace defaults
// =============================================================================

/// Default maximum number of frames kept per query
pub const DEFAULT_BACKTRACE_LIMIT: usize = 10;

// =============================================================================
// Alert defaults
// =============================================================================

/// Default per-request query count that triggers a high query count alert
pub const DEFAULT_QUERY_COUNT_THRESHOLD: usize = 50;

/// Default webhook request timeout in milliseconds
pub const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 2000;

/// Maximum characters per field in a webhook payload
pub const WEBHOOK_FIELD_MAX_CHARS: usize = 500;

/// Capacity of the webhook delivery queue
pub const WEBHOOK_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// Response injection defaults
// =============================================================================

/// Default key used when attaching a summary to a response body
pub const DEFAULT_RESPONSE_KEY: &str = "_query_debug";

/// Header carrying the total query count
pub const QUERY_COUNT_HEADER: &str = "X-Query-Count";

/// Header carrying the total query time in milliseconds
pub const QUERY_TIME_HEADER: &str = "X-Query-Time-Ms";

/// Request header that opts a single request into injection
pub const DEBUG_REQUEST_HEADER: &str = "X-Query-Debug";

// =============================================================================
// Analysis defaults
// =============================================================================

/// Default number of records considered by the analyze command
pub const DEFAULT_ANALYZE_LIMIT: usize = 50;

/// Maximum rows shown per table in analysis output
pub const ANALYSIS_TABLE_ROWS: usize = 20;
