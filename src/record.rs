//! Query record data model
//!
//! Every type persisted to the JSON log or attached to an alert lives here.
//! Records are built once by the request aggregator, classified by the
//! pattern tracker and never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::plan::ExecutionPlan;

/// A bound parameter value as supplied by the query event source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindingValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for BindingValue {
    fn from(value: &str) -> Self {
        BindingValue::Text(value.to_string())
    }
}

impl From<String> for BindingValue {
    fn from(value: String) -> Self {
        BindingValue::Text(value)
    }
}

impl From<i64> for BindingValue {
    fn from(value: i64) -> Self {
        BindingValue::Int(value)
    }
}

impl From<i32> for BindingValue {
    fn from(value: i32) -> Self {
        BindingValue::Int(value as i64)
    }
}

impl From<f64> for BindingValue {
    fn from(value: f64) -> Self {
        BindingValue::Float(value)
    }
}

impl From<bool> for BindingValue {
    fn from(value: bool) -> Self {
        BindingValue::Bool(value)
    }
}

impl<T: Into<BindingValue>> From<Option<T>> for BindingValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(BindingValue::Null)
    }
}

/// One stack frame kept in a query backtrace
///
/// Binaries built without debug info resolve symbols but no locations, so
/// `file` and `line` are optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Project-relative source file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,

    /// Type path the function belongs to (`app::repositories::UserRepository`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// Issues raised while classifying a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Issue {
    SlowQuery,
    NPlusOne,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::SlowQuery => write!(f, "slow_query"),
            Issue::NPlusOne => write!(f, "n_plus_one"),
        }
    }
}

/// A detected N+1 storm for one pattern within one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NPlusOnePattern {
    /// Normalized SQL of the repeated query
    pub query_pattern: String,

    /// Executions seen so far in this request
    pub count: usize,

    /// Route or other request identifier
    pub route: String,

    /// First application-layer frame of the first execution
    #[serde(default)]
    pub location: Option<String>,

    pub suggestion: String,
}

/// Request-level metadata copied onto every record of the request
///
/// Each field is only populated when the matching metadata toggle is on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Peak resident memory in megabytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
}

impl RequestMetadata {
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: f64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    /// Route used in alerts and N+1 patterns, `unknown` when absent
    pub fn route_or_unknown(&self) -> &str {
        self.route.as_deref().unwrap_or("unknown")
    }
}

/// One executed statement with its classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub timestamp: DateTime<Utc>,

    pub request_id: String,

    pub connection: String,

    pub sql: String,

    #[serde(default)]
    pub bindings: Vec<BindingValue>,

    /// Execution time in milliseconds, rounded to two decimals
    pub time_ms: f64,

    #[serde(default)]
    pub normalized: String,

    #[serde(default)]
    pub query_hash: String,

    #[serde(default)]
    pub formatted_sql: String,

    #[serde(default)]
    pub backtrace: Vec<Frame>,

    /// Application-layer origin (`Type::method`)
    #[serde(default)]
    pub source: Option<String>,

    #[serde(flatten)]
    pub metadata: RequestMetadata,

    #[serde(default)]
    pub slow_query: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_plus_one: Option<NPlusOnePattern>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<ExecutionPlan>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain_analyze: Option<ExecutionPlan>,

    #[serde(default)]
    pub issues: Vec<Issue>,
}

impl QueryRecord {
    /// Create an unclassified record
    ///
    /// Derived fields (`normalized`, `query_hash`, `formatted_sql`) are
    /// computed here so every record carries them regardless of which
    /// path built it.
    pub fn new(
        request_id: impl Into<String>,
        connection: impl Into<String>,
        sql: impl Into<String>,
        bindings: Vec<BindingValue>,
        time_ms: f64,
    ) -> Self {
        let sql = sql.into();
        let normalized = crate::normalizer::normalize(&sql);
        let query_hash = crate::normalizer::hash_normalized(&normalized);
        let formatted_sql = crate::normalizer::format(&sql, &bindings);

        Self {
            timestamp: Utc::now(),
            request_id: request_id.into(),
            connection: connection.into(),
            sql,
            bindings,
            time_ms: round2(time_ms),
            normalized,
            query_hash,
            formatted_sql,
            backtrace: Vec::new(),
            source: None,
            metadata: RequestMetadata::default(),
            slow_query: false,
            n_plus_one: None,
            explain: None,
            explain_analyze: None,
            issues: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_backtrace(mut self, backtrace: Vec<Frame>, source: Option<String>) -> Self {
        self.backtrace = backtrace;
        self.source = source;
        self
    }

    pub fn has_issue(&self, issue: Issue) -> bool {
        self.issues.contains(&issue)
    }
}

/// Round to two decimals, the precision kept for timings
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
