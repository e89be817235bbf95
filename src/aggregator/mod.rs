//! Request-scoped aggregation
//!
//! A [`RequestAggregator`] owns the state of one logical request at a time:
//! its id, metadata, the records tracked so far and a fresh
//! [`PatternTracker`]. It moves between two states:
//!
//! ```text
//! Idle --start--> Active --finish--> Idle
//! ```
//!
//! Events arriving while idle are ignored. Each concurrency unit (thread,
//! task, worker) uses its own aggregator, so no request state is ever
//! shared. [`RequestScope`] guarantees `finish` runs even when the handler
//! unwinds.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use crate::backtrace::find_origin;
use crate::config::{Config, MetadataConfig};
use crate::engine::Shared;
use crate::metrics::QueryLensMetrics;
use crate::normalizer::is_plan_statement;
use crate::plan::ExecutionPlan;
use crate::record::{round2, BindingValue, NPlusOnePattern, QueryRecord, RequestMetadata};
use crate::resources::peak_memory_mb;
use crate::tracker::{DetectedPattern, PatternTracker};

pub mod inject;
pub mod registry;

pub use registry::RequestRegistry;

/// Query execution reported by the host
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
    pub sql: String,
    pub bindings: Vec<BindingValue>,
    pub time_ms: f64,
    pub connection: String,
}

impl QueryEvent {
    pub fn new(sql: impl Into<String>, bindings: Vec<BindingValue>, time_ms: f64) -> Self {
        Self {
            sql: sql.into(),
            bindings,
            time_ms,
            connection: "default".to_string(),
        }
    }

    pub fn on(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }
}

type SqlPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Decides which statements are neither stored nor counted
///
/// Plan statements (`EXPLAIN ...`) are always excluded so introspection
/// never feeds back into the log.
#[derive(Clone, Default)]
pub struct ExclusionFilter {
    patterns: Vec<Regex>,
    predicates: Vec<SqlPredicate>,
}

impl ExclusionFilter {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self {
            patterns,
            predicates: Vec::new(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, String> {
        Ok(Self::new(config.compile_exclusions()?))
    }

    /// Add a host-defined exclusion rule
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn is_excluded(&self, sql: &str) -> bool {
        is_plan_statement(sql)
            || self.patterns.iter().any(|re| re.is_match(sql))
            || self.predicates.iter().any(|p| p(sql))
    }
}

impl fmt::Debug for ExclusionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusionFilter")
            .field("patterns", &self.patterns)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

/// Slow query as reported in summaries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowQuerySummary {
    pub sql: String,
    pub time_ms: f64,
    pub formatted_sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ExecutionPlan>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestSummary {
    pub request_id: String,
    pub total_queries: usize,
    pub total_time_ms: f64,
    pub slow_queries_count: usize,
    /// Records flagged as part of an N+1 storm
    pub n_plus_one_count: usize,
    pub slow_queries: Vec<SlowQuerySummary>,
    /// One entry per distinct pattern, with its latest count
    pub n_plus_one_patterns: Vec<NPlusOnePattern>,
    pub detected_patterns: Vec<DetectedPattern>,
    pub queries: Vec<QueryRecord>,
    pub duration_ms: f64,
}

/// State of the request currently being tracked
pub struct RequestContext {
    pub request_id: String,
    pub started: Instant,
    pub metadata: RequestMetadata,
    queries: Vec<QueryRecord>,
    tracker: PatternTracker,
}

impl RequestContext {
    pub fn queries(&self) -> &[QueryRecord] {
        &self.queries
    }

    pub fn tracker(&self) -> &PatternTracker {
        &self.tracker
    }

    fn summary(&self) -> RequestSummary {
        let mut n_plus_one_patterns: Vec<NPlusOnePattern> = Vec::new();
        for pattern in self.queries.iter().filter_map(|q| q.n_plus_one.as_ref()) {
            match n_plus_one_patterns
                .iter_mut()
                .find(|p| p.query_pattern == pattern.query_pattern)
            {
                Some(existing) => *existing = pattern.clone(),
                None => n_plus_one_patterns.push(pattern.clone()),
            }
        }

        let slow_queries: Vec<SlowQuerySummary> = self
            .queries
            .iter()
            .filter(|q| q.slow_query)
            .map(|q| SlowQuerySummary {
                sql: q.sql.clone(),
                time_ms: q.time_ms,
                formatted_sql: q.formatted_sql.clone(),
                explain: q.explain.clone(),
            })
            .collect();

        RequestSummary {
            request_id: self.request_id.clone(),
            total_queries: self.queries.len(),
            total_time_ms: round2(self.queries.iter().map(|q| q.time_ms).sum()),
            slow_queries_count: slow_queries.len(),
            n_plus_one_count: self
                .queries
                .iter()
                .filter(|q| q.n_plus_one.is_some())
                .count(),
            slow_queries,
            n_plus_one_patterns,
            detected_patterns: self.tracker.detected_patterns(),
            queries: self.queries.clone(),
            duration_ms: round2(self.started.elapsed().as_secs_f64() * 1000.0),
        }
    }
}

enum RequestState {
    Idle,
    Active(Box<RequestContext>),
}

pub struct RequestAggregator {
    shared: Arc<Shared>,
    state: RequestState,
}

impl RequestAggregator {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            state: RequestState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, RequestState::Active(_))
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().map(|ctx| ctx.request_id.as_str())
    }

    pub fn context(&self) -> Option<&RequestContext> {
        match &self.state {
            RequestState::Active(ctx) => Some(&**ctx),
            RequestState::Idle => None,
        }
    }

    /// Begin a request and return its id
    ///
    /// A missing id (or one the configuration says to ignore) is replaced
    /// by a random UUID. Starting while a request is active finishes the
    /// previous one first.
    pub fn start(&mut self, request_id: Option<String>, metadata: RequestMetadata) -> String {
        if self.is_active() {
            tracing::debug!(
                request_id = self.request_id().unwrap_or_default(),
                "Request started while another was active, finishing it first"
            );
            self.finish();
        }

        let config = &self.shared.config;
        let request_id = request_id
            .filter(|id| config.metadata.request_id && !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let context = RequestContext {
            request_id: request_id.clone(),
            started: Instant::now(),
            metadata: apply_metadata_settings(metadata, &config.metadata),
            queries: Vec::new(),
            tracker: self.shared.new_tracker(),
        };
        self.state = RequestState::Active(Box::new(context));
        request_id
    }

    /// Start a request that finishes when the returned guard drops
    pub fn scope(
        &mut self,
        request_id: Option<String>,
        metadata: RequestMetadata,
    ) -> RequestScope<'_> {
        self.start(request_id, metadata);
        RequestScope { aggregator: self }
    }

    /// Track one query execution, timed now
    pub fn track(&mut self, event: QueryEvent) -> Option<QueryRecord> {
        self.track_at(event, Instant::now())
    }

    /// Track one query execution that happened at `at`
    ///
    /// Returns the classified record, or `None` when the event was skipped
    /// (disabled, sampled out, idle, untracked connection or excluded).
    pub fn track_at(&mut self, event: QueryEvent, at: Instant) -> Option<QueryRecord> {
        let shared = Arc::clone(&self.shared);
        let metrics = QueryLensMetrics::global();

        if !shared.config.enabled {
            return None;
        }

        if !shared.sampler.should_sample() {
            metrics.queries_sampled_out.inc();
            return None;
        }

        let ctx = match &mut self.state {
            RequestState::Active(ctx) => ctx,
            RequestState::Idle => {
                tracing::debug!(
                    connection = %event.connection,
                    "Query outside an active request ignored"
                );
                return None;
            }
        };

        if !shared.config.tracks_connection(&event.connection) {
            return None;
        }

        if shared.exclusions.is_excluded(&event.sql) {
            metrics.queries_excluded.inc();
            return None;
        }

        let frames = shared.backtrace.collect();
        let source = find_origin(&frames, &shared.origin);

        let record = QueryRecord::new(
            ctx.request_id.clone(),
            event.connection,
            event.sql,
            event.bindings,
            event.time_ms,
        )
        .with_metadata(ctx.metadata.clone())
        .with_backtrace(frames, source);

        let record = ctx.tracker.observe_at(record, at);
        metrics.queries_tracked.inc();

        shared.writer.submit(record.clone());
        if record.slow_query {
            shared.alerts.alert_slow_query(&record);
        }

        ctx.queries.push(record.clone());
        Some(record)
    }

    /// Summary of the active request; empty when idle
    pub fn summary(&self) -> RequestSummary {
        self.context()
            .map(RequestContext::summary)
            .unwrap_or_default()
    }

    /// End the active request
    ///
    /// Evaluates the high-query-count alert with the final count, returns
    /// the summary and clears all request state.
    pub fn finish(&mut self) -> Option<RequestSummary> {
        let ctx = match std::mem::replace(&mut self.state, RequestState::Idle) {
            RequestState::Active(ctx) => ctx,
            RequestState::Idle => return None,
        };

        let summary = ctx.summary();
        QueryLensMetrics::global()
            .queries_per_request
            .observe(summary.total_queries as f64);
        self.shared
            .alerts
            .alert_high_query_count(summary.total_queries, ctx.metadata.route_or_unknown());

        tracing::debug!(
            request_id = %summary.request_id,
            total_queries = summary.total_queries,
            total_time_ms = summary.total_time_ms,
            slow_queries = summary.slow_queries_count,
            n_plus_one = summary.n_plus_one_count,
            "Request finished"
        );

        Some(summary)
    }
}

impl fmt::Debug for RequestAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestAggregator")
            .field("request_id", &self.request_id())
            .finish()
    }
}

/// Active request that finishes on drop, including during unwinding
pub struct RequestScope<'a> {
    aggregator: &'a mut RequestAggregator,
}

impl RequestScope<'_> {
    /// Finish now and return the summary
    pub fn finish(mut self) -> Option<RequestSummary> {
        self.aggregator.finish()
    }
}

impl Deref for RequestScope<'_> {
    type Target = RequestAggregator;

    fn deref(&self) -> &Self::Target {
        self.aggregator
    }
}

impl DerefMut for RequestScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.aggregator
    }
}

impl Drop for RequestScope<'_> {
    fn drop(&mut self) {
        if self.aggregator.is_active() {
            self.aggregator.finish();
        }
    }
}

fn apply_metadata_settings(
    mut metadata: RequestMetadata,
    settings: &MetadataConfig,
) -> RequestMetadata {
    if !settings.user_id {
        metadata.user_id = None;
    }
    if !settings.tenant_id {
        metadata.tenant_id = None;
    }
    if !settings.ip {
        metadata.ip = None;
    }
    if !settings.user_agent {
        metadata.user_agent = None;
    }
    metadata.memory_mb = if settings.memory_usage {
        metadata.memory_mb.or_else(peak_memory_mb)
    } else {
        None
    };
    metadata
}
