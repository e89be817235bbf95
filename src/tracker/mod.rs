//! Per-request pattern tracking and classification
//!
//! A [`PatternTracker`] lives for exactly one request. It groups executions
//! by the hash of their normalized SQL and classifies each incoming record:
//!
//! - slow: `time_ms >= slow_query_threshold_ms`
//! - N+1: the pattern has at least `threshold` executions, the first and
//!   last are at most `time_window_ms` apart and at least two distinct
//!   binding sets were seen
//!
//! The N+1 alert for a pattern fires once, on the first execution that
//! classifies as N+1. Later executions still carry the pattern on their
//! record but do not alert again.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alert::AlertDispatcher;
use crate::backtrace::{find_origin_location, OriginMatcher};
use crate::config::{Config, NPlusOneConfig};
use crate::metrics::QueryLensMetrics;
use crate::normalizer;
use crate::plan::{introspect, ExecutionPlan, ExplainMode, PlanProvider};
use crate::record::{BindingValue, Frame, Issue, NPlusOnePattern, QueryRecord};

/// Classification settings, resolved once from [`Config`]
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    pub slow_query_threshold_ms: f64,
    pub analyze_queries: bool,
    pub analyze_all_queries: bool,
    pub explain_analyze: bool,
    pub explain_analyze_all_queries: bool,
    pub n_plus_one: NPlusOneConfig,
}

impl TrackerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            slow_query_threshold_ms: config.slow_query_threshold_ms,
            analyze_queries: config.analyze_queries,
            analyze_all_queries: config.analyze_all_queries,
            explain_analyze: config.explain_analyze,
            explain_analyze_all_queries: config.explain_analyze_all_queries,
            n_plus_one: config.n_plus_one.clone(),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.n_plus_one.time_window_ms)
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One execution of a pattern
#[derive(Debug, Clone)]
pub struct Execution {
    pub bindings: Vec<BindingValue>,
    pub at: Instant,
    pub backtrace: Vec<Frame>,
}

/// Execution history of one normalized pattern within a request
#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub normalized: String,
    pub sql: String,
    executions: Vec<Execution>,
    binding_keys: HashSet<String>,
    alerted: bool,
}

impl PatternEntry {
    fn new(normalized: &str, sql: &str) -> Self {
        Self {
            normalized: normalized.to_string(),
            sql: sql.to_string(),
            executions: Vec::new(),
            binding_keys: HashSet::new(),
            alerted: false,
        }
    }

    /// Record an execution; its parameter set is the raw statement plus its
    /// bindings, so inlined literals count as distinct parameters too
    fn push(&mut self, sql: &str, execution: Execution) {
        let key = serde_json::to_string(&(sql, &execution.bindings)).unwrap_or_default();
        self.binding_keys.insert(key);
        self.executions.push(execution);
    }

    pub fn count(&self) -> usize {
        self.executions.len()
    }

    pub fn executions(&self) -> &[Execution] {
        &self.executions
    }

    pub fn distinct_binding_sets(&self) -> usize {
        self.binding_keys.len()
    }

    /// Time between the first and the last execution
    pub fn span(&self) -> Duration {
        match (self.executions.first(), self.executions.last()) {
            (Some(first), Some(last)) => last.at.saturating_duration_since(first.at),
            _ => Duration::ZERO,
        }
    }

    pub fn alerted(&self) -> bool {
        self.alerted
    }
}

/// Pattern that met the execution threshold, for request summaries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedPattern {
    pub query_pattern: String,
    pub count: usize,
    pub executions: usize,

    /// Other tracked patterns at or above the similarity threshold
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}

pub struct PatternTracker {
    settings: Arc<TrackerSettings>,
    plan_provider: Arc<dyn PlanProvider>,
    alerts: Arc<AlertDispatcher>,
    origin: OriginMatcher,
    entries: HashMap<String, PatternEntry>,
}

impl PatternTracker {
    pub fn new(
        settings: Arc<TrackerSettings>,
        plan_provider: Arc<dyn PlanProvider>,
        alerts: Arc<AlertDispatcher>,
        origin: OriginMatcher,
    ) -> Self {
        Self {
            settings,
            plan_provider,
            alerts,
            origin,
            entries: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Classify `record` as executed now
    pub fn observe(&mut self, record: QueryRecord) -> QueryRecord {
        self.observe_at(record, Instant::now())
    }

    /// Classify `record` as executed at `at`
    pub fn observe_at(&mut self, mut record: QueryRecord, at: Instant) -> QueryRecord {
        let settings = Arc::clone(&self.settings);

        record.slow_query = record.time_ms >= settings.slow_query_threshold_ms;
        if record.slow_query {
            QueryLensMetrics::global().slow_queries.inc();
        }

        if (record.slow_query && settings.analyze_queries) || settings.analyze_all_queries {
            record.explain = self.plan_for(&record, ExplainMode::Explain);
        }
        if (record.slow_query && settings.explain_analyze) || settings.explain_analyze_all_queries {
            record.explain_analyze = self.plan_for(&record, ExplainMode::Analyze);
        }

        if settings.n_plus_one.enabled {
            record.n_plus_one = self.detect_n_plus_one(&record, at);
        }

        record.issues.clear();
        if record.slow_query {
            record.issues.push(Issue::SlowQuery);
        }
        if record.n_plus_one.is_some() {
            record.issues.push(Issue::NPlusOne);
        }

        record
    }

    fn plan_for(&self, record: &QueryRecord, mode: ExplainMode) -> Option<ExecutionPlan> {
        introspect(
            self.plan_provider.as_ref(),
            &record.sql,
            &record.bindings,
            &record.connection,
            mode,
        )
    }

    fn detect_n_plus_one(&mut self, record: &QueryRecord, at: Instant) -> Option<NPlusOnePattern> {
        let threshold = self.settings.n_plus_one.threshold;
        let window = self.settings.window();

        let entry = self
            .entries
            .entry(record.query_hash.clone())
            .or_insert_with(|| PatternEntry::new(&record.normalized, &record.sql));
        entry.push(
            &record.sql,
            Execution {
                bindings: record.bindings.clone(),
                at,
                backtrace: record.backtrace.clone(),
            },
        );

        if entry.count() < threshold
            || entry.span() > window
            || entry.distinct_binding_sets() < 2
        {
            return None;
        }

        let location = entry
            .executions
            .first()
            .and_then(|first| find_origin_location(&first.backtrace, &self.origin));

        let pattern = NPlusOnePattern {
            query_pattern: entry.normalized.clone(),
            count: entry.count(),
            route: record.metadata.route_or_unknown().to_string(),
            location,
            suggestion: suggest_batching(&entry.sql),
        };

        if !entry.alerted {
            entry.alerted = true;
            QueryLensMetrics::global().n_plus_one_detected.inc();
            tracing::debug!(
                pattern = %pattern.query_pattern,
                count = pattern.count,
                route = %pattern.route,
                "N+1 pattern detected"
            );
            self.alerts.alert_n_plus_one(&pattern);
        }

        Some(pattern)
    }

    /// Patterns with at least `threshold` executions, most frequent first
    pub fn detected_patterns(&self) -> Vec<DetectedPattern> {
        let threshold = self.settings.n_plus_one.threshold;
        let similarity_threshold = self.settings.n_plus_one.similarity_threshold;

        let mut detected: Vec<DetectedPattern> = self
            .entries
            .values()
            .filter(|entry| entry.count() >= threshold)
            .map(|entry| DetectedPattern {
                query_pattern: entry.normalized.clone(),
                count: entry.count(),
                executions: entry.executions.len(),
                related: self
                    .entries
                    .values()
                    .filter(|other| other.normalized != entry.normalized)
                    .filter(|other| {
                        normalizer::similarity(&entry.normalized, &other.normalized)
                            >= similarity_threshold
                    })
                    .map(|other| other.normalized.clone())
                    .collect(),
            })
            .collect();

        detected.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.query_pattern.cmp(&b.query_pattern))
        });
        for pattern in &mut detected {
            pattern.related.sort();
        }
        detected
    }

    pub fn entry(&self, sql: &str) -> Option<&PatternEntry> {
        self.entries.get(&normalizer::hash(sql))
    }

    pub fn pattern_count(&self) -> usize {
        self.entries.len()
    }

    /// Forget all patterns
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

fn suggest_batching(sql: &str) -> String {
    match normalizer::extract_table(sql) {
        Some(table) => format!(
            "Load `{}` rows in one query (WHERE ... IN (...) or a JOIN) instead of once per parent row",
            table
        ),
        None => "Batch these lookups into a single query instead of one per parent row".to_string(),
    }
}
