//! Query plan introspection seam
//!
//! The engine never talks to a database itself. Hosts implement
//! [`PlanProvider`] on top of their own connection handling; the tracker
//! calls it for slow queries (or for every query when configured) and
//! attaches whatever comes back to the record.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::normalizer::is_plan_statement;
use crate::record::BindingValue;

/// Kind of plan requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainMode {
    /// `EXPLAIN`: estimated plan, statement not executed
    Explain,
    /// `EXPLAIN ANALYZE`: statement executed, real timings
    Analyze,
}

/// Everything a provider needs to build a plan request
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub sql: &'a str,
    pub bindings: &'a [BindingValue],
    pub connection: &'a str,
    pub mode: ExplainMode,
}

impl PlanRequest<'_> {
    /// Introspection statement for this request, see [`explain_sql`]
    pub fn explain_sql(&self) -> Option<String> {
        explain_sql(self.sql, self.mode)
    }
}

/// Plan attached to a record
///
/// Stored as `{"kind": ..., "value": ...}` so a structured plan document
/// that happens to carry an `error` or `format` key reads back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExecutionPlan {
    /// Provider failure, kept on the record instead of failing it
    Error { error: String },
    /// Plain-text plan output when no structured form is available
    Text { format: String, output: JsonValue },
    /// Structured plan rows or document as returned by the database
    Structured(JsonValue),
}

impl ExecutionPlan {
    pub fn error(message: impl Into<String>) -> Self {
        ExecutionPlan::Error {
            error: message.into(),
        }
    }

    pub fn text(output: JsonValue) -> Self {
        ExecutionPlan::Text {
            format: "text".to_string(),
            output,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionPlan::Error { .. })
    }
}

/// Errors a provider may report
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("connection '{0}' is not available for plan introspection")]
    UnknownConnection(String),

    #[error("plan query failed: {0}")]
    Query(String),

    #[error("plan introspection is not supported: {0}")]
    Unsupported(String),
}

/// Host-side plan introspection
pub trait PlanProvider: Send + Sync {
    fn explain(&self, request: &PlanRequest<'_>) -> Result<ExecutionPlan, PlanError>;
}

/// Provider used when the host supplies none
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlanProvider;

impl PlanProvider for NoPlanProvider {
    fn explain(&self, _request: &PlanRequest<'_>) -> Result<ExecutionPlan, PlanError> {
        Err(PlanError::Unsupported(
            "no plan provider configured".to_string(),
        ))
    }
}

impl<F> PlanProvider for F
where
    F: Fn(&PlanRequest<'_>) -> Result<ExecutionPlan, PlanError> + Send + Sync,
{
    fn explain(&self, request: &PlanRequest<'_>) -> Result<ExecutionPlan, PlanError> {
        self(request)
    }
}

/// Build the introspection statement for `sql`
///
/// Returns `None` when `sql` is already a plan request so analysis never
/// recurses into itself.
pub fn explain_sql(sql: &str, mode: ExplainMode) -> Option<String> {
    if is_plan_statement(sql) {
        return None;
    }

    let sql = sql.trim();
    Some(match mode {
        ExplainMode::Explain => format!("EXPLAIN {}", sql),
        ExplainMode::Analyze => format!("EXPLAIN ANALYZE FORMAT=JSON {}", sql),
    })
}

/// Run `provider` for one statement, folding failures into the plan
///
/// Plan statements yield `None`; every error becomes
/// [`ExecutionPlan::Error`].
pub fn introspect(
    provider: &dyn PlanProvider,
    sql: &str,
    bindings: &[BindingValue],
    connection: &str,
    mode: ExplainMode,
) -> Option<ExecutionPlan> {
    if is_plan_statement(sql) {
        return None;
    }

    let request = PlanRequest {
        sql,
        bindings,
        connection,
        mode,
    };

    match provider.explain(&request) {
        Ok(plan) => Some(plan),
        Err(e) => {
            tracing::debug!(
                connection = %connection,
                mode = ?mode,
                error = %e,
                "Plan introspection failed"
            );
            Some(ExecutionPlan::error(e.to_string()))
        }
    }
}
