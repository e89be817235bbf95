// Offline analysis of stored query logs
//
// Works on the records of one period file: filter, aggregate, and render
// the summary and top-N tables printed by `querylens analyze`.

use serde::Serialize;
use std::fmt::Write as _;

use crate::constants::{
    ANALYSIS_TABLE_ROWS, DEFAULT_ANALYZE_LIMIT, DEFAULT_SLOW_QUERY_THRESHOLD_MS,
};
use crate::record::{round2, QueryRecord};

const SLOW_SQL_WIDTH: usize = 80;
const PATTERN_WIDTH: usize = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOptions {
    /// Keep only records with `time_ms >= slow_threshold_ms`
    pub slow_only: bool,
    /// Keep only records flagged as N+1
    pub n_plus_one_only: bool,
    /// Maximum records considered after filtering
    pub limit: usize,
    pub slow_threshold_ms: f64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            slow_only: false,
            n_plus_one_only: false,
            limit: DEFAULT_ANALYZE_LIMIT,
            slow_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowQueryRow {
    pub sql: String,
    pub time_ms: f64,
    pub connection: String,
    pub route: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NPlusOneRow {
    pub query_pattern: String,
    pub count: usize,
    pub route: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub total_queries: usize,
    pub total_time_ms: f64,
    pub average_time_ms: f64,
    pub slow_queries: usize,
    /// Records carrying an N+1 pattern
    pub n_plus_one_patterns: usize,
    pub slow_rows: Vec<SlowQueryRow>,
    pub n_plus_one_rows: Vec<NPlusOneRow>,
    /// Rows dropped from the tables beyond the display cap
    pub hidden_slow_rows: usize,
    pub hidden_n_plus_one_rows: usize,
}

/// Filter and aggregate one period's records
///
/// Filters apply in order (slow, N+1) before the limit. Summary counts use
/// the `slow_query` flag recorded at tracking time.
pub fn analyze(records: &[QueryRecord], options: &AnalysisOptions) -> AnalysisReport {
    let selected: Vec<&QueryRecord> = records
        .iter()
        .filter(|r| !options.slow_only || r.time_ms >= options.slow_threshold_ms)
        .filter(|r| !options.n_plus_one_only || r.n_plus_one.is_some())
        .take(options.limit)
        .collect();

    let total_time: f64 = selected.iter().map(|r| r.time_ms).sum();
    let average = if selected.is_empty() {
        0.0
    } else {
        total_time / selected.len() as f64
    };

    let slow_rows: Vec<SlowQueryRow> = selected
        .iter()
        .filter(|r| r.slow_query)
        .map(|r| SlowQueryRow {
            sql: truncate(&r.sql, SLOW_SQL_WIDTH),
            time_ms: round2(r.time_ms),
            connection: r.connection.clone(),
            route: r.metadata.route_or_unknown().to_string(),
        })
        .collect();

    let n_plus_one_rows: Vec<NPlusOneRow> = selected
        .iter()
        .filter_map(|r| r.n_plus_one.as_ref().map(|p| (r, p)))
        .map(|(r, pattern)| NPlusOneRow {
            query_pattern: truncate(&pattern.query_pattern, PATTERN_WIDTH),
            count: pattern.count,
            route: r.metadata.route_or_unknown().to_string(),
            suggestion: pattern.suggestion.clone(),
        })
        .collect();

    let slow_count = slow_rows.len();
    let n_plus_one_count = n_plus_one_rows.len();

    AnalysisReport {
        total_queries: selected.len(),
        total_time_ms: round2(total_time),
        average_time_ms: round2(average),
        slow_queries: slow_count,
        n_plus_one_patterns: n_plus_one_count,
        hidden_slow_rows: slow_count.saturating_sub(ANALYSIS_TABLE_ROWS),
        hidden_n_plus_one_rows: n_plus_one_count.saturating_sub(ANALYSIS_TABLE_ROWS),
        slow_rows: slow_rows.into_iter().take(ANALYSIS_TABLE_ROWS).collect(),
        n_plus_one_rows: n_plus_one_rows.into_iter().take(ANALYSIS_TABLE_ROWS).collect(),
    }
}

impl AnalysisReport {
    /// Plain-text rendering
    ///
    /// The slow and N+1 tables are included only when requested, matching
    /// the filters that produced the report.
    pub fn render(&self, options: &AnalysisOptions) -> String {
        let mut out = String::new();

        out.push_str("=== Query Summary ===\n");
        out.push_str(&render_table(
            &["Metric", "Value"],
            &[
                vec!["Total Queries".into(), self.total_queries.to_string()],
                vec!["Total Time".into(), format!("{} ms", self.total_time_ms)],
                vec!["Average Time".into(), format!("{} ms", self.average_time_ms)],
                vec!["Slow Queries".into(), self.slow_queries.to_string()],
                vec!["N+1 Patterns".into(), self.n_plus_one_patterns.to_string()],
            ],
        ));

        if options.slow_only && !self.slow_rows.is_empty() {
            let rows: Vec<Vec<String>> = self
                .slow_rows
                .iter()
                .map(|r| {
                    vec![
                        r.sql.clone(),
                        format!("{} ms", r.time_ms),
                        r.connection.clone(),
                        r.route.clone(),
                    ]
                })
                .collect();
            out.push_str("\n=== Slow Queries ===\n");
            out.push_str(&render_table(
                &["SQL (truncated)", "Time", "Connection", "Route"],
                &rows,
            ));
            if self.hidden_slow_rows > 0 {
                let _ = writeln!(
                    out,
                    "Showing first {} slow queries. Use --limit to see more.",
                    ANALYSIS_TABLE_ROWS
                );
            }
        }

        if options.n_plus_one_only && !self.n_plus_one_rows.is_empty() {
            let rows: Vec<Vec<String>> = self
                .n_plus_one_rows
                .iter()
                .map(|r| {
                    vec![
                        r.query_pattern.clone(),
                        r.count.to_string(),
                        r.route.clone(),
                        r.suggestion.clone(),
                    ]
                })
                .collect();
            out.push_str("\n=== N+1 Query Patterns ===\n");
            out.push_str(&render_table(
                &["Query Pattern (truncated)", "Count", "Route", "Suggestion"],
                &rows,
            ));
            if self.hidden_n_plus_one_rows > 0 {
                let _ = writeln!(
                    out,
                    "Showing first {} N+1 patterns. Use --limit to see more.",
                    ANALYSIS_TABLE_ROWS
                );
            }
        }

        out
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let border = {
        let mut line = String::from("+");
        for width in &widths {
            line.push_str(&"-".repeat(width + 2));
            line.push('+');
        }
        line.push('\n');
        line
    };

    let mut out = border.clone();
    out.push_str(&format_row(headers, &widths));
    out.push_str(&border);
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        out.push_str(&format_row(&cells, &widths));
    }
    out.push_str(&border);
    out
}

fn format_row(cells: &[&str], widths: &[usize]) -> String {
    let mut line = String::from("|");
    for (cell, width) in cells.iter().zip(widths) {
        let pad = width.saturating_sub(cell.chars().count());
        let _ = write!(line, " {}{} |", cell, " ".repeat(pad));
    }
    line.push('\n');
    line
}
