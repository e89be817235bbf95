//! SQL Normalization
//!
//! Turns raw SQL into a literal-free pattern used to group executions of
//! the same statement, hashes patterns, compares queries and renders SQL
//! with bindings inlined for display.
//!
//! Nothing produced here is ever executed. `format` output is for logs
//! and summaries only.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::constants::SIMILARITY_PREFIX_LEN;
use crate::record::BindingValue;

fn numeric_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d+\b").expect("numeric literal regex"))
}

fn string_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"'[^']*'").expect("string literal regex"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

fn from_table_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bFROM\s+[`"\[]?([A-Za-z_][A-Za-z0-9_$]*(?:\.[A-Za-z_][A-Za-z0-9_$]*)?)"#)
            .expect("from table regex")
    })
}

/// Normalize a statement into its pattern
///
/// Numeric and single-quoted string literals become `?`, whitespace runs
/// collapse to one space and the result is trimmed.
/// `normalize(&normalize(s)) == normalize(s)` for every input.
pub fn normalize(sql: &str) -> String {
    let normalized = numeric_literal_re().replace_all(sql, "?");
    let normalized = string_literal_re().replace_all(&normalized, "?");
    let normalized = whitespace_re().replace_all(&normalized, " ");
    normalized.trim().to_string()
}

/// SHA-256 hex digest of the normalized statement
pub fn hash(sql: &str) -> String {
    hash_normalized(&normalize(sql))
}

/// Hash an already-normalized pattern
pub(crate) fn hash_normalized(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Similarity of two statements as a percentage in `[0, 100]`
///
/// Levenshtein distance over the normalized forms. Both sides are cut to a
/// fixed prefix first to bound the cost on very long statements.
pub fn similarity(a: &str, b: &str) -> f64 {
    let norm_a = normalize(a);
    let norm_b = normalize(b);

    if norm_a == norm_b {
        return 100.0;
    }

    let a_bytes = &norm_a.as_bytes()[..norm_a.len().min(SIMILARITY_PREFIX_LEN)];
    let b_bytes = &norm_b.as_bytes()[..norm_b.len().min(SIMILARITY_PREFIX_LEN)];

    let max_len = a_bytes.len().max(b_bytes.len());
    if max_len == 0 {
        return 100.0;
    }

    let distance = levenshtein(a_bytes, b_bytes);
    ((1.0 - distance as f64 / max_len as f64) * 100.0).clamp(0.0, 100.0)
}

/// Levenshtein edit distance between two byte strings
fn levenshtein(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Inline bindings into a statement for display
///
/// Handles positional `?` and numbered `$n` placeholders. Placeholders
/// inside single-quoted literals are left alone, placeholders without a
/// binding stay as written and surplus bindings are ignored.
pub fn format(sql: &str, bindings: &[BindingValue]) -> String {
    if bindings.is_empty() {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + bindings.len() * 8);
    let mut chars = sql.chars().peekable();
    let mut next_positional = 0usize;
    let mut in_string = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_string = !in_string;
                out.push(c);
            }
            '?' if !in_string => {
                match bindings.get(next_positional) {
                    Some(value) => out.push_str(&render_binding(value)),
                    None => out.push('?'),
                }
                next_positional += 1;
            }
            '$' if !in_string && chars.peek().is_some_and(|d| d.is_ascii_digit()) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                let rendered = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| bindings.get(idx))
                    .map(render_binding);
                match rendered {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('$');
                        out.push_str(&digits);
                    }
                }
            }
            _ => out.push(c),
        }
    }

    out
}

fn render_binding(value: &BindingValue) -> String {
    match value {
        BindingValue::Null => "NULL".to_string(),
        BindingValue::Bool(true) => "1".to_string(),
        BindingValue::Bool(false) => "0".to_string(),
        BindingValue::Int(n) => n.to_string(),
        BindingValue::Float(f) => f.to_string(),
        BindingValue::Text(s) => format!("'{}'", escape_text(s)),
    }
}

/// Backslash-escape quotes, backslashes and NUL
fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\'' | '"' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\0' => escaped.push_str("\\0"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Table name of the first `FROM` clause, if any
pub fn extract_table(sql: &str) -> Option<String> {
    from_table_re()
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// True when the statement is itself a plan request (`EXPLAIN ...`)
pub fn is_plan_statement(sql: &str) -> bool {
    let trimmed = sql.trim_start();
    trimmed
        .get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("explain"))
}
