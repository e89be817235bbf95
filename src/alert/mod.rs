//! Alert evaluation and fan-out
//!
//! The dispatcher decides whether a condition is alert-worthy and hands an
//! [`AlertEvent`] to every configured channel. Channels never propagate
//! failures to the request path: a failed delivery is logged and dropped.

use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use std::fmt;
use thiserror::Error;

use crate::config::{AlertsConfig, LOG_CHANNEL, SLACK_CHANNEL, WEBHOOK_CHANNEL};
use crate::metrics::QueryLensMetrics;
use crate::record::{NPlusOnePattern, QueryRecord};

pub mod webhook;

pub use webhook::WebhookChannel;

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook responded with status {0}")]
    Status(u16),

    #[error("Alert queue is full")]
    QueueFull,

    #[error("Alert worker has stopped")]
    WorkerStopped,

    #[error("Failed to start alert worker: {0}")]
    Worker(#[from] std::io::Error),

    #[error("Invalid channel configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlowQuery,
    NPlusOne,
    HighQueryCount,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::SlowQuery => "slow_query",
            AlertKind::NPlusOne => "n_plus_one",
            AlertKind::HighQueryCount => "high_query_count",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One alert, built per occurrence and never persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub title: String,
    pub kind: AlertKind,
    pub payload: Map<String, JsonValue>,
}

impl AlertEvent {
    pub fn new(title: impl Into<String>, kind: AlertKind) -> Self {
        let mut payload = Map::new();
        payload.insert("type".to_string(), JsonValue::from(kind.as_str()));
        Self {
            title: title.into(),
            kind,
            payload,
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&JsonValue> {
        self.payload.get(key)
    }
}

/// Destination for alerts
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Hand the event to the channel; must not block on network I/O
    fn send(&self, event: &AlertEvent) -> Result<(), AlertError>;
}

/// Emits alerts as structured `tracing` warnings
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        LOG_CHANNEL
    }

    fn send(&self, event: &AlertEvent) -> Result<(), AlertError> {
        let payload = JsonValue::Object(event.payload.clone());
        tracing::warn!(
            alert = %event.kind,
            payload = %payload,
            "[querylens] {}",
            event.title
        );
        Ok(())
    }
}

pub struct AlertDispatcher {
    config: AlertsConfig,
    channels: Vec<Box<dyn AlertChannel>>,
}

impl AlertDispatcher {
    /// Build channels from configured names; unknown names are ignored
    pub fn new(config: &AlertsConfig) -> Result<Self, AlertError> {
        let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();

        if config.enabled {
            for name in &config.channels {
                match name.to_lowercase().as_str() {
                    LOG_CHANNEL => channels.push(Box::new(LogChannel)),
                    WEBHOOK_CHANNEL | SLACK_CHANNEL => {
                        let url = config.webhook.url.as_deref().ok_or_else(|| {
                            AlertError::InvalidConfig("webhook channel needs a url".to_string())
                        })?;
                        channels.push(Box::new(WebhookChannel::new(
                            url,
                            config.webhook.timeout_ms,
                        )?));
                    }
                    other => tracing::debug!(channel = %other, "Ignoring unknown alert channel"),
                }
            }
        }

        Ok(Self::with_channels(config, channels))
    }

    /// Dispatcher with caller-supplied channels
    pub fn with_channels(config: &AlertsConfig, channels: Vec<Box<dyn AlertChannel>>) -> Self {
        Self {
            config: config.clone(),
            channels,
        }
    }

    /// Dispatcher that never alerts
    pub fn disabled() -> Self {
        Self::with_channels(&AlertsConfig::default(), Vec::new())
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub fn alert_slow_query(&self, record: &QueryRecord) {
        if !self.config.enabled || !self.config.conditions.slow_query {
            return;
        }

        let backtrace = serde_json::to_value(&record.backtrace).unwrap_or(JsonValue::Null);
        let explain = record
            .explain
            .as_ref()
            .and_then(|plan| serde_json::to_value(plan).ok())
            .unwrap_or(JsonValue::Null);

        let event = AlertEvent::new("Slow Query Detected", AlertKind::SlowQuery)
            .with_field("sql", record.sql.as_str())
            .with_field("time_ms", record.time_ms)
            .with_field("route", record.metadata.route_or_unknown())
            .with_field("connection", record.connection.as_str())
            .with_field("request_id", record.request_id.as_str())
            .with_field("backtrace", backtrace)
            .with_field("explain", explain);

        self.dispatch(event);
    }

    pub fn alert_n_plus_one(&self, pattern: &NPlusOnePattern) {
        if !self.config.enabled || !self.config.conditions.n_plus_one {
            return;
        }

        let event = AlertEvent::new("N+1 Query Detected", AlertKind::NPlusOne)
            .with_field("query_pattern", pattern.query_pattern.as_str())
            .with_field("count", pattern.count)
            .with_field("route", pattern.route.as_str())
            .with_field("suggestion", pattern.suggestion.as_str())
            .with_field(
                "location",
                pattern
                    .location
                    .as_deref()
                    .map(JsonValue::from)
                    .unwrap_or(JsonValue::Null),
            );

        self.dispatch(event);
    }

    /// Alert when `count` reaches the configured threshold (0 disables)
    pub fn alert_high_query_count(&self, count: usize, route: &str) {
        let threshold = self.config.conditions.query_count_threshold;
        if !self.config.enabled || threshold == 0 || count < threshold {
            return;
        }

        let event = AlertEvent::new("High Query Count", AlertKind::HighQueryCount)
            .with_field("count", count)
            .with_field("threshold", threshold)
            .with_field("route", route)
            .with_field(
                "message",
                format!(
                    "Request generated {} queries (threshold: {})",
                    count, threshold
                ),
            );

        self.dispatch(event);
    }

    fn dispatch(&self, event: AlertEvent) {
        QueryLensMetrics::global().record_alert(event.kind);

        for channel in &self.channels {
            if let Err(e) = channel.send(&event) {
                tracing::error!(
                    channel = %channel.name(),
                    alert = %event.kind,
                    error = %e,
                    "Failed to send alert"
                );
            }
        }
    }
}

impl fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("enabled", &self.config.enabled)
            .field("channels", &self.channel_names())
            .finish()
    }
}

/// Key/value fields of an event as display text, for chat-style sinks
pub(crate) fn render_fields(event: &AlertEvent, max_chars: usize) -> Vec<(String, String)> {
    event
        .payload
        .iter()
        .map(|(key, value)| {
            let text = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Array(_) | JsonValue::Object(_) => {
                    serde_json::to_string_pretty(value).unwrap_or_default()
                }
                other => other.to_string(),
            };
            (key.clone(), text.chars().take(max_chars).collect())
        })
        .collect()
}

pub(crate) fn summary_json(event: &AlertEvent) -> JsonValue {
    json!({ "title": event.title, "kind": event.kind, "payload": event.payload })
}
