//! Alert configuration types.
//!
//! Channels are plain names so configuration files stay readable; unknown
//! names are ignored when the dispatcher is built.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_QUERY_COUNT_THRESHOLD, DEFAULT_WEBHOOK_TIMEOUT_MS};

/// Channel name for the structured log sink
pub const LOG_CHANNEL: &str = "log";

/// Channel name for the webhook sink
pub const WEBHOOK_CHANNEL: &str = "webhook";

/// Alias of [`WEBHOOK_CHANNEL`] for Slack incoming webhooks
pub const SLACK_CHANNEL: &str = "slack";

fn default_channels() -> Vec<String> {
    vec![LOG_CHANNEL.to_string()]
}

fn default_true() -> bool {
    true
}

fn default_query_count_threshold() -> usize {
    DEFAULT_QUERY_COUNT_THRESHOLD
}

fn default_webhook_timeout_ms() -> u64 {
    DEFAULT_WEBHOOK_TIMEOUT_MS
}

/// Which conditions raise alerts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertConditions {
    /// Alert on every slow query (default: true)
    #[serde(default = "default_true")]
    pub slow_query: bool,

    /// Alert once per N+1 pattern per request (default: true)
    #[serde(default = "default_true")]
    pub n_plus_one: bool,

    /// Alert when a request issues at least this many queries (0 disables)
    #[serde(default = "default_query_count_threshold")]
    pub query_count_threshold: usize,
}

impl Default for AlertConditions {
    fn default() -> Self {
        Self {
            slow_query: true,
            n_plus_one: true,
            query_count_threshold: default_query_count_threshold(),
        }
    }
}

/// Webhook target (Slack-compatible incoming webhook)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,

    /// Request timeout in milliseconds (default: 2000)
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_webhook_timeout_ms(),
        }
    }
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertsConfig {
    /// Master switch (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Channels to fan out to (default: ["log"])
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,

    #[serde(default)]
    pub conditions: AlertConditions,

    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channels: default_channels(),
            conditions: AlertConditions::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl AlertsConfig {
    pub fn uses_channel(&self, name: &str) -> bool {
        self.channels.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    /// Whether a webhook-backed channel is configured
    pub fn uses_webhook(&self) -> bool {
        self.uses_channel(WEBHOOK_CHANNEL) || self.uses_channel(SLACK_CHANNEL)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled || !self.uses_webhook() {
            return Ok(());
        }

        match self.webhook.url.as_deref() {
            None | Some("") => {
                return Err("alerts.webhook.url is required when the webhook channel is enabled"
                    .to_string())
            }
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                return Err(format!(
                    "alerts.webhook.url must be an http(s) URL, got '{}'",
                    url
                ))
            }
            Some(_) => {}
        }

        if self.webhook.timeout_ms == 0 || self.webhook.timeout_ms > 10_000 {
            return Err(format!(
                "alerts.webhook.timeout_ms must be between 1 and 10000, got {}",
                self.webhook.timeout_ms
            ));
        }

        Ok(())
    }
}
