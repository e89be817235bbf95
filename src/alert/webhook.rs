// Webhook alert channel
//
// Deliveries run on a dedicated worker thread with its own single-threaded
// tokio runtime, fed through a bounded queue. The caller only enqueues, so a
// slow or unreachable endpoint never stalls the instrumented request.

use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{render_fields, summary_json, AlertChannel, AlertError, AlertEvent};
use crate::config::WEBHOOK_CHANNEL;
use crate::constants::{WEBHOOK_FIELD_MAX_CHARS, WEBHOOK_QUEUE_CAPACITY};
use crate::metrics::QueryLensMetrics;

pub struct WebhookChannel {
    sender: mpsc::Sender<AlertEvent>,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: &str, timeout_ms: u64) -> Result<Self, AlertError> {
        Self::with_capacity(url, timeout_ms, WEBHOOK_QUEUE_CAPACITY)
    }

    pub fn with_capacity(url: &str, timeout_ms: u64, capacity: usize) -> Result<Self, AlertError> {
        if capacity == 0 {
            return Err(AlertError::InvalidConfig(
                "webhook queue capacity must be at least 1".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;

        let (sender, receiver) = mpsc::channel(capacity);
        let worker_url = url.to_string();

        std::thread::Builder::new()
            .name("querylens-webhook".to_string())
            .spawn(move || run_worker(client, worker_url, receiver))?;

        Ok(Self {
            sender,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        WEBHOOK_CHANNEL
    }

    fn send(&self, event: &AlertEvent) -> Result<(), AlertError> {
        self.sender.try_send(event.clone()).map_err(|e| {
            QueryLensMetrics::global().webhook_failures.inc();
            match e {
                mpsc::error::TrySendError::Full(_) => AlertError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => AlertError::WorkerStopped,
            }
        })
    }
}

fn run_worker(client: Client, url: String, mut receiver: mpsc::Receiver<AlertEvent>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start webhook runtime, alerts will be dropped");
            return;
        }
    };

    runtime.block_on(async move {
        while let Some(event) = receiver.recv().await {
            if let Err(e) = deliver(&client, &url, &event).await {
                QueryLensMetrics::global().webhook_failures.inc();
                tracing::error!(
                    error = %e,
                    alert = %summary_json(&event),
                    "Failed to deliver webhook alert"
                );
            }
        }
    });
}

/// Slack-compatible message body for an event
pub fn slack_payload(event: &AlertEvent) -> JsonValue {
    let fields: Vec<JsonValue> = render_fields(event, WEBHOOK_FIELD_MAX_CHARS)
        .into_iter()
        .map(|(key, text)| {
            json!({
                "type": "mrkdwn",
                "text": format!("*{}:*\n{}", key, text),
            })
        })
        .collect();

    json!({
        "text": event.title,
        "blocks": [
            {
                "type": "header",
                "text": { "type": "plain_text", "text": format!("🔍 {}", event.title) },
            },
            {
                "type": "section",
                "fields": fields,
            },
        ],
    })
}

/// POST one event; no retries
pub async fn deliver(client: &Client, url: &str, event: &AlertEvent) -> Result<(), AlertError> {
    let response = client.post(url).json(&slack_payload(event)).send().await?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(AlertError::Status(status.as_u16()))
    }
}
