// Shared helpers for integration tests

use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;

use querylens::alert::{AlertChannel, AlertDispatcher, AlertError, AlertEvent};
use querylens::{Config, QueryLens};

/// Alert channel that keeps every event it receives
#[derive(Clone, Default)]
pub struct RecordingChannel {
    events: Arc<Mutex<Vec<AlertEvent>>>,
}

impl RecordingChannel {
    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().clone()
    }
}

impl AlertChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, event: &AlertEvent) -> Result<(), AlertError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Enabled configuration writing to `dir`, without backtraces or memory
/// sampling
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.enabled = true;
    config.storage.path = dir.path().to_path_buf();
    config.backtrace.enabled = false;
    config.metadata.memory_usage = false;
    config
}

/// Engine with alerts enabled and routed to a recording channel
pub fn engine_with_recorder(config: Config) -> (QueryLens, RecordingChannel) {
    let recorder = RecordingChannel::default();
    let mut alerts = config.alerts.clone();
    alerts.enabled = true;
    let dispatcher = AlertDispatcher::with_channels(&alerts, vec![Box::new(recorder.clone())]);
    let engine = QueryLens::builder(config)
        .alert_dispatcher(dispatcher)
        .build()
        .expect("engine builds from test config");
    (engine, recorder)
}
