//! Request aggregators keyed by request id
//!
//! For hosts that cannot keep one aggregator per concurrency unit (for
//! example, a query hook that only knows the request id). Each request gets
//! its own aggregator; the map lock is held only to look it up, never while
//! a sink is written.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::{QueryEvent, RequestAggregator, RequestSummary};
use crate::engine::QueryLens;
use crate::record::{QueryRecord, RequestMetadata};

pub struct RequestRegistry {
    engine: QueryLens,
    requests: Mutex<HashMap<String, Arc<Mutex<RequestAggregator>>>>,
}

impl RequestRegistry {
    pub fn new(engine: QueryLens) -> Self {
        Self {
            engine,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a request and return its id
    pub fn begin(&self, request_id: Option<String>, metadata: RequestMetadata) -> String {
        let mut aggregator = self.engine.aggregator();
        let id = aggregator.start(request_id, metadata);

        let previous = self
            .requests
            .lock()
            .insert(id.clone(), Arc::new(Mutex::new(aggregator)));
        if let Some(previous) = previous {
            tracing::debug!(request_id = %id, "Request id reused, finishing the previous request");
            previous.lock().finish();
        }
        id
    }

    /// Track an event for `request_id`; unknown ids are ignored
    pub fn track(&self, request_id: &str, event: QueryEvent) -> Option<QueryRecord> {
        let Some(aggregator) = self.requests.lock().get(request_id).cloned() else {
            tracing::debug!(request_id = %request_id, "Query for unknown request ignored");
            return None;
        };
        let record = aggregator.lock().track(event);
        record
    }

    pub fn summary(&self, request_id: &str) -> Option<RequestSummary> {
        let aggregator = self.requests.lock().get(request_id).cloned()?;
        let summary = aggregator.lock().summary();
        Some(summary)
    }

    /// Finish and forget `request_id`
    pub fn finish(&self, request_id: &str) -> Option<RequestSummary> {
        let aggregator = self.requests.lock().remove(request_id)?;
        let summary = aggregator.lock().finish();
        summary
    }

    pub fn active_requests(&self) -> usize {
        self.requests.lock().len()
    }
}
