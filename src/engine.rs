// Shared engine state
//
// `QueryLens` is built once at startup and cloned into every concurrency
// unit. It only holds immutable configuration and handles to thread-safe
// sinks; all mutable request state lives in the aggregators it hands out.

use std::sync::Arc;

use crate::aggregator::{ExclusionFilter, RequestAggregator, RequestRegistry};
use crate::alert::AlertDispatcher;
use crate::backtrace::{BacktraceCollector, OriginMatcher};
use crate::config::Config;
use crate::error::QueryLensError;
use crate::plan::{NoPlanProvider, PlanProvider};
use crate::sampler::Sampler;
use crate::store::{LogStore, StoreWriter};
use crate::tracker::{PatternTracker, TrackerSettings};

pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) sampler: Sampler,
    pub(crate) exclusions: ExclusionFilter,
    pub(crate) backtrace: BacktraceCollector,
    pub(crate) origin: OriginMatcher,
    pub(crate) store: LogStore,
    pub(crate) writer: StoreWriter,
    pub(crate) alerts: Arc<AlertDispatcher>,
    tracker_settings: Arc<TrackerSettings>,
    plan_provider: Arc<dyn PlanProvider>,
}

impl Shared {
    pub(crate) fn new_tracker(&self) -> PatternTracker {
        PatternTracker::new(
            Arc::clone(&self.tracker_settings),
            Arc::clone(&self.plan_provider),
            Arc::clone(&self.alerts),
            self.origin.clone(),
        )
    }
}

/// Query observability engine
#[derive(Clone)]
pub struct QueryLens {
    shared: Arc<Shared>,
}

impl QueryLens {
    /// Engine with the default plan provider, origin matcher and channels
    pub fn new(config: Config) -> Result<Self, QueryLensError> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> QueryLensBuilder {
        QueryLensBuilder::new(config)
    }

    /// Fresh aggregator for one concurrency unit
    pub fn aggregator(&self) -> RequestAggregator {
        RequestAggregator::new(Arc::clone(&self.shared))
    }

    /// Registry routing events to aggregators by request id
    pub fn registry(&self) -> RequestRegistry {
        RequestRegistry::new(self.clone())
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn store(&self) -> &LogStore {
        &self.shared.store
    }

    /// Block until every record tracked so far is persisted
    ///
    /// Appends run on a background writer; call this before reading back
    /// the log or before shutting down.
    pub fn flush(&self) {
        self.shared.writer.flush();
    }

    /// Delete logs older than the configured retention
    pub fn cleanup(&self) -> usize {
        self.shared.store.cleanup(self.shared.store.retention_days())
    }
}

impl std::fmt::Debug for QueryLens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryLens")
            .field("enabled", &self.shared.config.enabled)
            .field("store", &self.shared.store.dir())
            .field("alerts", &self.shared.alerts)
            .finish()
    }
}

pub struct QueryLensBuilder {
    config: Config,
    plan_provider: Arc<dyn PlanProvider>,
    alert_dispatcher: Option<AlertDispatcher>,
    origin: OriginMatcher,
    exclusion_predicates: Vec<Box<dyn Fn(ExclusionFilter) -> ExclusionFilter>>,
}

impl QueryLensBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            plan_provider: Arc::new(NoPlanProvider),
            alert_dispatcher: None,
            origin: OriginMatcher::default(),
            exclusion_predicates: Vec::new(),
        }
    }

    pub fn plan_provider<P>(mut self, provider: P) -> Self
    where
        P: PlanProvider + 'static,
    {
        self.plan_provider = Arc::new(provider);
        self
    }

    /// Replace the channels built from configuration
    pub fn alert_dispatcher(mut self, dispatcher: AlertDispatcher) -> Self {
        self.alert_dispatcher = Some(dispatcher);
        self
    }

    pub fn origin_matcher(mut self, matcher: OriginMatcher) -> Self {
        self.origin = matcher;
        self
    }

    /// Exclude statements for which `predicate` returns true
    pub fn exclusion_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + Clone + 'static,
    {
        self.exclusion_predicates
            .push(Box::new(move |filter| filter.with_predicate(predicate.clone())));
        self
    }

    /// Validate the configuration and assemble the engine
    pub fn build(self) -> Result<QueryLens, QueryLensError> {
        self.config.validate().map_err(QueryLensError::Config)?;

        let mut exclusions =
            ExclusionFilter::from_config(&self.config).map_err(QueryLensError::Config)?;
        for add in &self.exclusion_predicates {
            exclusions = add(exclusions);
        }

        let alerts = match self.alert_dispatcher {
            Some(dispatcher) => dispatcher,
            None => AlertDispatcher::new(&self.config.alerts)?,
        };

        let store = LogStore::new(&self.config.storage);
        let writer = StoreWriter::spawn(store.clone())?;

        let shared = Shared {
            sampler: Sampler::new(self.config.sampling),
            exclusions,
            backtrace: BacktraceCollector::new(&self.config.backtrace),
            origin: self.origin,
            store,
            writer,
            alerts: Arc::new(alerts),
            tracker_settings: Arc::new(TrackerSettings::from_config(&self.config)),
            plan_provider: self.plan_provider,
            config: self.config,
        };

        tracing::info!(
            enabled = shared.config.enabled,
            sampling = shared.config.sampling,
            store = %shared.store.dir().display(),
            alert_channels = ?shared.alerts.channel_names(),
            "Query observability engine initialized"
        );

        Ok(QueryLens {
            shared: Arc::new(shared),
        })
    }
}
