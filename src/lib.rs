// Querylens - request-scoped SQL observability
//
// Hosts build one `QueryLens` at startup, give each concurrency unit its own
// `RequestAggregator`, and report every executed statement as a `QueryEvent`.

pub mod aggregator;
pub mod alert;
pub mod analysis; // Offline log analysis for the CLI
pub mod backtrace;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics; // Prometheus counters
pub mod normalizer;
pub mod plan;
pub mod record;
pub mod resources;
pub mod sampler;
pub mod store;
pub mod tracker;

pub use aggregator::{QueryEvent, RequestAggregator, RequestRegistry, RequestScope, RequestSummary};
pub use config::Config;
pub use engine::{QueryLens, QueryLensBuilder};
pub use error::QueryLensError;
pub use plan::{ExecutionPlan, ExplainMode, PlanError, PlanProvider, PlanRequest};
pub use record::{BindingValue, NPlusOnePattern, QueryRecord, RequestMetadata};
