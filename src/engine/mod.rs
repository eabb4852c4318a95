//! The dispatch/collection/failover engine.

mod collector;
mod controller;
mod dispatcher;
mod metrics;

pub use collector::CollectorReport;
pub use controller::{BenchConfig, BenchParams, RoundController, RoundPhase};
pub use dispatcher::{DispatchStats, RoutingMode, Target};
pub use metrics::{BenchMetrics, BenchSummary};

pub(crate) use collector::ReplyCollector;
pub(crate) use dispatcher::Dispatcher;
