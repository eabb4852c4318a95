//! Quorumload: a closed-loop load generator for replicated key-value
//! clusters speaking the propose/reply wire protocol.

#[macro_use]
mod utils;

mod endpoint;
mod engine;
mod workload;

pub use utils::{logger_init, CommandId, CompletionMap, LoadError, ME};

pub use endpoint::{MasterApi, MasterStub, ReplicaIdx, REQUEST_BODY_LEN};
pub use engine::{
    BenchConfig, BenchMetrics, BenchParams, BenchSummary, RoundController,
    RoundPhase, RoutingMode,
};
pub use workload::{KeyDist, Op, Workload, WorkloadParams};
