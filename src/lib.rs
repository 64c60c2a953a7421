pub mod archive;
pub mod checker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pairing;
pub mod ports;
pub mod runner;
pub mod scheduler;
pub mod stats;
pub mod telemetry;
pub mod wpr;

pub use crate::error::BenchError;
pub use crate::metrics::{DerivedResult, MetricsAggregator, ResultsSnapshot};
pub use crate::runner::{Benchmark, CycleOutcome, CycleReport};
pub use crate::scheduler::{CheckRequest, Checker, Scheduler};
