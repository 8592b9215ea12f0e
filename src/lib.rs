pub mod adapter;
pub mod aggregate;
pub mod benchmark;
pub mod cli;
pub mod client;
pub mod collector;
pub mod config;
pub mod distribution;
pub mod load;
pub mod metrics;
pub mod report;
pub mod request;
pub mod scenario;
pub mod stats;
pub mod tokenizer;

#[cfg(test)]
mod testing;

pub use adapter::{Adapter, AdapterKind, EngineAdapter, EngineConfig, EventStream, HealthStatus};
pub use aggregate::{AggregateMetrics, Comparison, MetricsAggregator};
pub use benchmark::BenchmarkRunner;
pub use cli::Cli;
pub use client::AdapterError;
pub use collector::StreamingMetricsCollector;
pub use config::Config;
pub use load::{LoadEngine, LoadPolicy, LoadRun, StopCondition};
pub use metrics::Metrics;
pub use report::{BenchmarkReport, ReportBuilder};
pub use request::{ErrorKind, RequestResult, RequestSpec, StreamEvent};
pub use scenario::{PromptScenario, Scenario};
