pub mod cli;
pub mod client;
pub mod config;
pub mod metrics;
pub mod pricing;
pub mod probe;
pub mod report;
pub mod result;
pub mod run;
pub mod runner;

#[cfg(test)]
mod testing;

pub use cli::Cli;
pub use client::{AnthropicClient, ClientConfig, ClientError, StreamEvent, StreamProvider};
pub use config::Config;
pub use metrics::{Metrics, MetricsSnapshot, RequestStatus};
pub use pricing::{Pricing, PricingError, PricingTable};
pub use probe::{ProbeError, ProbeSuccess, probe};
pub use report::{RunOutput, RunReport};
pub use result::{PromptResult, ResultAssembler};
pub use run::{BenchmarkRun, RunError, RunRequest, RunStatus};
pub use runner::{BenchmarkRunner, RunnerConfig};
