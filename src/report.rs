use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::metrics::MetricsSnapshot;
use crate::run::{BenchmarkRun, RunStatus};

/// Summary of one run, derived from its results.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    pub version: String,

    pub summary: Summary,
    pub tokens: TokenStats,
    pub latency: LatencyStats,
    /// Process counters accumulated while the run executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<MetricsSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub result_count: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenStats {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_tokens_per_second: Option<f64>,
}

/// Mean/min/max over successful prompts. All `None` when nothing succeeded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub ttft: Option<Spread>,
    pub latency: Option<Spread>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spread {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl Spread {
    fn of(values: impl Iterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for value in values {
            count += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
        }

        (count > 0).then(|| Spread {
            mean_ms: sum / count as f64,
            min_ms: min,
            max_ms: max,
        })
    }
}

/// Shape written by the JSON output: the full run plus its report.
#[derive(Debug, Serialize)]
pub struct RunOutput<'a> {
    pub report: &'a RunReport,
    pub run: &'a BenchmarkRun,
}

impl RunReport {
    pub fn from_run(run: &BenchmarkRun) -> Self {
        let successful = run.successful_results().count();
        let failed = run.results.len() - successful;

        let duration_ms = match (run.started_at, run.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_microseconds().unwrap_or(0) as f64 / 1000.0)
            }
            _ => None,
        };

        let tps: Vec<f64> = run
            .successful_results()
            .filter_map(|r| r.tokens_per_second)
            .collect();

        Self {
            id: run.id,
            name: run.name.clone(),
            model: run.model.clone(),
            status: run.status,
            created_at: run.created_at,
            started_at: run.started_at,
            completed_at: run.completed_at,
            duration_ms,
            version: env!("CARGO_PKG_VERSION").to_string(),
            summary: Summary {
                result_count: run.results.len(),
                successful,
                failed,
                success_rate: if run.results.is_empty() {
                    0.0
                } else {
                    successful as f64 / run.results.len() as f64
                },
                total_cost_usd: run.successful_results().filter_map(|r| r.cost_usd).sum(),
            },
            tokens: TokenStats {
                total_input_tokens: run.successful_results().filter_map(|r| r.input_tokens).sum(),
                total_output_tokens: run
                    .successful_results()
                    .filter_map(|r| r.output_tokens)
                    .sum(),
                mean_tokens_per_second: (!tps.is_empty())
                    .then(|| tps.iter().sum::<f64>() / tps.len() as f64),
            },
            latency: LatencyStats {
                ttft: Spread::of(run.successful_results().filter_map(|r| r.ttft_ms)),
                latency: Spread::of(run.successful_results().filter_map(|r| r.latency_ms)),
            },
            counters: None,
        }
    }

    pub fn with_counters(mut self, counters: MetricsSnapshot) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn print_console(&self, run: &BenchmarkRun) {
        let now = Utc::now();
        let timestamp = now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false);

        println!();
        println!("{} -----", timestamp);
        println!(
            "{} Run: {} ({}) Model: {} Status: {}",
            timestamp, self.name, self.id, self.model, self.status
        );
        if let Some(duration_ms) = self.duration_ms {
            println!("{} Duration: {:.1}s", timestamp, duration_ms / 1000.0);
        }
        println!(
            "{} Prompts: {} Ok: {} Err: {} Success: {:.2}%",
            timestamp,
            self.summary.result_count,
            self.summary.successful,
            self.summary.failed,
            self.summary.success_rate * 100.0
        );
        println!(
            "{} Tokens: Input: {} Output: {} Cost: ${:.6}",
            timestamp,
            self.tokens.total_input_tokens,
            self.tokens.total_output_tokens,
            self.summary.total_cost_usd
        );
        if let Some(counters) = self.counters {
            println!(
                "{} Requests: Sent: {} Retries: {}",
                timestamp, counters.requests_sent, counters.retries
            );
            if counters.errors.total() > 0 {
                println!(
                    "{} Errors: Connection: {} 4xx: {} 5xx: {} Parse: {} Stream: {} Timeout: {} Other: {}",
                    timestamp,
                    counters.errors.connection,
                    counters.errors.http_4xx,
                    counters.errors.http_5xx,
                    counters.errors.parse,
                    counters.errors.stream,
                    counters.errors.timeout,
                    counters.errors.other
                );
            }
        }
        if let Some(ttft) = self.latency.ttft {
            println!(
                "{} TTFT (ms): mean: {:.1} min: {:.0} max: {:.0}",
                timestamp, ttft.mean_ms, ttft.min_ms, ttft.max_ms
            );
        }
        if let Some(latency) = self.latency.latency {
            println!(
                "{} Latency (ms): mean: {:.1} min: {:.0} max: {:.0}",
                timestamp, latency.mean_ms, latency.min_ms, latency.max_ms
            );
        }
        if let Some(tps) = self.tokens.mean_tokens_per_second {
            println!("{} Throughput: mean tokens/s: {:.2}", timestamp, tps);
        }

        println!("{} -----", timestamp);
        for result in &run.results {
            match &result.error {
                None => println!(
                    "{} [{}] ttft: {:.0}ms latency: {:.0}ms tokens: {}/{} tok/s: {} cost: ${:.6}",
                    timestamp,
                    result.prompt_index,
                    result.ttft_ms.unwrap_or_default(),
                    result.latency_ms.unwrap_or_default(),
                    result.input_tokens.unwrap_or_default(),
                    result.output_tokens.unwrap_or_default(),
                    result
                        .tokens_per_second
                        .map(|tps| format!("{:.2}", tps))
                        .unwrap_or_else(|| "-".to_string()),
                    result.cost_usd.unwrap_or_default()
                ),
                Some(error) => {
                    println!("{} [{}] error: {}", timestamp, result.prompt_index, error)
                }
            }
        }
        println!();
    }
}
