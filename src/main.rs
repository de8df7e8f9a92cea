use anyhow::{Context, Result};
use log::{LevelFilter, Metadata, Record, debug, info, warn};
use ringlog::{Drain, File, LogBuilder, MultiLogBuilder, Output, Stderr};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream_bench::config::OutputFormat;
use stream_bench::metrics::MetricsSnapshot;
use stream_bench::{
    AnthropicClient, BenchmarkRun, BenchmarkRunner, Cli, ClientConfig, Config, PricingTable,
    RunOutput, RunReport, RunRequest,
};

/// Maximum log file size before rotation (10MB)
const LOG_FILE_MAX_SIZE: u64 = 1024 * 1024 * 10;

const LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Parse filters like "hyper=info" into module prefix -> level.
fn parse_log_filters(filters: &[String]) -> HashMap<String, LevelFilter> {
    filters
        .iter()
        .filter_map(|filter| {
            let (module, level) = filter.split_once('=')?;
            let level = level.parse::<LevelFilter>().ok()?;
            Some((module.to_string(), level))
        })
        .collect()
}

/// Logger used when per-module filters are configured. Writes straight to
/// the ringlog output, since ringlog itself only filters by level.
struct FilteredLogger {
    output: Mutex<Box<dyn Output>>,
    max_level: LevelFilter,
    filters: HashMap<String, LevelFilter>,
}

impl FilteredLogger {
    fn module_allows(&self, metadata: &Metadata) -> bool {
        let target = metadata.target();
        self.filters
            .iter()
            .filter(|(prefix, _)| target.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .is_none_or(|(_, level)| metadata.level() <= *level)
    }
}

impl log::Log for FilteredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level && self.module_allows(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata())
            && let Ok(mut output) = self.output.lock()
        {
            let line = format!(
                "{} {} [{}] {}\n",
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false),
                record.level(),
                record.target(),
                record.args()
            );
            let _ = output.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut output) = self.output.lock() {
            let _ = output.flush();
        }
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let log_level = config.log.level.to_level_filter();

    let output: Box<dyn Output> = if let Some(ref log_file) = config.output.trace_log {
        let backup_file = log_file.with_extension("old");
        Box::new(File::new(log_file.clone(), backup_file, LOG_FILE_MAX_SIZE)?)
    } else {
        Box::new(Stderr::new())
    };

    let filters = parse_log_filters(&config.log.filter);

    if filters.is_empty() {
        let base_log = LogBuilder::new()
            .output(output)
            .build()
            .map_err(anyhow::Error::msg)
            .context("failed to initialize logger")?;

        let mut drain = MultiLogBuilder::new()
            .level_filter(log_level)
            .default(base_log)
            .build()
            .start();

        std::thread::spawn(move || {
            loop {
                let _ = drain.flush();
                std::thread::sleep(LOG_FLUSH_INTERVAL);
            }
        });
    } else {
        let logger = FilteredLogger {
            output: Mutex::new(output),
            max_level: log_level,
            filters,
        };

        log::set_boxed_logger(Box::new(logger)).context("failed to set logger")?;
        log::set_max_level(log_level);
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let mut config = Config::load(&cli.config)?;
    if let Some(name) = cli.name {
        config.run.name = name;
    }
    if let Some(model) = cli.model {
        config.run.model = model;
    }

    init_logging(&config)?;

    if !config.output.quiet {
        println!("Streaming Benchmark");
        println!("   Config: {}", cli.config.display());
        println!("   Target: {}", config.endpoint.base_url);
        println!("   Run: {}", config.run.name);
        println!("   Model: {}", config.run.model);
        match config.load.max_in_flight {
            Some(limit) => println!("   Mode: Concurrent (at most {} in flight)", limit),
            None => println!("   Mode: Concurrent (all prompts at once)"),
        }
        println!();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .enable_all()
        .build()?;

    let result = runtime.block_on(run_benchmark(config));
    log::logger().flush();
    result
}

async fn run_benchmark(config: Config) -> Result<()> {
    let prompts = config.load_prompts().await?;

    if config.endpoint.api_key.is_none() {
        warn!("No API key configured; set endpoint.api_key or ANTHROPIC_API_KEY");
    }

    let pricing = PricingTable::anthropic().with_overrides(&config.pricing);
    debug!("Pricing table has {} models", pricing.len());

    let client = AnthropicClient::new(ClientConfig {
        base_url: config.endpoint.base_url.clone(),
        api_key: config.endpoint.api_key.clone(),
        timeout: Duration::from_secs(config.endpoint.timeout),
        max_tokens: config.endpoint.max_tokens,
        max_retries: config.endpoint.max_retries,
        retry_initial_delay_ms: config.endpoint.retry_initial_delay_ms,
        retry_max_delay_ms: config.endpoint.retry_max_delay_ms,
        pool_size: config.load.max_in_flight.unwrap_or(prompts.len()).max(1),
    })?;

    let runner = BenchmarkRunner::new(Arc::new(client), Arc::new(pricing))
        .with_config(config.runner_config()?);

    let mut run = BenchmarkRun::new(RunRequest {
        name: config.run.name.clone(),
        model: config.run.model.clone(),
        prompts,
    });

    info!("Starting run {} ({} prompts)", run.id, run.prompts.len());
    let before = MetricsSnapshot::capture();
    runner.execute(&mut run).await?;
    let counters = MetricsSnapshot::capture().since(&before);

    let report = RunReport::from_run(&run).with_counters(counters);
    info!(
        "Run {} {}: {} ok, {} failed, {} retries",
        run.id, run.status, report.summary.successful, report.summary.failed, counters.retries
    );

    let output = RunOutput {
        report: &report,
        run: &run,
    };

    if let Some(ref path) = config.output.file {
        let json = serde_json::to_string_pretty(&output)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    match config.output.format {
        OutputFormat::Console => {
            if !config.output.quiet {
                report.print_console(&run);
            }
        }
        OutputFormat::Json => {
            if config.output.file.is_none() {
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
        }
    }

    Ok(())
}
