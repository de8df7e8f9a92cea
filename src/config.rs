use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pricing::Pricing;
use crate::runner::RunnerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    pub run: RunConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Extra or overriding prices, keyed by model id
    #[serde(default)]
    pub pricing: HashMap<String, Pricing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Inline prompts, sent before any loaded from `prompt_file`
    #[serde(default)]
    pub prompts: Vec<String>,
    /// JSONL file, one `{"prompt": "..."}` object per line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
    /// Per-probe timeout, e.g. "60s"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_timeout: Option<String>,
    /// Whole-run timeout, e.g. "5m"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub quiet: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Per-module log level overrides (e.g., ["hyper=info", "h2=warn"])
    #[serde(default)]
    pub filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Console,
    Json,
}

#[derive(Debug, Deserialize)]
struct PromptLine {
    prompt: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout: default_timeout(),
            max_tokens: default_max_tokens(),
            max_retries: 0,
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            file: None,
            quiet: false,
            trace_log: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: Vec::new(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_retry_initial_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    10000 // 10 seconds
}

fn default_model() -> String {
    "claude-3-haiku-20240307".to_string()
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Console
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        if config.endpoint.api_key.is_none() {
            config.endpoint.api_key = std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|key| !key.is_empty());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.run.prompts.is_empty() && self.run.prompt_file.is_none() {
            anyhow::bail!("Either run.prompts or run.prompt_file must be specified");
        }

        if self.load.max_in_flight == Some(0) {
            anyhow::bail!("max_in_flight must be greater than 0");
        }

        self.runner_config()?;

        if self.runtime.worker_threads == 0 {
            anyhow::bail!("worker_threads must be greater than 0");
        }

        for (model, pricing) in &self.pricing {
            let valid = |price: f64| price.is_finite() && price >= 0.0;
            if !valid(pricing.input) || !valid(pricing.output) {
                anyhow::bail!("pricing for {} must be a finite, non-negative number", model);
            }
        }

        Ok(())
    }

    /// Runner limits with durations parsed.
    pub fn runner_config(&self) -> anyhow::Result<RunnerConfig> {
        Ok(RunnerConfig {
            max_in_flight: self.load.max_in_flight,
            probe_timeout: parse_duration("probe_timeout", self.load.probe_timeout.as_deref())?,
            run_timeout: parse_duration("run_timeout", self.load.run_timeout.as_deref())?,
        })
    }

    /// Inline prompts followed by those read from `prompt_file`.
    pub async fn load_prompts(&self) -> anyhow::Result<Vec<String>> {
        let mut prompts = self.run.prompts.clone();

        if let Some(path) = &self.run.prompt_file {
            let contents = tokio::fs::read_to_string(path).await?;
            for (line_number, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: PromptLine = serde_json::from_str(line).map_err(|e| {
                    anyhow::anyhow!(
                        "{}:{}: invalid prompt line: {}",
                        path.display(),
                        line_number + 1,
                        e
                    )
                })?;
                prompts.push(parsed.prompt);
            }
        }

        log::debug!("Loaded {} prompts", prompts.len());
        Ok(prompts)
    }
}

fn parse_duration(field: &str, value: Option<&str>) -> anyhow::Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(value) => {
            let duration = humantime::parse_duration(value)
                .map_err(|e| anyhow::anyhow!("invalid {} {:?}: {}", field, value, e))?;
            if duration.is_zero() {
                anyhow::bail!("{} must be greater than 0", field);
            }
            Ok(Some(duration))
        }
    }
}
