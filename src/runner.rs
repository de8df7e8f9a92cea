use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::client::StreamProvider;
use crate::pricing::PricingTable;
use crate::probe::{ProbeError, probe};
use crate::result::{PromptResult, ResultAssembler};
use crate::run::{BenchmarkRun, RunError, RunStatus};

/// Limits applied while a run executes. All unset by default: every prompt
/// is dispatched at once and probes may take as long as the transport allows.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Maximum number of probes in flight at once.
    pub max_in_flight: Option<usize>,
    /// Bound on a single probe, measured from its dispatch.
    pub probe_timeout: Option<Duration>,
    /// Bound on the whole run. Probes still running at the deadline, or not
    /// yet started, fail with a timeout.
    pub run_timeout: Option<Duration>,
}

/// Executes benchmark runs by probing every prompt concurrently.
///
/// Each prompt is an independent task: it probes, then assembles its own
/// [`PromptResult`]. Nothing is shared between tasks except the read-only
/// provider and pricing table, and a failing prompt never affects the others.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use stream_bench::{AnthropicClient, BenchmarkRun, BenchmarkRunner, PricingTable, RunRequest};
///
/// # async fn example(client: AnthropicClient) -> anyhow::Result<()> {
/// let runner = BenchmarkRunner::new(Arc::new(client), Arc::new(PricingTable::anthropic()));
///
/// let mut run = BenchmarkRun::new(RunRequest {
///     name: "haiku speed test".to_string(),
///     model: "claude-3-haiku-20240307".to_string(),
///     prompts: vec!["Hello!".to_string(), "Explain quantum computing".to_string()],
/// });
/// runner.execute(&mut run).await?;
/// # Ok(())
/// # }
/// ```
pub struct BenchmarkRunner {
    provider: Arc<dyn StreamProvider>,
    pricing: Arc<PricingTable>,
    config: RunnerConfig,
}

impl BenchmarkRunner {
    pub fn new(provider: Arc<dyn StreamProvider>, pricing: Arc<PricingTable>) -> Self {
        Self {
            provider,
            pricing,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Runs every prompt of a pending run and fills in its results.
    ///
    /// Returns an error, leaving the run `pending`, only when the run cannot
    /// start: it was already started, the request is invalid, or the model
    /// has no pricing entry. Once started the run always reaches `completed`,
    /// with per-prompt failures recorded in the individual results.
    pub async fn execute(&self, run: &mut BenchmarkRun) -> Result<(), RunError> {
        if run.status != RunStatus::Pending {
            return Err(RunError::AlreadyStarted(run.id));
        }
        run.request().validate()?;
        self.pricing.lookup(&run.model)?;

        run.mark_running();
        let start = Instant::now();
        let deadline = self.config.run_timeout.map(|timeout| start + timeout);

        info!(
            "Starting run '{}' ({}): {} prompts against {}",
            run.name,
            run.id,
            run.prompts.len(),
            run.model
        );

        let semaphore = self
            .config
            .max_in_flight
            .map(|permits| Arc::new(Semaphore::new(permits)));

        let mut handles = Vec::with_capacity(run.prompts.len());
        for (index, prompt) in run.prompts.iter().enumerate() {
            let provider = Arc::clone(&self.provider);
            let pricing = Arc::clone(&self.pricing);
            let semaphore = semaphore.clone();
            let model = run.model.clone();
            let prompt = prompt.clone();
            let run_id = run.id;
            let probe_timeout = self.config.probe_timeout;
            let run_timeout = self.config.run_timeout;

            let handle = tokio::spawn(async move {
                let permit = acquire(semaphore).await;

                let outcome = match (&permit, effective_timeout(probe_timeout, deadline)) {
                    (Err(e), _) => Err(e.clone()),
                    (Ok(_), Some(limit)) if limit.is_zero() => {
                        debug!("Prompt {} not dispatched, run deadline passed", index);
                        Err(ProbeError::Timeout(run_timeout.unwrap_or(limit)))
                    }
                    (Ok(_), limit) => probe(provider.as_ref(), &model, &prompt, limit).await,
                };
                drop(permit);

                if let Err(e) = &outcome {
                    debug!("Prompt {} failed: {}", index, e);
                }

                ResultAssembler::new(run_id, &model, &pricing).assemble(index, prompt, outcome)
            });
            handles.push(handle);
        }

        // Every task is awaited; a task that panicked still yields a result
        let assembler = ResultAssembler::new(run.id, &run.model, &self.pricing);
        let mut results: Vec<PromptResult> = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => assembler.assemble_error(
                    index,
                    run.prompts[index].clone(),
                    &ProbeError::Panicked(e.to_string()),
                ),
            };
            results.push(result);
        }
        results.sort_by_key(|result| result.prompt_index);

        let failed = results.iter().filter(|r| !r.is_success()).count();
        run.mark_completed(results);

        info!(
            "Run '{}' completed in {:.1}s: {} ok, {} failed",
            run.name,
            start.elapsed().as_secs_f64(),
            run.prompts.len() - failed,
            failed
        );

        Ok(())
    }
}

/// Waits for a dispatch slot when the run is bounded.
async fn acquire(
    semaphore: Option<Arc<Semaphore>>,
) -> Result<Option<OwnedSemaphorePermit>, ProbeError> {
    match semaphore {
        Some(semaphore) => semaphore
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|e| ProbeError::Dispatch(e.to_string())),
        None => Ok(None),
    }
}

/// The tighter of the per-probe timeout and the time left before the run
/// deadline.
fn effective_timeout(
    probe_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Option<Duration> {
    let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
    match (probe_timeout, remaining) {
        (Some(probe), Some(remaining)) => Some(probe.min(remaining)),
        (probe, remaining) => probe.or(remaining),
    }
}
