use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pricing::PricingTable;
use crate::probe::{ProbeError, ProbeOutcome, ProbeSuccess};

/// The finished record for one prompt of a run.
///
/// Either `response` or `error` is set, never both. Failed prompts carry no
/// metrics at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResult {
    pub run_id: Uuid,
    pub prompt_index: usize,
    pub prompt: String,
    pub response: Option<String>,
    pub ttft_ms: Option<f64>,
    pub latency_ms: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
}

impl PromptResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn failed(run_id: Uuid, prompt_index: usize, prompt: String, error: String) -> Self {
        Self {
            run_id,
            prompt_index,
            prompt,
            response: None,
            ttft_ms: None,
            latency_ms: None,
            tokens_per_second: None,
            input_tokens: None,
            output_tokens: None,
            cost_usd: None,
            error: Some(error),
        }
    }
}

/// Output tokens per second of generation time (latency minus TTFT).
///
/// `None` when there was no generation time to divide by.
pub fn tokens_per_second(output_tokens: u64, ttft_ms: f64, latency_ms: f64) -> Option<f64> {
    if latency_ms > ttft_ms {
        Some(output_tokens as f64 / ((latency_ms - ttft_ms) / 1000.0))
    } else {
        None
    }
}

/// Turns probe outcomes into [`PromptResult`]s. Infallible: every error,
/// including a pricing miss, becomes the result's `error`.
///
/// Cost uses the model the provider reported serving, falling back to the
/// run's model.
pub struct ResultAssembler<'a> {
    run_id: Uuid,
    model: &'a str,
    pricing: &'a PricingTable,
}

impl<'a> ResultAssembler<'a> {
    pub fn new(run_id: Uuid, model: &'a str, pricing: &'a PricingTable) -> Self {
        Self {
            run_id,
            model,
            pricing,
        }
    }

    pub fn assemble(
        &self,
        prompt_index: usize,
        prompt: String,
        outcome: ProbeOutcome,
    ) -> PromptResult {
        match outcome {
            Ok(success) => self.assemble_success(prompt_index, prompt, success),
            Err(e) => PromptResult::failed(self.run_id, prompt_index, prompt, e.to_string()),
        }
    }

    pub fn assemble_error(
        &self,
        prompt_index: usize,
        prompt: String,
        error: &ProbeError,
    ) -> PromptResult {
        PromptResult::failed(self.run_id, prompt_index, prompt, error.to_string())
    }

    fn assemble_success(
        &self,
        prompt_index: usize,
        prompt: String,
        success: ProbeSuccess,
    ) -> PromptResult {
        // Priced on the model that actually served the prompt
        let model = success.model.as_deref().unwrap_or(self.model);
        let cost_usd = match self
            .pricing
            .cost(model, success.input_tokens, success.output_tokens)
        {
            Ok(cost) => cost,
            Err(e) => {
                return PromptResult::failed(self.run_id, prompt_index, prompt, e.to_string());
            }
        };

        let ttft_ms = success.ttft.as_secs_f64() * 1000.0;
        let latency_ms = success.latency.as_secs_f64() * 1000.0;

        PromptResult {
            run_id: self.run_id,
            prompt_index,
            prompt,
            response: Some(success.text),
            ttft_ms: Some(ttft_ms),
            latency_ms: Some(latency_ms),
            tokens_per_second: tokens_per_second(success.output_tokens, ttft_ms, latency_ms),
            input_tokens: Some(success.input_tokens),
            output_tokens: Some(success.output_tokens),
            cost_usd: Some(cost_usd),
            error: None,
        }
    }
}
