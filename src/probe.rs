use futures::StreamExt;
use log::debug;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::client::{ClientError, StreamEvent, StreamProvider};
use crate::metrics::{ErrorType, Metrics, RequestGuard, RequestStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Stream ended without a usage summary")]
    MissingUsage,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Probe task failed: {0}")]
    Panicked(String),

    #[error("Prompt could not be dispatched: {0}")]
    Dispatch(String),
}

/// Measurements of one successful streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSuccess {
    /// Dispatch to first non-empty content chunk. Equals `latency` when the
    /// stream produced no content.
    pub ttft: Duration,
    /// Dispatch to stream completion.
    pub latency: Duration,
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Model the provider reported serving the request, if any.
    pub model: Option<String>,
}

pub type ProbeOutcome = Result<ProbeSuccess, ProbeError>;

/// Send one prompt and time the response stream.
///
/// Token counts come from the provider's usage summary only. When `timeout`
/// is set the whole probe, including opening the stream, is bounded by it.
pub async fn probe(
    provider: &dyn StreamProvider,
    model: &str,
    prompt: &str,
    timeout: Option<Duration>,
) -> ProbeOutcome {
    let request = RequestGuard::start();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, measure(provider, model, prompt)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProbeError::Timeout(limit)),
        },
        None => measure(provider, model, prompt).await,
    };

    match &outcome {
        Ok(success) => {
            Metrics::record_tokens(success.input_tokens, success.output_tokens);
            request.complete(RequestStatus::Success);
        }
        Err(e) => request.complete(RequestStatus::Failed(ErrorType::from(e))),
    }

    outcome
}

async fn measure(provider: &dyn StreamProvider, model: &str, prompt: &str) -> ProbeOutcome {
    let start = Instant::now();
    let mut first_token: Option<Duration> = None;
    let mut text = String::new();
    let mut usage = None;
    let mut served_model = None;

    let mut stream = provider.open_stream(model, prompt).await?;

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Model(name) => served_model = Some(name),
            StreamEvent::Content(chunk) => {
                if first_token.is_none() && !chunk.is_empty() {
                    first_token = Some(start.elapsed());
                }
                text.push_str(&chunk);
            }
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                usage = Some((input_tokens, output_tokens));
                break;
            }
        }
    }

    let latency = start.elapsed();
    let (input_tokens, output_tokens) = usage.ok_or(ProbeError::MissingUsage)?;
    let ttft = first_token.unwrap_or(latency);

    debug!(
        "Probe completed - input_tokens: {}, output_tokens: {}, ttft_ms: {:.1}, total_ms: {:.1}",
        input_tokens,
        output_tokens,
        ttft.as_secs_f64() * 1000.0,
        latency.as_secs_f64() * 1000.0
    );

    Ok(ProbeSuccess {
        ttft,
        latency,
        text,
        input_tokens,
        output_tokens,
        model: served_model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedProvider};

    #[tokio::test(start_paused = true)]
    async fn test_probe_measures_ttft_and_latency() {
        let provider = ScriptedProvider::new().with(
            "hi",
            Script::new()
                .served_model("claude-3-haiku-20240307")
                .wait(Duration::from_millis(150))
                .content("Hello")
                .wait(Duration::from_millis(50))
                .content(" world")
                .wait(Duration::from_millis(50))
                .usage(12, 2),
        );

        let success = probe(&provider, "m", "hi", None).await.unwrap();

        assert_eq!(success.text, "Hello world");
        assert_eq!(success.input_tokens, 12);
        assert_eq!(success.output_tokens, 2);
        assert_eq!(success.model.as_deref(), Some("claude-3-haiku-20240307"));
        assert!(success.ttft >= Duration::from_millis(150));
        assert!(success.latency >= Duration::from_millis(250));
        assert!(success.ttft <= success.latency);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_chunks_do_not_count_as_first_token() {
        let provider = ScriptedProvider::new().with(
            "hi",
            Script::new()
                .content("")
                .wait(Duration::from_millis(100))
                .content("x")
                .usage(1, 1),
        );

        let success = probe(&provider, "m", "hi", None).await.unwrap();
        assert!(success.ttft >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_output_is_success() {
        let provider = ScriptedProvider::new().with(
            "hi",
            Script::new().wait(Duration::from_millis(80)).usage(9, 0),
        );

        let success = probe(&provider, "m", "hi", None).await.unwrap();
        assert_eq!(success.text, "");
        assert_eq!(success.output_tokens, 0);
        assert_eq!(success.ttft, success.latency);
    }

    #[tokio::test]
    async fn test_open_failure() {
        let provider = ScriptedProvider::new().with(
            "hi",
            Script::new().open_error(ClientError::Http4xx {
                status: 401,
                message: "bad key".to_string(),
            }),
        );

        let err = probe(&provider, "m", "hi", None).await.unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Client(ClientError::Http4xx { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn test_mid_stream_failure() {
        let provider = ScriptedProvider::new().with(
            "hi",
            Script::new()
                .content("partial")
                .fail(ClientError::Connection("reset by peer".to_string())),
        );

        let err = probe(&provider, "m", "hi", None).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Connection error: reset by peer".to_string()
        );
    }

    #[tokio::test]
    async fn test_missing_usage() {
        let provider = ScriptedProvider::new().with("hi", Script::new().content("text"));

        let err = probe(&provider, "m", "hi", None).await.unwrap_err();
        assert_eq!(err, ProbeError::MissingUsage);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout() {
        let provider = ScriptedProvider::new().with(
            "hi",
            Script::new()
                .content("slow")
                .wait(Duration::from_secs(30))
                .usage(1, 1),
        );

        let err = probe(&provider, "m", "hi", Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, ProbeError::Timeout(Duration::from_secs(5)));
    }
}
