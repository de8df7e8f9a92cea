//! Scripted in-memory provider for exercising the engine without a network.

use async_trait::async_trait;
use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::client::{ClientError, EventStream, StreamEvent, StreamProvider};

#[derive(Debug, Clone)]
enum Step {
    Wait(Duration),
    Emit(StreamEvent),
    Fail(ClientError),
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    open_delay: Duration,
    open_error: Option<ClientError>,
    steps: VecDeque<Step>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn open_error(mut self, error: ClientError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn wait(mut self, delay: Duration) -> Self {
        self.steps.push_back(Step::Wait(delay));
        self
    }

    pub fn served_model(mut self, model: &str) -> Self {
        self.steps
            .push_back(Step::Emit(StreamEvent::Model(model.to_string())));
        self
    }

    pub fn content(mut self, text: &str) -> Self {
        self.steps
            .push_back(Step::Emit(StreamEvent::Content(text.to_string())));
        self
    }

    pub fn usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.steps.push_back(Step::Emit(StreamEvent::Usage {
            input_tokens,
            output_tokens,
        }));
        self
    }

    pub fn fail(mut self, error: ClientError) -> Self {
        self.steps.push_back(Step::Fail(error));
        self
    }

    /// Content, then usage, after `delay`.
    pub fn reply(delay: Duration, text: &str, input_tokens: u64, output_tokens: u64) -> Self {
        Self::new()
            .wait(delay)
            .content(text)
            .usage(input_tokens, output_tokens)
    }
}

/// Decrements the in-flight counter when the stream is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Answers each prompt with a pre-recorded script.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: HashMap<String, Script>,
    opened: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, prompt: &str, script: Script) -> Self {
        self.scripts.insert(prompt.to_string(), script);
        self
    }

    /// Number of streams opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamProvider for ScriptedProvider {
    async fn open_stream(&self, _model: &str, prompt: &str) -> Result<EventStream, ClientError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(prompt)
            .cloned()
            .ok_or_else(|| ClientError::Other(format!("no script for prompt {:?}", prompt)))?;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.in_flight));

        tokio::time::sleep(script.open_delay).await;
        if let Some(error) = script.open_error {
            return Err(error);
        }

        let state = (script.steps, guard);
        Ok(Box::pin(stream::unfold(state, |(mut steps, guard)| async move {
            while let Some(step) = steps.pop_front() {
                match step {
                    Step::Wait(delay) => tokio::time::sleep(delay).await,
                    Step::Emit(event) => return Some((Ok(event), (steps, guard))),
                    Step::Fail(error) => {
                        steps.clear();
                        return Some((Err(error), (steps, guard)));
                    }
                }
            }
            None
        })))
    }
}
