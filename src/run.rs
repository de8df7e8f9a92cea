use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::pricing::PricingError;
use crate::result::PromptResult;

const MAX_NAME_LEN: usize = 255;

/// Reasons a run cannot start. The run stays [`RunStatus::Pending`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("Run has no prompts")]
    EmptyPromptSet,

    #[error("Prompt {index} is empty")]
    EmptyPrompt { index: usize },

    #[error("Run name must be between 1 and {MAX_NAME_LEN} characters")]
    InvalidName,

    #[error(transparent)]
    UnknownModel(#[from] PricingError),

    #[error("Run {0} has already been started")]
    AlreadyStarted(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
        };
        f.write_str(status)
    }
}

/// What a caller submits to start a benchmark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub name: String,
    pub model: String,
    pub prompts: Vec<String>,
}

impl RunRequest {
    /// Checks the request shape. Model validity is checked by the runner
    /// against its pricing table.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.name.trim().is_empty() || self.name.chars().count() > MAX_NAME_LEN {
            return Err(RunError::InvalidName);
        }
        if self.prompts.is_empty() {
            return Err(RunError::EmptyPromptSet);
        }
        if let Some(index) = self.prompts.iter().position(|p| p.trim().is_empty()) {
            return Err(RunError::EmptyPrompt { index });
        }
        Ok(())
    }
}

/// A named set of prompts executed concurrently against one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRun {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub prompts: Vec<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Filled once, in prompt order, when the run completes.
    pub results: Vec<PromptResult>,
}

impl BenchmarkRun {
    pub fn new(request: RunRequest) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: request.name,
            model: request.model,
            prompts: request.prompts,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            results: Vec::new(),
        }
    }

    pub(crate) fn request(&self) -> RunRequest {
        RunRequest {
            name: self.name.clone(),
            model: self.model.clone(),
            prompts: self.prompts.clone(),
        }
    }

    pub(crate) fn mark_running(&mut self) {
        debug_assert_eq!(self.status, RunStatus::Pending);
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now().max(self.created_at));
    }

    pub(crate) fn mark_completed(&mut self, results: Vec<PromptResult>) {
        debug_assert_eq!(self.status, RunStatus::Running);
        self.results = results;
        self.status = RunStatus::Completed;
        let started = self.started_at.unwrap_or(self.created_at);
        self.completed_at = Some(Utc::now().max(started));
    }

    pub fn successful_results(&self) -> impl Iterator<Item = &PromptResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failed_results(&self) -> impl Iterator<Item = &PromptResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}
