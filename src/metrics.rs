use metriken::{Counter, Gauge, LazyCounter, LazyGauge, metric};
use serde::Serialize;

use crate::client::ClientError;
use crate::probe::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Failed(ErrorType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Connection,
    Http4xx(u16),
    Http5xx(u16),
    Parse,
    Stream,
    Timeout,
    Other,
}

impl From<&ProbeError> for ErrorType {
    fn from(error: &ProbeError) -> Self {
        match error {
            ProbeError::Client(client_error) => match client_error {
                ClientError::Connection(_) => ErrorType::Connection,
                ClientError::Http4xx { status, .. } => ErrorType::Http4xx(*status),
                ClientError::Http5xx { status, .. } => ErrorType::Http5xx(*status),
                ClientError::Parse(_) => ErrorType::Parse,
                ClientError::Stream(_) => ErrorType::Stream,
                ClientError::Timeout(_) => ErrorType::Timeout,
                ClientError::Other(_) => ErrorType::Other,
            },
            ProbeError::MissingUsage => ErrorType::Parse,
            ProbeError::Timeout(_) => ErrorType::Timeout,
            ProbeError::Panicked(_) | ProbeError::Dispatch(_) => ErrorType::Other,
        }
    }
}

// Request metrics
#[metric(
    name = "requests",
    description = "Total number of probe requests",
    metadata = { status = "sent" }
)]
pub static REQUESTS_SENT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Successful probe requests",
    metadata = { status = "success" }
)]
pub static REQUESTS_SUCCESS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Failed probe requests",
    metadata = { status = "failed" }
)]
pub static REQUESTS_FAILED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Timed out probe requests",
    metadata = { status = "timeout" }
)]
pub static REQUESTS_TIMEOUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Stream open retries",
    metadata = { status = "retried" }
)]
pub static REQUESTS_RETRIED: LazyCounter = LazyCounter::new(Counter::default);

// Error category metrics
#[metric(
    name = "errors",
    description = "Connection errors",
    metadata = { "type" = "connection" }
)]
pub static ERRORS_CONNECTION: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "HTTP 4xx errors",
    metadata = { "type" = "http_4xx" }
)]
pub static ERRORS_HTTP_4XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "HTTP 5xx errors",
    metadata = { "type" = "http_5xx" }
)]
pub static ERRORS_HTTP_5XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Parse errors",
    metadata = { "type" = "parse" }
)]
pub static ERRORS_PARSE: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Errors reported inside the event stream",
    metadata = { "type" = "stream" }
)]
pub static ERRORS_STREAM: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Other errors",
    metadata = { "type" = "other" }
)]
pub static ERRORS_OTHER: LazyCounter = LazyCounter::new(Counter::default);

// Token metrics
#[metric(
    name = "tokens",
    description = "Input tokens reported by the provider",
    metadata = { direction = "input" }
)]
pub static TOKENS_INPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens",
    description = "Output tokens reported by the provider",
    metadata = { direction = "output" }
)]
pub static TOKENS_OUTPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests_inflight",
    description = "Current number of probes in flight"
)]
pub static REQUESTS_INFLIGHT: LazyGauge = LazyGauge::new(Gauge::default);

/// Tracks one probe from dispatch to completion.
///
/// The in-flight gauge is released on drop. A guard dropped without
/// [`RequestGuard::complete`], because its task panicked, is counted as a
/// failed request.
#[must_use]
pub struct RequestGuard {
    completed: bool,
}

impl RequestGuard {
    pub fn start() -> Self {
        REQUESTS_SENT.increment();
        REQUESTS_INFLIGHT.increment();
        Self { completed: false }
    }

    pub fn complete(mut self, status: RequestStatus) {
        self.completed = true;
        Metrics::record_status(status);
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        REQUESTS_INFLIGHT.decrement();
        if !self.completed {
            Metrics::record_status(RequestStatus::Failed(ErrorType::Other));
        }
    }
}

/// Process-wide probe counters.
///
/// Values accumulate across every run executed by the process; take a
/// [`MetricsSnapshot`] before and after a run to get that run's share.
pub struct Metrics;

impl Metrics {
    fn record_status(status: RequestStatus) {
        match status {
            RequestStatus::Success => {
                REQUESTS_SUCCESS.increment();
            }
            RequestStatus::Failed(error_type) => {
                REQUESTS_FAILED.increment();
                match error_type {
                    ErrorType::Connection => ERRORS_CONNECTION.increment(),
                    ErrorType::Http4xx(_) => ERRORS_HTTP_4XX.increment(),
                    ErrorType::Http5xx(_) => ERRORS_HTTP_5XX.increment(),
                    ErrorType::Parse => ERRORS_PARSE.increment(),
                    ErrorType::Stream => ERRORS_STREAM.increment(),
                    ErrorType::Timeout => REQUESTS_TIMEOUT.increment(),
                    ErrorType::Other => ERRORS_OTHER.increment(),
                };
            }
        }
    }

    pub fn record_tokens(input: u64, output: u64) {
        TOKENS_INPUT.add(input);
        TOKENS_OUTPUT.add(output);
    }

    pub fn record_retry() {
        REQUESTS_RETRIED.increment();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    pub connection: u64,
    pub http_4xx: u64,
    pub http_5xx: u64,
    pub parse: u64,
    pub stream: u64,
    pub timeout: u64,
    pub other: u64,
}

impl ErrorCounts {
    pub fn total(&self) -> u64 {
        self.connection
            + self.http_4xx
            + self.http_5xx
            + self.parse
            + self.stream
            + self.timeout
            + self.other
    }
}

/// Point-in-time read of the counters above.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub errors: ErrorCounts,
    /// Probes in flight when the snapshot was taken.
    pub in_flight: i64,
}

impl MetricsSnapshot {
    pub fn capture() -> Self {
        Self {
            requests_sent: REQUESTS_SENT.value(),
            requests_success: REQUESTS_SUCCESS.value(),
            requests_failed: REQUESTS_FAILED.value(),
            retries: REQUESTS_RETRIED.value(),
            input_tokens: TOKENS_INPUT.value(),
            output_tokens: TOKENS_OUTPUT.value(),
            errors: ErrorCounts {
                connection: ERRORS_CONNECTION.value(),
                http_4xx: ERRORS_HTTP_4XX.value(),
                http_5xx: ERRORS_HTTP_5XX.value(),
                parse: ERRORS_PARSE.value(),
                stream: ERRORS_STREAM.value(),
                timeout: REQUESTS_TIMEOUT.value(),
                other: ERRORS_OTHER.value(),
            },
            in_flight: REQUESTS_INFLIGHT.value(),
        }
    }

    /// Counter growth since `earlier`. `in_flight` keeps this snapshot's value.
    pub fn since(&self, earlier: &MetricsSnapshot) -> Self {
        Self {
            requests_sent: self.requests_sent.saturating_sub(earlier.requests_sent),
            requests_success: self.requests_success.saturating_sub(earlier.requests_success),
            requests_failed: self.requests_failed.saturating_sub(earlier.requests_failed),
            retries: self.retries.saturating_sub(earlier.retries),
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
            errors: ErrorCounts {
                connection: self.errors.connection.saturating_sub(earlier.errors.connection),
                http_4xx: self.errors.http_4xx.saturating_sub(earlier.errors.http_4xx),
                http_5xx: self.errors.http_5xx.saturating_sub(earlier.errors.http_5xx),
                parse: self.errors.parse.saturating_sub(earlier.errors.parse),
                stream: self.errors.stream.saturating_sub(earlier.errors.stream),
                timeout: self.errors.timeout.saturating_sub(earlier.errors.timeout),
                other: self.errors.other.saturating_sub(earlier.errors.other),
            },
            in_flight: self.in_flight,
        }
    }
}
