use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP {status} client error: {message}")]
    Http4xx { status: u16, message: String },

    #[error("HTTP {status} server error: {message}")]
    Http5xx { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Other error: {0}")]
    Other(String),
}

impl ClientError {
    /// Whether opening the stream again may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClientError::Connection(_) => true,
            ClientError::Timeout(_) => true,
            ClientError::Http5xx { .. } => true,
            // Rate limited
            ClientError::Http4xx { status, .. } => *status == 429,
            ClientError::Parse(_) => false,
            ClientError::Stream(_) => false,
            ClientError::Other(_) => false,
        }
    }
}

/// One event of a streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The model that is serving the request, when the provider reports it.
    Model(String),
    /// A piece of generated text.
    Content(String),
    /// Final usage summary reported by the provider. Always the last event.
    Usage { input_tokens: u64, output_tokens: u64 },
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, ClientError>>;

/// Capability needed by the benchmark engine from an inference backend.
///
/// Implementations open one streaming generation per call. The returned
/// stream yields `Content` events followed by a single `Usage` event, or an
/// error at any point.
#[async_trait]
pub trait StreamProvider: Send + Sync + 'static {
    async fn open_stream(&self, model: &str, prompt: &str) -> Result<EventStream, ClientError>;
}

/// Configuration for creating an Anthropic client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the API, e.g. `https://api.anthropic.com/v1`
    pub base_url: String,
    pub api_key: Option<String>,
    /// Request timeout duration
    pub timeout: Duration,
    /// Maximum tokens to generate per prompt
    pub max_tokens: u32,
    /// Maximum number of retry attempts when opening a stream
    pub max_retries: u32,
    /// Initial delay in milliseconds for exponential backoff
    pub retry_initial_delay_ms: u64,
    /// Maximum delay in milliseconds for exponential backoff
    pub retry_max_delay_ms: u64,
    /// Connection pool size (should match concurrency)
    pub pool_size: usize,
}

/// Streaming client for the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    max_tokens: u32,
    max_retries: u32,
    retry_initial_delay_ms: u64,
    retry_max_delay_ms: u64,
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl AnthropicClient {
    /// Creates a client with connection pooling sized for the expected
    /// number of concurrent probes.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use stream_bench::client::{AnthropicClient, ClientConfig};
    /// use std::time::Duration;
    ///
    /// let client = AnthropicClient::new(ClientConfig {
    ///     base_url: "https://api.anthropic.com/v1".to_string(),
    ///     api_key: Some("sk-ant-...".to_string()),
    ///     timeout: Duration::from_secs(60),
    ///     max_tokens: 1024,
    ///     max_retries: 2,
    ///     retry_initial_delay_ms: 100,
    ///     retry_max_delay_ms: 10000,
    ///     pool_size: 10,
    /// })
    /// .unwrap();
    /// ```
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_size)
            .pool_idle_timeout(Duration::from_secs(300))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            timeout: config.timeout,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_initial_delay_ms: config.retry_initial_delay_ms,
            retry_max_delay_ms: config.retry_max_delay_ms,
        })
    }

    pub fn create_request(&self, model: &str, prompt: &str) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: true,
        }
    }

    /// Open a streaming request, retrying transient failures
    async fn open_with_retry(&self, request: MessagesRequest) -> Result<EventStream, ClientError> {
        let mut attempt = 0;

        loop {
            match self.open_internal(&request).await {
                Ok(stream) => {
                    if attempt > 0 {
                        log::debug!("Stream opened after {} retries", attempt);
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    if attempt < self.max_retries && e.is_retriable() {
                        crate::metrics::Metrics::record_retry();

                        let delay = self.calculate_backoff_delay(attempt);
                        log::debug!(
                            "Stream open failed (attempt {}/{}): {}. Retrying in {:?}",
                            attempt + 1,
                            self.max_retries + 1,
                            e,
                            delay
                        );

                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else {
                        if attempt > 0 {
                            log::debug!("Stream open failed after {} retries: {}", attempt, e);
                        }
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn open_internal(&self, request: &MessagesRequest) -> Result<EventStream, ClientError> {
        let url = format!("{}/messages", self.base_url);

        let mut req = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("accept", "text/event-stream")
            .json(request);

        if let Some(api_key) = &self.api_key {
            req = req.header("x-api-key", api_key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, self.timeout))?;

        if !response.status().is_success() {
            let status_code = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());

            return Err(match status_code {
                400..=499 => ClientError::Http4xx {
                    status: status_code,
                    message: text,
                },
                500..=599 => ClientError::Http5xx {
                    status: status_code,
                    message: text,
                },
                _ => ClientError::Other(format!("HTTP {}: {}", status_code, text)),
            });
        }

        let reader = SseReader {
            response,
            timeout: self.timeout,
            decoder: SseDecoder::default(),
            usage: UsageTracker::default(),
            pending: VecDeque::new(),
            finished: false,
        };

        Ok(Box::pin(stream::unfold(reader, |mut reader| async move {
            reader.next_event().await.map(|item| (item, reader))
        })))
    }

    /// Calculate exponential backoff delay with jitter
    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base_delay_ms = self
            .retry_initial_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        let capped_delay_ms = base_delay_ms.min(self.retry_max_delay_ms);

        // Jitter between 50% and 100% of the capped delay
        let mut rng = rand::thread_rng();
        let jitter_factor = rng.gen_range(0.5..=1.0);
        Duration::from_millis((capped_delay_ms as f64 * jitter_factor) as u64)
    }
}

#[async_trait]
impl StreamProvider for AnthropicClient {
    async fn open_stream(&self, model: &str, prompt: &str) -> Result<EventStream, ClientError> {
        let request = self.create_request(model, prompt);
        self.open_with_retry(request).await
    }
}

fn classify_reqwest_error(e: reqwest::Error, timeout: Duration) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout(timeout)
    } else if e.is_connect() {
        ClientError::Connection(e.to_string())
    } else if e.is_request() {
        let err_msg = e.to_string();
        if err_msg.contains("connection closed")
            || err_msg.contains("connection reset")
            || err_msg.contains("broken pipe")
            || err_msg.contains("connection refused")
        {
            ClientError::Connection(format!("Request error: {}", e))
        } else {
            ClientError::Other(format!("Request error: {}", e))
        }
    } else if e.is_decode() || e.is_body() {
        ClientError::Connection(format!("Body error: {}", e))
    } else {
        ClientError::Other(e.to_string())
    }
}

/// Pulls bytes off the response and turns them into [`StreamEvent`]s.
struct SseReader {
    response: reqwest::Response,
    timeout: Duration,
    decoder: SseDecoder,
    usage: UsageTracker,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl SseReader {
    async fn next_event(&mut self) -> Option<Result<StreamEvent, ClientError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }

            let bytes = match self.response.chunk().await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    // Server closed the stream, possibly without message_stop
                    self.finished = true;
                    continue;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(classify_reqwest_error(e, self.timeout)));
                }
            };

            for frame in self.decoder.push(&bytes) {
                match self.usage.apply(&frame) {
                    Ok(Some(event)) => {
                        let is_last = matches!(event, StreamEvent::Usage { .. });
                        self.pending.push_back(event);
                        if is_last {
                            self.finished = true;
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.finished = true;
                        self.pending.clear();
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

/// A single server-sent event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE parser. Frames may arrive split across network chunks,
/// even inside a multi-byte character, so raw bytes are buffered and only
/// complete frames are decoded as UTF-8.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some((end, delimiter)) = frame_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + delimiter).collect();
            if let Some(frame) = Self::parse_block(&String::from_utf8_lossy(&block[..end])) {
                frames.push(frame);
            }
        }
        frames
    }

    fn parse_block(block: &str) -> Option<SseFrame> {
        let mut frame = SseFrame::default();
        let mut data_lines = Vec::new();

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => frame.event = value.to_string(),
                "data" => data_lines.push(value),
                _ => {}
            }
        }

        if frame.event.is_empty() && data_lines.is_empty() {
            return None;
        }
        frame.data = data_lines.join("\n");
        Some(frame)
    }
}

/// Position and length of the first blank-line delimiter in `buffer`.
fn frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    (0..buffer.len()).find_map(|i| {
        let rest = &buffer[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}

// Streaming payloads of the Messages API

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Delta {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// Tracks usage across `message_start` / `message_delta` and maps SSE frames
/// to stream events.
#[derive(Debug, Default)]
struct UsageTracker {
    input_tokens: Option<u64>,
    output_tokens: u64,
}

impl UsageTracker {
    fn apply(&mut self, frame: &SseFrame) -> Result<Option<StreamEvent>, ClientError> {
        match frame.event.as_str() {
            "message_start" => {
                let start: MessageStart = parse_payload(frame)?;
                if let Some(usage) = start.message.usage {
                    self.merge(usage);
                }
                Ok(start.message.model.map(StreamEvent::Model))
            }
            "content_block_delta" => {
                let delta: ContentBlockDelta = parse_payload(frame)?;
                match delta.delta {
                    Delta::Text { text } => Ok(Some(StreamEvent::Content(text))),
                    Delta::Other => Ok(None),
                }
            }
            "message_delta" => {
                let delta: MessageDelta = parse_payload(frame)?;
                if let Some(usage) = delta.usage {
                    self.merge(usage);
                }
                Ok(None)
            }
            "message_stop" => match self.input_tokens {
                Some(input_tokens) => Ok(Some(StreamEvent::Usage {
                    input_tokens,
                    output_tokens: self.output_tokens,
                })),
                None => Err(ClientError::Parse(
                    "message_stop received before any usage was reported".to_string(),
                )),
            },
            "error" => {
                let message = match serde_json::from_str::<ErrorEvent>(&frame.data) {
                    Ok(event) => format!("{}: {}", event.error.kind, event.error.message),
                    Err(_) => frame.data.clone(),
                };
                Err(ClientError::Stream(message))
            }
            // ping, content_block_start, content_block_stop and unknown events
            _ => Ok(None),
        }
    }

    fn merge(&mut self, usage: UsagePayload) {
        if let Some(input) = usage.input_tokens {
            self.input_tokens = Some(input);
        }
        if let Some(output) = usage.output_tokens {
            self.output_tokens = output;
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(frame: &SseFrame) -> Result<T, ClientError> {
    serde_json::from_str(&frame.data)
        .map_err(|e| ClientError::Parse(format!("invalid {} payload: {}", frame.event, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SSE_BODY: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-haiku-20240307\",\"usage\":{\"input_tokens\":18,\"output_tokens\":1}}}\n\n\
event: content_block_start\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n\
event: ping\n\
data: {\"type\":\"ping\"}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there!\"}}\n\n\
event: content_block_stop\n\
data: {\"type\":\"content_block_stop\",\"index\":0}\n\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":5}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

    fn test_client(base_url: String, max_retries: u32) -> AnthropicClient {
        AnthropicClient::new(ClientConfig {
            base_url,
            api_key: Some("test-key".to_string()),
            timeout: Duration::from_secs(5),
            max_tokens: 64,
            max_retries,
            retry_initial_delay_ms: 1,
            retry_max_delay_ms: 5,
            pool_size: 4,
        })
        .unwrap()
    }

    #[test]
    fn test_sse_decoder_split_frames() {
        let mut decoder = SseDecoder::default();

        let frames = decoder.push(b"event: content_block_delta\ndata: {\"a\"");
        assert!(frames.is_empty());

        let frames = decoder.push(b":1}\n\nevent: ping\r\ndata: {}\r\n\r\n: comment\n\n");
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: "content_block_delta".to_string(),
                    data: "{\"a\":1}".to_string(),
                },
                SseFrame {
                    event: "ping".to_string(),
                    data: "{}".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_sse_decoder_multibyte_split() {
        let frame = "event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"café 你好\"}}\n\n";
        let bytes = frame.as_bytes();
        // One byte into the three-byte encoding of the CJK character
        let split = frame.find('你').unwrap() + 1;

        let mut decoder = SseDecoder::default();
        let mut tracker = UsageTracker::default();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let frames = decoder.push(&bytes[split..]);

        assert_eq!(frames.len(), 1);
        assert_eq!(
            tracker.apply(&frames[0]),
            Ok(Some(StreamEvent::Content("café 你好".to_string())))
        );
    }

    #[test]
    fn test_usage_tracker_events() {
        let mut decoder = SseDecoder::default();
        let mut tracker = UsageTracker::default();

        let events: Vec<StreamEvent> = decoder
            .push(SSE_BODY.as_bytes())
            .iter()
            .filter_map(|frame| tracker.apply(frame).unwrap())
            .collect();

        assert_eq!(
            events,
            vec![
                StreamEvent::Model("claude-3-haiku-20240307".to_string()),
                StreamEvent::Content("Hello".to_string()),
                StreamEvent::Content(" there!".to_string()),
                StreamEvent::Usage {
                    input_tokens: 18,
                    output_tokens: 5
                },
            ]
        );
    }

    #[test]
    fn test_error_event() {
        let mut tracker = UsageTracker::default();
        let frame = SseFrame {
            event: "error".to_string(),
            data: r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#
                .to_string(),
        };

        assert_eq!(
            tracker.apply(&frame),
            Err(ClientError::Stream("overloaded_error: Overloaded".to_string()))
        );
    }

    #[test]
    fn test_retriable_errors() {
        assert!(ClientError::Connection("reset".into()).is_retriable());
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(
            ClientError::Http5xx {
                status: 503,
                message: String::new()
            }
            .is_retriable()
        );
        assert!(
            ClientError::Http4xx {
                status: 429,
                message: String::new()
            }
            .is_retriable()
        );
        assert!(
            !ClientError::Http4xx {
                status: 401,
                message: String::new()
            }
            .is_retriable()
        );
        assert!(!ClientError::Parse("bad".into()).is_retriable());
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let client = AnthropicClient::new(ClientConfig {
            base_url: "http://localhost".to_string(),
            api_key: None,
            timeout: Duration::from_secs(1),
            max_tokens: 16,
            max_retries: 3,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 1000,
            pool_size: 1,
        })
        .unwrap();

        for _ in 0..20 {
            let first = client.calculate_backoff_delay(0);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));

            // 100 * 2^5 is capped at 1000
            let capped = client.calculate_backoff_delay(5);
            assert!(capped >= Duration::from_millis(500) && capped <= Duration::from_millis(1000));
        }
    }

    #[tokio::test]
    async fn test_open_stream_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
            .mount(&server)
            .await;

        let client = test_client(format!("{}/v1", server.uri()), 0);
        let stream = client
            .open_stream("claude-3-haiku-20240307", "Hi")
            .await
            .unwrap();
        let events: Vec<_> = stream.collect().await;

        assert_eq!(events.len(), 4);
        assert_eq!(
            events.last().cloned().unwrap(),
            Ok(StreamEvent::Usage {
                input_tokens: 18,
                output_tokens: 5
            })
        );
    }

    #[tokio::test]
    async fn test_http_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
            .expect(1)
            .mount(&server)
            .await;

        // Not retriable, so exactly one request even with retries enabled
        let client = test_client(format!("{}/v1", server.uri()), 3);
        let err = match client.open_stream("claude-3-haiku-20240307", "Hi").await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };

        assert_eq!(
            err,
            ClientError::Http4xx {
                status: 401,
                message: "invalid x-api-key".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(format!("{}/v1", server.uri()), 2);
        let result = client.open_stream("claude-3-haiku-20240307", "Hi").await;

        assert!(matches!(
            result,
            Err(ClientError::Http5xx { status: 503, .. })
        ));
    }
}
