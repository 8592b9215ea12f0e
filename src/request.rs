use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::client::AdapterError;

/// One benchmarked call, as produced by a scenario.
///
/// The same spec is dispatched once to every engine in a comparison run, so
/// `id` identifies the workload item rather than a single result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub id: u64,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
    /// Falls back to the engine's configured model when absent
    pub model: Option<String>,
}

/// Fixed failure taxonomy shared by every adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ConnectionError")]
    Connection,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "ServerError")]
    Server,
    #[serde(rename = "ClientError")]
    Client,
    #[serde(rename = "ProtocolError")]
    Protocol,
    #[serde(rename = "CancelledError")]
    Cancelled,
}

impl ErrorKind {
    /// Transient transport failures are the only ones worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Server)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Server => "ServerError",
            ErrorKind::Client => "ClientError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::Cancelled => "CancelledError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts and auxiliary timing reported by the backend at the end of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    /// Backend-reported generation time. Never used as a latency sample.
    pub eval_duration: Option<Duration>,
}

/// Backend-agnostic event emitted by an adapter during one call.
///
/// Every timestamp is taken from the local monotonic clock at the moment the
/// event is observed. A call emits `RequestStarted` first and exactly one of
/// `ResponseCompleted` / `Error` last.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    RequestStarted { at: Instant },
    FirstByteReceived { at: Instant },
    TokenReceived { index: u32, at: Instant },
    ResponseCompleted { at: Instant, info: CompletionInfo },
    Error { at: Instant, error: AdapterError },
}

impl StreamEvent {
    pub fn at(&self) -> Instant {
        match self {
            StreamEvent::RequestStarted { at }
            | StreamEvent::FirstByteReceived { at }
            | StreamEvent::TokenReceived { at, .. }
            | StreamEvent::ResponseCompleted { at, .. }
            | StreamEvent::Error { at, .. } => *at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::ResponseCompleted { .. } | StreamEvent::Error { .. }
        )
    }
}

/// Outcome of one (possibly retried) call against one engine.
///
/// All instants are offsets from the run epoch. `completion_time` is only set
/// when the backend finished the response; a failed call carries the
/// time-to-failure in `total_duration` instead.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestResult {
    pub request_id: u64,
    pub engine_name: String,
    pub model: Option<String>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub request_start: Duration,
    pub first_token_time: Option<Duration>,
    pub completion_time: Option<Duration>,
    pub total_duration: Option<Duration>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub ttft: Option<Duration>,
    pub inter_token_latency_avg: Option<Duration>,
    pub tokens_per_sec: Option<f64>,
    pub eval_duration: Option<Duration>,
}

impl RequestResult {
    /// Offset at which the call stopped producing events, successful or not.
    pub fn end_time(&self) -> Option<Duration> {
        self.completion_time
            .or_else(|| self.total_duration.map(|d| self.request_start + d))
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }
}
