//! Backend adapters.
//!
//! Each adapter translates a [`RequestSpec`] into one backend family's wire
//! protocol and turns the response into a sequence of [`StreamEvent`]s. The
//! set of families is closed; nothing outside this module branches on which
//! backend it is talking to.

pub mod ollama;
pub mod openai;
pub mod tgi;

use anyhow::Result;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::{AdapterError, LineBuffer};
use crate::request::{CompletionInfo, RequestSpec, StreamEvent};

pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use tgi::TgiAdapter;

/// Upper bound on a single health probe, regardless of the call timeout.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Events buffered between the I/O task and the consumer of one call.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterKind {
    /// OpenAI-compatible `/chat/completions` (vLLM, llama.cpp, SGLang, ...)
    #[serde(rename = "openai")]
    OpenAi,
    /// HuggingFace text-generation-inference
    #[serde(rename = "tgi")]
    Tgi,
    #[serde(rename = "ollama")]
    Ollama,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdapterKind::OpenAi => "openai",
            AdapterKind::Tgi => "tgi",
            AdapterKind::Ollama => "ollama",
        })
    }
}

/// Resolved connection settings for one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub name: String,
    pub kind: AdapterKind,
    pub base_url: String,
    /// Deadline for one call, from dispatch to the terminal event
    pub timeout: Duration,
    /// Retries after the first attempt for transient failures
    pub retry_attempts: u32,
    /// Path probed by `health_check`; the adapter default is used when unset
    pub health_endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl EngineConfig {
    pub fn new(name: impl Into<String>, kind: AdapterKind, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            base_url: base_url.into(),
            timeout: Duration::from_secs(60),
            retry_attempts: 3,
            health_endpoint: None,
            api_key: None,
            model: None,
        }
    }

    /// Model for a spec: the spec's own choice wins over the engine default.
    pub fn resolve_model(&self, spec: &RequestSpec) -> Option<String> {
        spec.model.clone().or_else(|| self.model.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub engine: String,
    pub healthy: bool,
    pub latency: Duration,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub owned_by: Option<String>,
}

/// Capability set shared by every backend family.
///
/// Implementations must be cheap to share across tasks: many calls to
/// `send_request` may be outstanding at once over one connection pool.
pub trait EngineAdapter: Send + Sync + 'static {
    fn config(&self) -> &EngineConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Probe the backend. Failures are reported in the status, never returned.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;

    fn list_models(&self) -> impl Future<Output = Result<Vec<ModelInfo>, AdapterError>> + Send;

    /// Start one call. The returned stream yields `RequestStarted`, then any
    /// progress events, then exactly one terminal event.
    fn send_request(&self, spec: &RequestSpec) -> EventStream;
}

/// Handle used by an adapter's I/O task to report progress.
///
/// Timestamps are taken when the method is called, i.e. when the adapter
/// has just observed the chunk, not when the consumer reads the event.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSender {
    pub async fn first_byte(&self) {
        let at = Instant::now();
        self.emit(StreamEvent::FirstByteReceived { at }).await;
    }

    pub async fn token(&self, index: u32) {
        let at = Instant::now();
        self.emit(StreamEvent::TokenReceived { index, at }).await;
    }

    async fn emit(&self, event: StreamEvent) {
        // The consumer may already be gone (cancelled run); nothing to do then.
        let _ = self.tx.send(event).await;
    }
}

/// Pull-based sequence of events for one call.
///
/// The I/O runs on its own task; dropping the stream aborts it, which closes
/// the underlying connection.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<()>,
}

impl EventStream {
    /// Run `call` under `timeout`, framing its progress between
    /// `RequestStarted` and exactly one terminal event.
    ///
    /// On deadline expiry the call future is dropped before `Error(Timeout)`
    /// is sent, so no progress event can follow the terminal one.
    pub fn spawn<F, Fut>(timeout: Duration, call: F) -> Self
    where
        F: FnOnce(EventSender) -> Fut + Send + 'static,
        Fut: Future<Output = Result<CompletionInfo, AdapterError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let _ = tx.send(StreamEvent::RequestStarted { at: started }).await;

            let sender = EventSender { tx: tx.clone() };
            let outcome = tokio::time::timeout(timeout, call(sender)).await;
            let at = Instant::now();
            let terminal = match outcome {
                Ok(Ok(info)) => StreamEvent::ResponseCompleted { at, info },
                Ok(Err(error)) => StreamEvent::Error { at, error },
                Err(_) => StreamEvent::Error {
                    at,
                    error: AdapterError::Timeout(timeout),
                },
            };
            let _ = tx.send(terminal).await;
        });
        Self { rx, task }
    }

    /// Next event, or `None` once the call has finished and been drained.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Newline-framed body reader that reports the first received byte.
pub(crate) struct BodyLines<'a> {
    response: Response,
    buffer: LineBuffer,
    events: &'a EventSender,
    timeout: Duration,
    seen_bytes: bool,
    ended: bool,
}

impl<'a> BodyLines<'a> {
    pub(crate) fn new(response: Response, events: &'a EventSender, timeout: Duration) -> Self {
        Self {
            response,
            buffer: LineBuffer::new(),
            events,
            timeout,
            seen_bytes: false,
            ended: false,
        }
    }

    pub(crate) async fn next_line(&mut self) -> Result<Option<String>, AdapterError> {
        loop {
            if let Some(line) = self.buffer.next_line() {
                return Ok(Some(line));
            }
            if self.ended {
                return Ok(self.buffer.finish());
            }

            match self.response.chunk().await {
                Ok(Some(bytes)) => {
                    if !self.seen_bytes && !bytes.is_empty() {
                        self.seen_bytes = true;
                        self.events.first_byte().await;
                    }
                    self.buffer.push(&bytes);
                }
                Ok(None) => self.ended = true,
                Err(e) => return Err(AdapterError::from_reqwest(e, self.timeout)),
            }
        }
    }
}

/// GET `url` and report whether the backend answered with a 2xx.
pub(crate) async fn probe_health(
    client: &Client,
    config: &EngineConfig,
    default_endpoint: &str,
) -> HealthStatus {
    let endpoint = config
        .health_endpoint
        .as_deref()
        .unwrap_or(default_endpoint);
    let url = crate::client::join_url(&config.base_url, endpoint);
    let timeout = config.timeout.min(HEALTH_CHECK_TIMEOUT);
    let started = Instant::now();

    let req = crate::client::with_auth(client.get(&url), config.api_key.as_deref()).timeout(timeout);
    let outcome = crate::client::send(req, timeout).await;
    let latency = started.elapsed();

    match outcome {
        Ok(_) => HealthStatus {
            engine: config.name.clone(),
            healthy: true,
            latency,
            detail: None,
        },
        Err(e) => {
            log::debug!("Health check for {} at {} failed: {}", config.name, url, e);
            HealthStatus {
                engine: config.name.clone(),
                healthy: false,
                latency,
                detail: Some(e.to_string()),
            }
        }
    }
}

/// The closed set of backend families behind one type.
#[derive(Clone)]
pub enum Adapter {
    OpenAi(OpenAiAdapter),
    Tgi(TgiAdapter),
    Ollama(OllamaAdapter),
}

impl Adapter {
    /// Build the adapter for `config.kind`, with a pool sized for `pool_size`
    /// concurrent calls. Fails if `base_url` is not a usable endpoint.
    pub fn new(config: EngineConfig, pool_size: usize) -> Result<Self> {
        crate::client::validate_base_url(&config.base_url)?;
        Ok(match config.kind {
            AdapterKind::OpenAi => Adapter::OpenAi(OpenAiAdapter::new(config, pool_size)?),
            AdapterKind::Tgi => Adapter::Tgi(TgiAdapter::new(config, pool_size)?),
            AdapterKind::Ollama => Adapter::Ollama(OllamaAdapter::new(config, pool_size)?),
        })
    }

    /// Set the default model used when a spec does not name one.
    pub fn with_model(self, model: String) -> Self {
        match self {
            Adapter::OpenAi(a) => Adapter::OpenAi(a.with_model(model)),
            Adapter::Tgi(a) => Adapter::Tgi(a.with_model(model)),
            Adapter::Ollama(a) => Adapter::Ollama(a.with_model(model)),
        }
    }
}

impl EngineAdapter for Adapter {
    fn config(&self) -> &EngineConfig {
        match self {
            Adapter::OpenAi(a) => a.config(),
            Adapter::Tgi(a) => a.config(),
            Adapter::Ollama(a) => a.config(),
        }
    }

    async fn health_check(&self) -> HealthStatus {
        match self {
            Adapter::OpenAi(a) => a.health_check().await,
            Adapter::Tgi(a) => a.health_check().await,
            Adapter::Ollama(a) => a.health_check().await,
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AdapterError> {
        match self {
            Adapter::OpenAi(a) => a.list_models().await,
            Adapter::Tgi(a) => a.list_models().await,
            Adapter::Ollama(a) => a.list_models().await,
        }
    }

    fn send_request(&self, spec: &RequestSpec) -> EventStream {
        match self {
            Adapter::OpenAi(a) => a.send_request(spec),
            Adapter::Tgi(a) => a.send_request(spec),
            Adapter::Ollama(a) => a.send_request(spec),
        }
    }
}
