//! Shared fixtures for unit tests: in-process mock servers and an
//! instrumented stub adapter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use warp::{Filter, Reply};

use crate::adapter::{AdapterKind, EngineAdapter, EngineConfig, EventStream, HealthStatus, ModelInfo};
use crate::client::AdapterError;
use crate::request::{CompletionInfo, RequestSpec, StreamEvent};

/// Serve `filter` on an ephemeral localhost port for the rest of the test.
pub async fn serve<F, R>(filter: F) -> SocketAddr
where
    F: Filter<Extract = (R,), Error = warp::Rejection> + Clone + Send + Sync + 'static,
    R: Reply,
{
    let (addr, server) = warp::serve(filter).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

/// A localhost address nothing is listening on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Answer every request with a chunked 200 carrying `first_chunk`, then
/// hold the connection open without sending anything else.
pub async fn stalling_server(first_chunk: &str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let chunk = first_chunk.to_string();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let chunk = chunk.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                    chunk.len(),
                    chunk
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    addr
}

pub async fn collect_events(mut stream: EventStream) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        events.push(event);
    }
    events
}

/// How a [`StubAdapter`] call fails, if at all.
#[derive(Debug, Clone)]
pub enum Failure {
    Never,
    Always(AdapterError),
    /// The first `n` calls (counted across all requests) fail
    FirstCalls(usize, AdapterError),
    /// Calls for these request ids always fail
    Ids(Vec<u64>, AdapterError),
    /// Never answer; the call ends only by timeout or cancellation
    Hang,
}

#[derive(Debug, Default)]
pub struct StubState {
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub calls: AtomicUsize,
}

impl StubState {
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

enum Outcome {
    Succeed,
    Fail(AdapterError),
    Hang,
}

struct ActiveGuard(Arc<StubState>);

impl ActiveGuard {
    fn enter(state: &Arc<StubState>) -> Self {
        let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(state))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Adapter that fabricates events locally and counts simultaneous calls.
#[derive(Clone)]
pub struct StubAdapter {
    config: Arc<EngineConfig>,
    tokens: u32,
    gap: Duration,
    failure: Failure,
    healthy: bool,
    pub state: Arc<StubState>,
}

impl StubAdapter {
    pub fn new(name: &str) -> Self {
        let mut config = EngineConfig::new(name, AdapterKind::OpenAi, "http://stub.invalid");
        config.timeout = Duration::from_secs(5);
        config.retry_attempts = 0;
        Self {
            config: Arc::new(config),
            tokens: 2,
            gap: Duration::from_millis(5),
            failure: Failure::Never,
            healthy: true,
            state: Arc::default(),
        }
    }

    /// Emit `tokens` tokens, sleeping `gap` before each one.
    pub fn tokens(mut self, tokens: u32, gap: Duration) -> Self {
        self.tokens = tokens;
        self.gap = gap;
        self
    }

    pub fn failing(mut self, failure: Failure) -> Self {
        self.failure = failure;
        self
    }

    pub fn retries(mut self, retry_attempts: u32) -> Self {
        Arc::make_mut(&mut self.config).retry_attempts = retry_attempts;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        Arc::make_mut(&mut self.config).timeout = timeout;
        self
    }

    /// Count activity into `other`'s state, so both stubs share one counter.
    pub fn sharing(mut self, other: &StubAdapter) -> Self {
        self.state = Arc::clone(&other.state);
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    fn outcome(&self, call: usize, request_id: u64) -> Outcome {
        match &self.failure {
            Failure::Always(e) => Outcome::Fail(e.clone()),
            Failure::FirstCalls(n, e) if call < *n => Outcome::Fail(e.clone()),
            Failure::Ids(ids, e) if ids.contains(&request_id) => Outcome::Fail(e.clone()),
            Failure::Hang => Outcome::Hang,
            _ => Outcome::Succeed,
        }
    }
}

impl EngineAdapter for StubAdapter {
    fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus {
            engine: self.config.name.clone(),
            healthy: self.healthy,
            latency: Duration::ZERO,
            detail: (!self.healthy).then(|| "stub is down".to_string()),
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AdapterError> {
        Ok(vec![ModelInfo {
            id: "stub-model".to_string(),
            owned_by: None,
        }])
    }

    fn send_request(&self, spec: &RequestSpec) -> EventStream {
        let call = self.state.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcome(call, spec.id);
        let state = Arc::clone(&self.state);
        let tokens = self.tokens;
        let gap = self.gap;

        EventStream::spawn(self.config.timeout, move |events| async move {
            let _active = ActiveGuard::enter(&state);
            match outcome {
                Outcome::Fail(error) => {
                    tokio::time::sleep(gap).await;
                    return Err(error);
                }
                Outcome::Hang => std::future::pending::<()>().await,
                Outcome::Succeed => {}
            }

            events.first_byte().await;
            for index in 0..tokens {
                tokio::time::sleep(gap).await;
                events.token(index).await;
            }
            Ok(CompletionInfo {
                prompt_tokens: Some(4),
                completion_tokens: Some(tokens),
                eval_duration: None,
            })
        })
    }
}
