use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{BodyLines, EngineAdapter, EngineConfig, EventSender, EventStream, HealthStatus, ModelInfo};
use crate::client::{self, AdapterError};
use crate::request::{CompletionInfo, RequestSpec};
use crate::tokenizer::Tokenizer;

// Request types for the Chat Completions API
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

// Response types
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// Streaming response types
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub error: Option<StreamError>,
}

/// Error object a server may send in place of a chunk once the stream is open.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamError {
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

impl StreamError {
    /// Numeric codes are HTTP statuses. Anything else cannot be classified.
    fn into_adapter_error(self) -> AdapterError {
        let status = self.code.as_ref().and_then(|code| match code {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });
        let message = match self.error_type {
            Some(error_type) => format!("{}: {}", error_type, self.message),
            None => self.message,
        };
        match status.and_then(|s| u16::try_from(s).ok()) {
            Some(status @ 400..=499) => AdapterError::Client { status, message },
            Some(status @ 500..=599) => AdapterError::Server { status, message },
            _ => AdapterError::Protocol(format!("error in stream: {}", message)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

// Models list response
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<Model>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub owned_by: Option<String>,
}

/// Adapter for OpenAI-compatible servers (vLLM, llama.cpp, SGLang, ...).
///
/// `base_url` includes the API prefix, e.g. `http://localhost:8000/v1`.
/// Each content-bearing SSE chunk counts as one token. When the server does
/// not report `usage`, prompt tokens are estimated with a BPE tokenizer and
/// completion tokens are the number of content chunks observed.
#[derive(Clone)]
pub struct OpenAiAdapter {
    client: Client,
    config: Arc<EngineConfig>,
    tokenizer: Arc<Tokenizer>,
}

impl OpenAiAdapter {
    pub fn new(config: EngineConfig, pool_size: usize) -> Result<Self> {
        let client = client::build_http_client(config.timeout, pool_size)?;
        let tokenizer = Tokenizer::new(config.model.as_deref().unwrap_or_default())?;
        Ok(Self {
            client,
            config: Arc::new(config),
            tokenizer: Arc::new(tokenizer),
        })
    }

    pub fn with_model(mut self, model: String) -> Self {
        match Tokenizer::new(&model) {
            Ok(tokenizer) => self.tokenizer = Arc::new(tokenizer),
            Err(e) => log::debug!("keeping default tokenizer for {}: {}", model, e),
        }
        let mut config = (*self.config).clone();
        config.model = Some(model);
        self.config = Arc::new(config);
        self
    }

    fn build_request(&self, spec: &RequestSpec) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.resolve_model(spec),
            messages: vec![Message {
                role: "user".to_string(),
                content: spec.prompt.clone(),
            }],
            max_tokens: spec.max_tokens,
            temperature: spec.temperature,
            stream: spec.stream,
            stream_options: spec.stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

impl EngineAdapter for OpenAiAdapter {
    fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn health_check(&self) -> HealthStatus {
        super::probe_health(&self.client, &self.config, "/models").await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AdapterError> {
        let url = client::join_url(&self.config.base_url, "/models");
        let response: ModelsResponse = client::get_json(
            &self.client,
            &url,
            self.config.api_key.as_deref(),
            self.config.timeout,
        )
        .await?;
        Ok(response
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                owned_by: m.owned_by,
            })
            .collect())
    }

    fn send_request(&self, spec: &RequestSpec) -> EventStream {
        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        let body = self.build_request(spec);
        // Estimated up front so tokenization never lands inside the timed call
        let estimated_prompt_tokens = self.tokenizer.count_tokens(&spec.prompt) as u32;

        EventStream::spawn(self.config.timeout, move |events| async move {
            let mut info = chat_completion(&client, &config, body, &events).await?;
            info.prompt_tokens.get_or_insert(estimated_prompt_tokens);
            Ok(info)
        })
    }
}

async fn chat_completion(
    client: &Client,
    config: &EngineConfig,
    body: ChatCompletionRequest,
    events: &EventSender,
) -> Result<CompletionInfo, AdapterError> {
    let url = client::join_url(&config.base_url, "/chat/completions");
    let stream = body.stream;
    let req = client::with_auth(
        client.post(&url).json(&body).header("Connection", "keep-alive"),
        config.api_key.as_deref(),
    );
    let response = client::send(req, config.timeout).await?;

    if !stream {
        let completion: ChatCompletionResponse = client::read_json(response, config.timeout).await?;
        if completion.choices.is_empty() {
            return Err(AdapterError::Protocol(
                "completion response has no choices".to_string(),
            ));
        }
        return Ok(CompletionInfo {
            prompt_tokens: completion.usage.as_ref().map(|u| u.prompt_tokens),
            completion_tokens: completion.usage.as_ref().map(|u| u.completion_tokens),
            eval_duration: None,
        });
    }

    let mut lines = BodyLines::new(response, events, config.timeout);
    let mut tokens = 0u32;
    let mut usage: Option<Usage> = None;
    let mut finished = false;

    while let Some(line) = lines.next_line().await? {
        let Some(data) = client::sse_data(&line) else {
            continue;
        };
        if data == "[DONE]" {
            finished = true;
            break;
        }

        let chunk: ChatCompletionChunk = serde_json::from_str(data)
            .map_err(|e| AdapterError::Protocol(format!("unparsable stream chunk {:?}: {}", data, e)))?;

        if let Some(error) = chunk.error {
            return Err(error.into_adapter_error());
        }

        for choice in &chunk.choices {
            if choice.delta.content.as_deref().is_some_and(|c| !c.is_empty()) {
                events.token(tokens).await;
                tokens += 1;
            }
            if choice.finish_reason.is_some() {
                finished = true;
            }
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
    }

    if !finished {
        return Err(AdapterError::Protocol(
            "stream ended without [DONE] or finish_reason".to_string(),
        ));
    }

    Ok(CompletionInfo {
        prompt_tokens: usage.as_ref().map(|u| u.prompt_tokens),
        completion_tokens: Some(usage.map_or(tokens, |u| u.completion_tokens)),
        eval_duration: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterKind;
    use crate::collector::StreamingMetricsCollector;
    use crate::request::{ErrorKind, StreamEvent};
    use crate::testing::{collect_events, serve};
    use std::time::Duration;
    use warp::Filter;

    fn spec(stream: bool) -> RequestSpec {
        RequestSpec {
            id: 7,
            prompt: "Say hello".to_string(),
            max_tokens: Some(16),
            temperature: Some(0.0),
            stream,
            model: None,
        }
    }

    fn adapter(base_url: String) -> OpenAiAdapter {
        let mut config = EngineConfig::new("vllm", AdapterKind::OpenAi, base_url);
        config.model = Some("test-model".to_string());
        config.timeout = Duration::from_secs(5);
        OpenAiAdapter::new(config, 4).unwrap()
    }

    #[test]
    fn test_request_serialization() {
        let adapter = adapter("http://localhost:1/v1".to_string());
        let body = serde_json::to_value(adapter.build_request(&spec(true))).unwrap();
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Say hello");
        assert_eq!(body["max_tokens"], 16);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);

        let body = serde_json::to_value(adapter.build_request(&spec(false))).unwrap();
        assert!(body.get("stream_options").is_none());
    }

    #[tokio::test]
    async fn test_streaming_chat_completion() {
        let sse = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
            "data: [DONE]\n\n",
        );
        let route = warp::path!("v1" / "chat" / "completions")
            .and(warp::post())
            .map(move || warp::reply::with_header(sse, "content-type", "text/event-stream"));
        let addr = serve(route).await;

        let adapter = adapter(format!("http://{}/v1", addr));
        let events = collect_events(adapter.send_request(&spec(true))).await;

        let tokens: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TokenReceived { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, vec![0, 1]);
        assert!(matches!(events[0], StreamEvent::RequestStarted { .. }));
        assert!(matches!(events[1], StreamEvent::FirstByteReceived { .. }));
        match events.last() {
            Some(StreamEvent::ResponseCompleted { info, .. }) => {
                assert_eq!(info.prompt_tokens, Some(5));
                assert_eq!(info.completion_tokens, Some(2));
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_streaming_chat_completion() {
        let body = serde_json::json!({
            "id": "cmpl-1",
            "object": "chat.completion",
            "created": 0,
            "model": "test-model",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        });
        let route = warp::path!("v1" / "chat" / "completions")
            .and(warp::post())
            .map(move || warp::reply::json(&body));
        let addr = serve(route).await;

        let adapter = adapter(format!("http://{}/v1", addr));
        let events = collect_events(adapter.send_request(&spec(false))).await;

        assert_eq!(events.len(), 2);
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::TokenReceived { .. })));
        match &events[1] {
            StreamEvent::ResponseCompleted { info, .. } => {
                assert_eq!(info.prompt_tokens, Some(9));
                assert_eq!(info.completion_tokens, Some(3));
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_usage_falls_back_to_counts() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"c\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let route = warp::path!("v1" / "chat" / "completions")
            .map(move || warp::reply::with_header(sse, "content-type", "text/event-stream"));
        let addr = serve(route).await;

        let adapter = adapter(format!("http://{}/v1", addr));
        let events = collect_events(adapter.send_request(&spec(true))).await;
        match events.last() {
            Some(StreamEvent::ResponseCompleted { info, .. }) => {
                assert_eq!(info.completion_tokens, Some(3));
                assert!(info.prompt_tokens.is_some_and(|n| n > 0));
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_errors_map_to_taxonomy() {
        let route = warp::path!("v1" / "chat" / "completions").map(|| {
            warp::reply::with_status("no such model", warp::http::StatusCode::NOT_FOUND)
        });
        let addr = serve(route).await;
        let adapter = adapter(format!("http://{}/v1", addr));
        let events = collect_events(adapter.send_request(&spec(true))).await;
        match events.last() {
            Some(StreamEvent::Error { error, .. }) => {
                assert_eq!(error.kind(), ErrorKind::Client);
                assert!(error.to_string().contains("404"));
            }
            other => panic!("expected client error, got {:?}", other),
        }

        let route = warp::path!("v1" / "chat" / "completions").map(|| {
            warp::reply::with_status("overloaded", warp::http::StatusCode::SERVICE_UNAVAILABLE)
        });
        let addr = serve(route).await;
        let adapter = self::adapter(format!("http://{}/v1", addr));
        let events = collect_events(adapter.send_request(&spec(true))).await;
        match events.last() {
            Some(StreamEvent::Error { error, .. }) => assert_eq!(error.kind(), ErrorKind::Server),
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_protocol_error() {
        let sse = "data: {not json}\n\n";
        let route = warp::path!("v1" / "chat" / "completions")
            .map(move || warp::reply::with_header(sse, "content-type", "text/event-stream"));
        let addr = serve(route).await;
        let adapter = adapter(format!("http://{}/v1", addr));
        let events = collect_events(adapter.send_request(&spec(true))).await;
        match events.last() {
            Some(StreamEvent::Error { error, .. }) => assert_eq!(error.kind(), ErrorKind::Protocol),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_inside_stream_fails_the_call() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"error\":{\"object\":\"error\",\"message\":\"CUDA out of memory\",\"type\":\"InternalServerError\",\"code\":500}}\n\n",
            "data: [DONE]\n\n",
        );
        let route = warp::path!("v1" / "chat" / "completions")
            .map(move || warp::reply::with_header(sse, "content-type", "text/event-stream"));
        let addr = serve(route).await;
        let adapter = adapter(format!("http://{}/v1", addr));
        let events = collect_events(adapter.send_request(&spec(true))).await;
        match events.last() {
            Some(StreamEvent::Error { error, .. }) => {
                assert_eq!(error.kind(), ErrorKind::Server);
                assert!(error.to_string().contains("CUDA out of memory"));
            }
            other => panic!("expected server error, got {:?}", other),
        }

        let mut collector = StreamingMetricsCollector::new(7, "vllm", None, events[0].at());
        for event in &events {
            collector.observe(event);
        }
        let result = collector.into_result(1);
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Server));
        assert_eq!(result.completion_tokens, None);
    }

    #[test]
    fn test_stream_error_classification() {
        let parse = |json: &str| {
            serde_json::from_str::<ChatCompletionChunk>(json)
                .unwrap()
                .error
                .unwrap()
                .into_adapter_error()
                .kind()
        };
        assert_eq!(
            parse(r#"{"error":{"message":"bad prompt","code":400}}"#),
            ErrorKind::Client
        );
        assert_eq!(
            parse(r#"{"error":{"message":"busy","code":"503"}}"#),
            ErrorKind::Server
        );
        assert_eq!(
            parse(r#"{"error":{"message":"oops","code":"context_length_exceeded"}}"#),
            ErrorKind::Protocol
        );
        assert_eq!(parse(r#"{"error":{"message":"oops"}}"#), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let addr = crate::testing::unused_addr().await;
        let adapter = adapter(format!("http://{}/v1", addr));
        let events = collect_events(adapter.send_request(&spec(true))).await;
        match events.last() {
            Some(StreamEvent::Error { error, .. }) => {
                assert_eq!(error.kind(), ErrorKind::Connection)
            }
            other => panic!("expected connection error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stall_after_first_byte_times_out() {
        let addr = crate::testing::stalling_server(
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
        )
        .await;
        let mut config = EngineConfig::new("slow", AdapterKind::OpenAi, format!("http://{}/v1", addr));
        config.timeout = Duration::from_millis(200);
        let adapter = OpenAiAdapter::new(config, 1).unwrap();

        let events = collect_events(adapter.send_request(&spec(true))).await;
        assert!(events.iter().any(|e| matches!(e, StreamEvent::FirstByteReceived { .. })));
        match events.last() {
            Some(StreamEvent::Error { error, .. }) => assert_eq!(error.kind(), ErrorKind::Timeout),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_list_models_and_health() {
        let models = warp::path!("v1" / "models").map(|| {
            warp::reply::json(&serde_json::json!({
                "object": "list",
                "data": [{"id": "llama-3.1-8b", "object": "model", "owned_by": "vllm"}]
            }))
        });
        let addr = serve(models).await;
        let adapter = adapter(format!("http://{}/v1", addr));

        let listed = adapter.list_models().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "llama-3.1-8b");
        assert_eq!(listed[0].owned_by.as_deref(), Some("vllm"));

        let health = adapter.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.engine, "vllm");
    }
}
