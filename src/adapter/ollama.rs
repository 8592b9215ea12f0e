use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{BodyLines, EngineAdapter, EngineConfig, EventSender, EventStream, HealthStatus, ModelInfo};
use crate::client::{self, AdapterError};
use crate::request::{CompletionInfo, RequestSpec};

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
    pub stream: bool,
    pub options: GenerateOptions,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// One NDJSON record from `/api/generate`. The final record has `done: true`
/// and carries the server-side counters.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub prompt_eval_count: Option<u32>,
    #[serde(default)]
    pub eval_count: Option<u32>,
    /// Nanoseconds
    #[serde(default)]
    pub eval_duration: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<Tag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tag {
    pub name: String,
}

#[derive(Clone)]
pub struct OllamaAdapter {
    client: Client,
    config: Arc<EngineConfig>,
}

impl OllamaAdapter {
    pub fn new(config: EngineConfig, pool_size: usize) -> Result<Self> {
        let client = client::build_http_client(config.timeout, pool_size)?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn with_model(mut self, model: String) -> Self {
        let mut config = (*self.config).clone();
        config.model = Some(model);
        self.config = Arc::new(config);
        self
    }

    fn build_request(&self, spec: &RequestSpec) -> GenerateRequest {
        GenerateRequest {
            model: self.config.resolve_model(spec),
            prompt: spec.prompt.clone(),
            stream: spec.stream,
            options: GenerateOptions {
                num_predict: spec.max_tokens,
                temperature: spec.temperature,
            },
        }
    }
}

impl EngineAdapter for OllamaAdapter {
    fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn health_check(&self) -> HealthStatus {
        super::probe_health(&self.client, &self.config, "/").await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AdapterError> {
        let url = client::join_url(&self.config.base_url, "/api/tags");
        let tags: TagsResponse = client::get_json(
            &self.client,
            &url,
            self.config.api_key.as_deref(),
            self.config.timeout,
        )
        .await?;
        Ok(tags
            .models
            .into_iter()
            .map(|t| ModelInfo {
                id: t.name,
                owned_by: None,
            })
            .collect())
    }

    fn send_request(&self, spec: &RequestSpec) -> EventStream {
        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        let body = self.build_request(spec);

        EventStream::spawn(self.config.timeout, move |events| async move {
            generate(&client, &config, body, &events).await
        })
    }
}

async fn generate(
    client: &Client,
    config: &EngineConfig,
    body: GenerateRequest,
    events: &EventSender,
) -> Result<CompletionInfo, AdapterError> {
    let url = client::join_url(&config.base_url, "/api/generate");
    let req = client::with_auth(client.post(&url).json(&body), config.api_key.as_deref());
    let response = client::send(req, config.timeout).await?;

    if !body.stream {
        let chunk: GenerateChunk = client::read_json(response, config.timeout).await?;
        return final_chunk(chunk);
    }

    let mut lines = BodyLines::new(response, events, config.timeout);
    let mut tokens = 0u32;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let chunk: GenerateChunk = serde_json::from_str(line)
            .map_err(|e| AdapterError::Protocol(format!("unparsable NDJSON line {:?}: {}", line, e)))?;

        if chunk.done || chunk.error.is_some() {
            let mut info = final_chunk(chunk)?;
            info.completion_tokens.get_or_insert(tokens);
            return Ok(info);
        }
        if !chunk.response.is_empty() {
            events.token(tokens).await;
            tokens += 1;
        }
    }

    Err(AdapterError::Protocol(
        "stream ended before the done record".to_string(),
    ))
}

fn final_chunk(chunk: GenerateChunk) -> Result<CompletionInfo, AdapterError> {
    if let Some(error) = chunk.error {
        return Err(AdapterError::Server {
            status: 500,
            message: error,
        });
    }
    Ok(CompletionInfo {
        prompt_tokens: chunk.prompt_eval_count,
        completion_tokens: chunk.eval_count,
        eval_duration: chunk.eval_duration.map(Duration::from_nanos),
    })
}
