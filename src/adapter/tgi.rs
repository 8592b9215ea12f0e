use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{BodyLines, EngineAdapter, EngineConfig, EventSender, EventStream, HealthStatus, ModelInfo};
use crate::client::{self, AdapterError};
use crate::request::{CompletionInfo, RequestSpec};

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub inputs: String,
    pub parameters: GenerateParameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    /// TGI rejects a temperature of zero; greedy decoding is `do_sample: false`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub do_sample: bool,
    pub details: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    pub generated_text: String,
    #[serde(default)]
    pub details: Option<Details>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Details {
    pub generated_tokens: u32,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub prefill: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamResponse {
    pub token: Token,
    #[serde(default)]
    pub generated_text: Option<String>,
    #[serde(default)]
    pub details: Option<Details>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    pub id: u32,
    pub text: String,
    #[serde(default)]
    pub special: bool,
}

/// Error payload TGI sends either as a response body or as an SSE event.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_type: Option<String>,
}

impl ErrorResponse {
    fn into_adapter_error(self) -> AdapterError {
        match self.error_type.as_deref() {
            Some("validation") => AdapterError::Client {
                status: 422,
                message: self.error,
            },
            Some("overloaded") => AdapterError::Server {
                status: 503,
                message: self.error,
            },
            _ => AdapterError::Server {
                status: 500,
                message: self.error,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Info {
    pub model_id: String,
}

/// Adapter for HuggingFace text-generation-inference.
///
/// Streams from `/generate_stream`; every non-special token event counts as
/// one token. The served model is fixed by the server, so `model` is only
/// used for reporting.
#[derive(Clone)]
pub struct TgiAdapter {
    client: Client,
    config: Arc<EngineConfig>,
}

impl TgiAdapter {
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

    fn build_request(spec: &RequestSpec) -> GenerateRequest {
        let temperature = spec.temperature.filter(|t| *t > 0.0);
        GenerateRequest {
            inputs: spec.prompt.clone(),
            parameters: GenerateParameters {
                max_new_tokens: spec.max_tokens,
                temperature,
                do_sample: temperature.is_some(),
                details: true,
            },
        }
    }
}

impl EngineAdapter for TgiAdapter {
    fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn health_check(&self) -> HealthStatus {
        super::probe_health(&self.client, &self.config, "/health").await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AdapterError> {
        let url = client::join_url(&self.config.base_url, "/info");
        let info: Info = client::get_json(
            &self.client,
            &url,
            self.config.api_key.as_deref(),
            self.config.timeout,
        )
        .await?;
        Ok(vec![ModelInfo {
            id: info.model_id,
            owned_by: None,
        }])
    }

    fn send_request(&self, spec: &RequestSpec) -> EventStream {
        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        let body = Self::build_request(spec);
        let stream = spec.stream;

        EventStream::spawn(self.config.timeout, move |events| async move {
            generate(&client, &config, body, stream, &events).await
        })
    }
}

async fn generate(
    client: &Client,
    config: &EngineConfig,
    body: GenerateRequest,
    stream: bool,
    events: &EventSender,
) -> Result<CompletionInfo, AdapterError> {
    let path = if stream { "/generate_stream" } else { "/generate" };
    let url = client::join_url(&config.base_url, path);
    let req = client::with_auth(client.post(&url).json(&body), config.api_key.as_deref());
    let response = client::send(req, config.timeout).await?;

    if !stream {
        let generated: GenerateResponse = client::read_json(response, config.timeout).await?;
        return Ok(completion_info(generated.details.as_ref(), None));
    }

    let mut lines = BodyLines::new(response, events, config.timeout);
    let mut tokens = 0u32;
    let mut details: Option<Details> = None;
    let mut finished = false;

    while let Some(line) = lines.next_line().await? {
        let Some(data) = client::sse_data(&line) else {
            continue;
        };
        if data.is_empty() {
            continue;
        }

        if let Ok(error) = serde_json::from_str::<ErrorResponse>(data) {
            return Err(error.into_adapter_error());
        }

        let event: StreamResponse = serde_json::from_str(data)
            .map_err(|e| AdapterError::Protocol(format!("unparsable stream event {:?}: {}", data, e)))?;

        if !event.token.special {
            events.token(tokens).await;
            tokens += 1;
        }
        if event.generated_text.is_some() {
            finished = true;
            details = event.details;
        }
    }

    if !finished {
        return Err(AdapterError::Protocol(
            "stream ended before the final generated_text event".to_string(),
        ));
    }

    Ok(completion_info(details.as_ref(), Some(tokens)))
}

fn completion_info(details: Option<&Details>, observed_tokens: Option<u32>) -> CompletionInfo {
    CompletionInfo {
        prompt_tokens: details
            .filter(|d| !d.prefill.is_empty())
            .map(|d| d.prefill.len() as u32),
        completion_tokens: details.map(|d| d.generated_tokens).or(observed_tokens),
        eval_duration: None,
    }
}
