use anyhow::Result;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::InputConfig;
use crate::request::RequestSpec;

/// A lazy sequence of request specs.
///
/// Cloning restarts the sequence from where the clone was taken, which is how
/// every engine in a comparison run receives the identical workload.
pub trait Scenario: Iterator<Item = RequestSpec> + Clone + Send + 'static {}

impl<T> Scenario for T where T: Iterator<Item = RequestSpec> + Clone + Send + 'static {}

/// A prompt to be sent to an engine.
///
/// Prompts are loaded from JSONL files where each line contains a JSON object
/// with a "prompt" field and an optional "max_tokens" field.
#[derive(Debug, Clone, Deserialize)]
pub struct Prompt {
    pub prompt: String,
    /// Overrides the scenario-wide `max_tokens` for this prompt
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Request fields shared by every spec of a scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub stream: bool,
    pub model: Option<String>,
    /// Prefix each prompt with its request id to defeat prefix caching
    pub cache_bust: bool,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: None,
            stream: true,
            model: None,
            cache_bust: false,
        }
    }
}

/// Endless scenario cycling over a prompt list with sequential ids.
#[derive(Debug, Clone)]
pub struct PromptScenario {
    prompts: Arc<[Prompt]>,
    defaults: Arc<RequestDefaults>,
    next_id: u64,
}

impl PromptScenario {
    pub fn new(prompts: Vec<Prompt>, defaults: RequestDefaults) -> Result<Self> {
        if prompts.is_empty() {
            anyhow::bail!("scenario has no prompts");
        }
        Ok(Self {
            prompts: prompts.into(),
            defaults: Arc::new(defaults),
            next_id: 0,
        })
    }

    /// Load, sample and optionally shuffle the prompt file named by `input`.
    pub async fn from_input(input: &InputConfig) -> Result<Self> {
        let prompts = load_prompts(&input.file).await?;
        let mut prompts: Vec<Prompt> = match input.sample_size {
            Some(sample_size) => prompts.into_iter().take(sample_size).collect(),
            None => prompts,
        };

        if input.shuffle {
            let mut rng = thread_rng();
            prompts.shuffle(&mut rng);
            info!("Shuffled {} prompts", prompts.len());
        }

        debug!("Loaded {} prompts from {}", prompts.len(), input.file.display());

        Self::new(
            prompts,
            RequestDefaults {
                max_tokens: input.max_tokens,
                temperature: input.temperature,
                stream: input.stream,
                model: None,
                cache_bust: input.cache_bust,
            },
        )
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

impl Iterator for PromptScenario {
    type Item = RequestSpec;

    fn next(&mut self) -> Option<RequestSpec> {
        let id = self.next_id;
        let prompt = self.prompts.get((id % self.prompts.len() as u64) as usize)?;
        self.next_id += 1;

        let text = if self.defaults.cache_bust {
            format!("[req-{}] {}", id, prompt.prompt)
        } else {
            prompt.prompt.clone()
        };

        Some(RequestSpec {
            id,
            prompt: text,
            max_tokens: Some(prompt.max_tokens.unwrap_or(self.defaults.max_tokens)),
            temperature: self.defaults.temperature,
            stream: self.defaults.stream,
            model: self.defaults.model.clone(),
        })
    }
}

pub async fn load_prompts(path: &Path) -> Result<Vec<Prompt>> {
    let file = File::open(path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot open prompt file {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut prompts = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Prompt>(&line) {
            Ok(prompt) => prompts.push(prompt),
            Err(e) => warn!("Failed to parse prompt line: {}", e),
        }
    }

    Ok(prompts)
}
