use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::adapter::{AdapterKind, EngineConfig};
use crate::load::{ConcurrencyScope, LoadPolicy, RateLimit, RetryPolicy, StopCondition};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engines: Vec<EngineEntry>,
    pub load: LoadConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub comparison: ComparisonConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// One `[[engines]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEntry {
    pub name: String,
    pub kind: AdapterKind,
    pub base_url: String,
    /// Per-call deadline, e.g. "60s" or "1500ms"
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>, // If not provided, will auto-detect from the engine
}

impl EngineEntry {
    pub fn to_engine_config(&self) -> anyhow::Result<EngineConfig> {
        let timeout = parse_duration("timeout", &self.timeout)?;
        Ok(EngineConfig {
            name: self.name.clone(),
            kind: self.kind,
            base_url: self.base_url.clone(),
            timeout,
            retry_attempts: self.retry_attempts,
            health_endpoint: self.health_endpoint.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArrivalDistribution {
    #[default]
    Uniform, // Fixed intervals (deterministic)
    Poisson, // Exponential inter-arrival times (stochastic)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub concurrency_scope: ConcurrencyScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_requests: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qps: Option<f64>, // If set, dispatch is paced per engine
    #[serde(default)]
    pub arrival_distribution: ArrivalDistribution,
    #[serde(default)]
    pub warmup_requests: usize,
    #[serde(default)]
    pub skip_unhealthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub file: PathBuf,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<usize>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub cache_bust: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// JSONL file receiving one row per request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_file: Option<PathBuf>,
    #[serde(default)]
    pub quiet: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_log: Option<PathBuf>,
    /// How often to print the live per-engine view, e.g. "10s"
    #[serde(default = "default_live_interval")]
    pub live_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonConfig {
    #[serde(default = "default_success_floor")]
    pub success_floor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Per-module log level overrides (e.g., ["reqwest=warn", "hyper=info"])
    #[serde(default)]
    pub filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Console,
    Json,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_retry_initial_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            jitter: true,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            file: None,
            requests_file: None,
            quiet: false,
            trace_log: None,
            live_interval: default_live_interval(),
        }
    }
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            success_floor: default_success_floor(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: Vec::new(),
        }
    }
}

fn default_timeout() -> String {
    "60s".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5000 // 5 seconds
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    10
}

fn default_max_tokens() -> u32 {
    256
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Console
}

fn default_live_interval() -> String {
    "10s".to_string()
}

fn default_success_floor() -> f64 {
    crate::aggregate::DEFAULT_SUCCESS_FLOOR
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn parse_duration(field: &str, value: &str) -> anyhow::Result<Duration> {
    let duration = humantime::parse_duration(value)
        .map_err(|e| anyhow::anyhow!("invalid {} {:?}: {}", field, value, e))?;
    if duration.is_zero() {
        anyhow::bail!("{} must be greater than 0", field);
    }
    Ok(duration)
}

impl Config {
    pub fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.engines.is_empty() {
            anyhow::bail!("At least one [[engines]] entry must be specified");
        }

        let mut names = HashSet::new();
        for engine in &self.engines {
            if engine.name.trim().is_empty() {
                anyhow::bail!("Engine names must not be empty");
            }
            if !names.insert(engine.name.as_str()) {
                anyhow::bail!("Duplicate engine name {:?}", engine.name);
            }
            crate::client::validate_base_url(&engine.base_url)?;
            parse_duration(&format!("timeout of engine {}", engine.name), &engine.timeout)?;
        }

        if self.load.total_requests.is_none() && self.load.duration_seconds.is_none() {
            anyhow::bail!("Either total_requests or duration_seconds must be specified");
        }

        if self.load.total_requests.is_some() && self.load.duration_seconds.is_some() {
            anyhow::bail!("Only one of total_requests or duration_seconds can be specified");
        }

        if self.load.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }

        if let Some(qps) = self.load.qps
            && !(qps.is_finite() && qps > 0.0)
        {
            anyhow::bail!("qps must be greater than 0");
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }

        if !(0.0..=1.0).contains(&self.comparison.success_floor) {
            anyhow::bail!("comparison.success_floor must be within [0, 1]");
        }

        parse_duration("output.live_interval", &self.output.live_interval)?;

        if self.runtime.worker_threads == 0 {
            anyhow::bail!("worker_threads must be greater than 0");
        }

        Ok(())
    }

    pub fn engine_configs(&self) -> anyhow::Result<Vec<EngineConfig>> {
        self.engines.iter().map(EngineEntry::to_engine_config).collect()
    }

    pub fn load_policy(&self) -> anyhow::Result<LoadPolicy> {
        let stop = match (self.load.total_requests, self.load.duration_seconds) {
            (Some(total), None) => StopCondition::Requests(total),
            (None, Some(secs)) => StopCondition::Duration(Duration::from_secs(secs)),
            _ => anyhow::bail!("Exactly one of total_requests or duration_seconds must be specified"),
        };

        Ok(LoadPolicy {
            concurrency: self.load.concurrency,
            scope: self.load.concurrency_scope,
            stop,
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: self.retry.jitter,
            },
            rate_limit: self.load.qps.map(|qps| RateLimit {
                qps,
                distribution: self.load.arrival_distribution,
            }),
            warmup_requests: self.load.warmup_requests,
            skip_unhealthy: self.load.skip_unhealthy,
        })
    }

    pub fn live_interval(&self) -> anyhow::Result<Duration> {
        parse_duration("output.live_interval", &self.output.live_interval)
    }
}
