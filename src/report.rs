use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::adapter::HealthStatus;
use crate::aggregate::{AggregateMetrics, Comparison, ErrorBreakdown};
use crate::request::{ErrorKind, RequestResult};

/// Exported record of one request. Times are milliseconds from the run epoch;
/// absent values serialize as `null`, never as zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRow {
    pub engine: String,
    pub model: Option<String>,
    pub request_id: u64,
    pub request_start: f64,
    pub first_token_time: Option<f64>,
    pub completion_time: Option<f64>,
    pub total_duration: Option<f64>,
    pub ttft: Option<f64>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
}

impl From<&RequestResult> for RequestRow {
    fn from(result: &RequestResult) -> Self {
        Self {
            engine: result.engine_name.clone(),
            model: result.model.clone(),
            request_id: result.request_id,
            request_start: millis(result.request_start),
            first_token_time: result.first_token_time.map(millis),
            completion_time: result.completion_time.map(millis),
            total_duration: result.total_duration.map(millis),
            ttft: result.ttft.map(millis),
            prompt_tokens: result.prompt_tokens,
            completion_tokens: result.completion_tokens,
            success: result.success,
            error_kind: result.error_kind,
        }
    }
}

/// Exported per-engine summary. Latencies in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub engine: String,
    pub model: Option<String>,
    pub count: usize,
    pub success_rate: Option<f64>,
    pub latency_p50: Option<f64>,
    pub latency_p95: Option<f64>,
    pub latency_p99: Option<f64>,
    pub rps: Option<f64>,
    pub mean_tokens_per_sec: Option<f64>,
}

impl From<&AggregateMetrics> for SummaryRow {
    fn from(metrics: &AggregateMetrics) -> Self {
        Self {
            engine: metrics.engine_name.clone(),
            model: metrics.model.clone(),
            count: metrics.count,
            success_rate: metrics.success_rate,
            latency_p50: metrics.latency_p50.map(millis),
            latency_p95: metrics.latency_p95.map(millis),
            latency_p99: metrics.latency_p99.map(millis),
            rps: metrics.requests_per_second,
            mean_tokens_per_sec: metrics.mean_tokens_per_sec,
        }
    }
}

/// Everything else known about an engine's run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineDetail {
    pub engine: String,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub ttft_p50: Option<f64>,
    pub ttft_p95: Option<f64>,
    pub ttft_p99: Option<f64>,
    pub mean_inter_token_latency: Option<f64>,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub errors: ErrorBreakdown,
}

impl From<&AggregateMetrics> for EngineDetail {
    fn from(metrics: &AggregateMetrics) -> Self {
        Self {
            engine: metrics.engine_name.clone(),
            successful: metrics.successful,
            failed: metrics.failed,
            cancelled: metrics.cancelled,
            ttft_p50: metrics.ttft_p50.map(millis),
            ttft_p95: metrics.ttft_p95.map(millis),
            ttft_p99: metrics.ttft_p99.map(millis),
            mean_inter_token_latency: metrics.mean_inter_token_latency.map(millis),
            total_prompt_tokens: metrics.total_prompt_tokens,
            total_completion_tokens: metrics.total_completion_tokens,
            errors: metrics.errors.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRow {
    pub engine: String,
    pub healthy: bool,
    pub latency_ms: f64,
    pub detail: Option<String>,
}

impl From<&HealthStatus> for HealthRow {
    fn from(status: &HealthStatus) -> Self {
        Self {
            engine: status.engine.clone(),
            healthy: status.healthy,
            latency_ms: millis(status.latency),
            detail: status.detail.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    // Metadata
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub version: String,

    // Test configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<crate::config::Config>,

    // Results
    pub health: Vec<HealthRow>,
    pub summary: Vec<SummaryRow>,
    pub details: Vec<EngineDetail>,
    pub success_floor: f64,
    pub ranking: Vec<String>,
    pub winner: Option<String>,
}

pub struct ReportBuilder {
    start_time: SystemTime,
    duration: Option<Duration>,
    config: Option<crate::config::Config>,
    health: Vec<HealthStatus>,
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            duration: None,
            config: None,
            health: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: crate::config::Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_health(mut self, health: Vec<HealthStatus>) -> Self {
        self.health = health;
        self
    }

    /// Use the measured run duration instead of time since construction.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn build(&self, comparison: &Comparison, success_floor: f64) -> Result<BenchmarkReport> {
        let duration = match self.duration {
            Some(duration) => duration,
            None => SystemTime::now().duration_since(self.start_time)?,
        };

        Ok(BenchmarkReport {
            timestamp: self.start_time.into(),
            duration,
            version: env!("CARGO_PKG_VERSION").to_string(),
            configuration: self.config.clone(),
            health: self.health.iter().map(HealthRow::from).collect(),
            summary: comparison.entries.iter().map(SummaryRow::from).collect(),
            details: comparison.entries.iter().map(EngineDetail::from).collect(),
            success_floor,
            ranking: comparison.ranking.clone(),
            winner: comparison.winner.clone(),
        })
    }
}

impl BenchmarkReport {
    /// Human-readable summary, each line prefixed with `timestamp`.
    pub fn render_console(&self, timestamp: &str) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "{}", timestamp);
        let _ = writeln!(out, "{} -----", timestamp);
        let _ = writeln!(out, "{} Benchmark Complete", timestamp);
        let _ = writeln!(out, "{} Duration: {:.1}s", timestamp, self.duration.as_secs_f64());

        for (summary, detail) in self.summary.iter().zip(&self.details) {
            let health = self
                .health
                .iter()
                .find(|h| h.engine == summary.engine)
                .map(|h| if h.healthy { "ok" } else { "unhealthy" })
                .unwrap_or("unknown");

            let _ = writeln!(out, "{} -----", timestamp);
            let _ = writeln!(
                out,
                "{} Engine: {} Model: {} Health: {}",
                timestamp,
                summary.engine,
                summary.model.as_deref().unwrap_or("-"),
                health
            );
            let _ = writeln!(
                out,
                "{} Responses: Total: {} Ok: {} Err: {} Cancelled: {} Success: {}",
                timestamp,
                summary.count,
                detail.successful,
                detail.failed,
                detail.cancelled,
                percent(summary.success_rate)
            );

            let errors = &detail.errors;
            if detail.failed > 0 {
                let _ = writeln!(
                    out,
                    "{} Errors: Connection: {} Timeout: {} Server: {} Client: {} Protocol: {}",
                    timestamp,
                    errors.connection,
                    errors.timeout,
                    errors.server,
                    errors.client,
                    errors.protocol
                );
            }

            let _ = writeln!(
                out,
                "{} Tokens: Input: {} Output: {}",
                timestamp, detail.total_prompt_tokens, detail.total_completion_tokens
            );
            let _ = writeln!(
                out,
                "{} Throughput: Requests/s: {} Tokens/s: {}",
                timestamp,
                number(summary.rps),
                number(summary.mean_tokens_per_sec)
            );
            let _ = writeln!(
                out,
                "{} TTFT (ms): p50: {} p95: {} p99: {}",
                timestamp,
                number(detail.ttft_p50),
                number(detail.ttft_p95),
                number(detail.ttft_p99)
            );
            if detail.mean_inter_token_latency.is_some() {
                let _ = writeln!(
                    out,
                    "{} ITL (ms): mean: {}",
                    timestamp,
                    number(detail.mean_inter_token_latency)
                );
            }
            let _ = writeln!(
                out,
                "{} Request Latency (ms): p50: {} p95: {} p99: {}",
                timestamp,
                number(summary.latency_p50),
                number(summary.latency_p95),
                number(summary.latency_p99)
            );
        }

        let _ = writeln!(out, "{} -----", timestamp);
        let ranking: Vec<String> = self
            .ranking
            .iter()
            .enumerate()
            .map(|(i, name)| format!("{}. {}", i + 1, name))
            .collect();
        let _ = writeln!(out, "{} Ranking: {}", timestamp, ranking.join(" "));
        match &self.winner {
            Some(winner) => {
                let _ = writeln!(out, "{} Winner: {}", timestamp, winner);
            }
            None => {
                let _ = writeln!(
                    out,
                    "{} Winner: none (no engine reached {:.2}% success)",
                    timestamp,
                    self.success_floor * 100.0
                );
            }
        }

        out
    }

    pub fn print_console_report(&self) {
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false);
        println!();
        print!("{}", self.render_console(&timestamp));
        println!();
    }
}

/// Write one JSON object per line for every result.
pub async fn write_request_rows(path: &Path, results: &[RequestResult]) -> Result<()> {
    let mut body = String::new();
    for result in results {
        body.push_str(&serde_json::to_string(&RequestRow::from(result))?);
        body.push('\n');
    }
    tokio::fs::write(path, body)
        .await
        .map_err(|e| anyhow::anyhow!("cannot write {}: {}", path.display(), e))
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn number(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

fn percent(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}%", v * 100.0))
}
