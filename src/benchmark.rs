use anyhow::Result;
use log::{debug, info, warn};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, EngineAdapter, HealthStatus};
use crate::aggregate::MetricsAggregator;
use crate::config::{Config, OutputFormat};
use crate::load::LoadEngine;
use crate::report::{BenchmarkReport, ReportBuilder, write_request_rows};
use crate::scenario::PromptScenario;
use crate::stats::LiveView;

/// Drives one comparison run end to end.
///
/// The runner resolves each configured engine into an adapter, discovers
/// missing model names, probes health, hands the prompt scenario to a
/// [`LoadEngine`] and turns the collected results into a ranked
/// [`BenchmarkReport`].
///
/// # Examples
///
/// ```no_run
/// use engine_bench::{BenchmarkRunner, Config};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::load(&"compare.toml".into())?;
///     let runner = BenchmarkRunner::new(config).await?;
///     let report = runner.run().await?;
///     println!("winner: {:?}", report.winner);
///     Ok(())
/// }
/// ```
pub struct BenchmarkRunner {
    config: Config,
    adapters: Vec<Adapter>,
    scenario: PromptScenario,
    load: LoadEngine,
    aggregator: MetricsAggregator,
    live_interval: Duration,
}

impl BenchmarkRunner {
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_cancellation(config, CancellationToken::new()).await
    }

    /// Like [`BenchmarkRunner::new`], aborting the run when `cancel` fires.
    ///
    /// Fails if the configuration cannot be turned into a load policy, an
    /// engine URL is unusable or the prompt file cannot be read. Unreachable
    /// engines are not an error here.
    pub async fn with_cancellation(config: Config, cancel: CancellationToken) -> Result<Self> {
        let load = LoadEngine::with_cancellation(config.load_policy()?, cancel)?;
        let aggregator = MetricsAggregator::new(config.comparison.success_floor);
        let live_interval = config.live_interval()?;
        let scenario = PromptScenario::from_input(&config.input).await?;
        info!("Scenario ready with {} prompts", scenario.len());

        // Connection pool per engine matches the concurrency limit
        let pool_size = config.load.concurrency;
        let mut adapters = Vec::with_capacity(config.engines.len());
        for engine in config.engine_configs()? {
            debug!("Creating {} adapter for {} at {}", engine.kind, engine.name, engine.base_url);
            let adapter = Adapter::new(engine, pool_size)?;
            adapters.push(discover_model(adapter).await);
        }

        Ok(Self {
            config,
            adapters,
            scenario,
            load,
            aggregator,
            live_interval,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.load.cancellation_token()
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    /// Probe every engine, logging the outcome.
    pub async fn health(&self) -> Vec<HealthStatus> {
        check_health(&self.adapters).await
    }

    /// Execute the run and emit the report as configured.
    pub async fn run(&self) -> Result<BenchmarkReport> {
        let report_builder = ReportBuilder::new().with_config(self.config.clone());
        let engines: Vec<String> = self.adapters.iter().map(|a| a.name().to_string()).collect();

        let health = self.health().await;

        // No live view when the report itself goes to stdout
        let json_to_stdout =
            self.config.output.format == OutputFormat::Json && self.config.output.file.is_none();
        let mut live = (!self.config.output.quiet && !json_to_stdout)
            .then(|| LiveView::new(self.aggregator, engines.clone(), self.live_interval));

        let start = Instant::now();
        let mut run = self.load.spawn(&self.adapters, self.scenario.clone());
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.live_interval,
            self.live_interval,
        );
        let mut results = Vec::new();

        loop {
            tokio::select! {
                result = run.next_result() => match result {
                    Some(result) => results.push(result),
                    None => break,
                },
                _ = ticker.tick(), if live.is_some() => {
                    if let Some(live) = live.as_mut() {
                        live.print(&results);
                    }
                }
            }
        }
        results.extend(run.collect().await);
        let duration = start.elapsed();

        if self.load.cancellation_token().is_cancelled() {
            warn!("Run cancelled, reporting {} results collected so far", results.len());
        }
        info!(
            "Run finished: {} results in {:.1}s",
            results.len(),
            duration.as_secs_f64()
        );

        let comparison = self
            .aggregator
            .compare(self.aggregator.aggregate_all(&engines, &results));
        let report = report_builder
            .with_health(health)
            .with_duration(duration)
            .build(&comparison, self.aggregator.success_floor())?;

        if let Some(path) = &self.config.output.requests_file {
            write_request_rows(path, &results).await?;
            info!("Wrote {} request rows to {}", results.len(), path.display());
        }

        self.generate_report(&report).await?;
        Ok(report)
    }

    async fn generate_report(&self, report: &BenchmarkReport) -> Result<()> {
        let output = &self.config.output;

        if let Some(file_path) = &output.file {
            let json = serde_json::to_string_pretty(report)?;
            tokio::fs::write(file_path, json)
                .await
                .map_err(|e| anyhow::anyhow!("cannot write {}: {}", file_path.display(), e))?;
            info!("Report written to {}", file_path.display());
        }

        match output.format {
            OutputFormat::Console => {
                if !output.quiet {
                    report.print_console_report();
                }
            }
            OutputFormat::Json => {
                if output.file.is_none() {
                    // Writing JSON to stdout - this is for piping
                    println!("{}", serde_json::to_string_pretty(report)?);
                } else if !output.quiet {
                    report.print_console_report();
                }
            }
        }
        Ok(())
    }
}

/// Fill in the engine's default model from its model listing when none is
/// configured. Failures leave the adapter unchanged.
async fn discover_model(adapter: Adapter) -> Adapter {
    if adapter.config().model.is_some() {
        return adapter;
    }

    let name = adapter.name().to_string();
    info!("{}: model not specified, querying engine for available models", name);
    match adapter.list_models().await {
        Ok(models) => match models.into_iter().next() {
            Some(model) => {
                info!("{}: using model {}", name, model.id);
                adapter.with_model(model.id)
            }
            None => {
                warn!("{}: engine reports no models", name);
                adapter
            }
        },
        Err(e) => {
            warn!("{}: model discovery failed: {}", name, e);
            adapter
        }
    }
}

/// Probe every engine concurrently, returning statuses in engine order.
async fn check_health(adapters: &[Adapter]) -> Vec<HealthStatus> {
    let mut probes = JoinSet::new();
    for (index, adapter) in adapters.iter().enumerate() {
        let adapter = adapter.clone();
        probes.spawn(async move { (index, adapter.health_check().await) });
    }

    let mut statuses: Vec<Option<HealthStatus>> = vec![None; adapters.len()];
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((index, status)) => statuses[index] = Some(status),
            Err(e) => warn!("Health probe task failed: {}", e),
        }
    }

    let statuses: Vec<HealthStatus> = statuses.into_iter().flatten().collect();
    for status in &statuses {
        if status.healthy {
            info!("{}: healthy ({:?})", status.engine, status.latency);
        } else {
            warn!(
                "{}: unhealthy: {}",
                status.engine,
                status.detail.as_deref().unwrap_or("unknown")
            );
        }
    }
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve, unused_addr};
    use std::io::Write;
    use warp::Filter;

    async fn mock_openai() -> std::net::SocketAddr {
        let sse = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let completions = warp::path!("v1" / "chat" / "completions")
            .and(warp::post())
            .map(move || warp::reply::with_header(sse, "content-type", "text/event-stream"));
        let models = warp::path!("v1" / "models").map(|| {
            warp::reply::json(&serde_json::json!({
                "object": "list",
                "data": [{"id": "mock-model", "object": "model"}]
            }))
        });
        serve(completions.or(models)).await
    }

    fn prompt_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"prompt\": \"Say hi\"}}").unwrap();
        writeln!(file, "{{\"prompt\": \"Say hi again\", \"max_tokens\": 8}}").unwrap();
        file
    }

    #[tokio::test]
    async fn test_compares_live_and_unreachable_engines() {
        let live = mock_openai().await;
        let dead = unused_addr().await;
        let prompts = prompt_file();
        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("report.json");
        let rows_path = dir.path().join("requests.jsonl");

        let toml = format!(
            r#"
[[engines]]
name = "vllm"
kind = "openai"
base_url = "http://{live}/v1"

[[engines]]
name = "offline"
kind = "ollama"
base_url = "http://{dead}"
model = "llama3.2"
timeout = "2s"
retry_attempts = 0

[load]
concurrency = 2
total_requests = 6

[input]
file = "{prompts}"

[output]
format = "json"
file = "{report}"
requests_file = "{rows}"
quiet = true
"#,
            live = live,
            dead = dead,
            prompts = prompts.path().display(),
            report = report_path.display(),
            rows = rows_path.display(),
        );
        let config: Config = toml::from_str(&toml).unwrap();
        config.validate().unwrap();

        let runner = BenchmarkRunner::new(config).await.unwrap();
        assert_eq!(runner.adapters()[0].config().model.as_deref(), Some("mock-model"));

        let report = runner.run().await.unwrap();

        assert_eq!(report.summary.len(), 2);
        let vllm = &report.summary[0];
        assert_eq!(vllm.engine, "vllm");
        assert_eq!(vllm.count, 6);
        assert_eq!(vllm.success_rate, Some(1.0));
        assert_eq!(vllm.model.as_deref(), Some("mock-model"));

        let offline = &report.summary[1];
        assert_eq!(offline.count, 6);
        assert_eq!(offline.success_rate, Some(0.0));
        assert_eq!(offline.latency_p95, None);
        assert_eq!(report.details[1].errors.connection, 6);

        assert!(report.health[0].healthy);
        assert!(!report.health[1].healthy);
        assert_eq!(report.ranking, vec!["vllm", "offline"]);
        assert_eq!(report.winner.as_deref(), Some("vllm"));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(written["winner"], "vllm");

        let rows = std::fs::read_to_string(&rows_path).unwrap();
        assert_eq!(rows.lines().count(), 12);
    }

    #[tokio::test]
    async fn test_cancelled_run_still_reports() {
        let stalled = crate::testing::stalling_server(
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
        )
        .await;
        let prompts = prompt_file();

        let toml = format!(
            r#"
[[engines]]
name = "stalled"
kind = "openai"
base_url = "http://{stalled}/v1"
model = "m"

[load]
concurrency = 3
duration_seconds = 60

[input]
file = "{prompts}"

[output]
quiet = true
"#,
            stalled = stalled,
            prompts = prompts.path().display(),
        );
        let config: Config = toml::from_str(&toml).unwrap();
        let cancel = CancellationToken::new();
        let runner = BenchmarkRunner::with_cancellation(config, cancel.clone())
            .await
            .unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(10), runner.run())
            .await
            .unwrap()
            .unwrap();
        canceller.await.unwrap();

        let summary = &report.summary[0];
        assert_eq!(summary.count, 3);
        assert_eq!(report.details[0].cancelled, 3);
        assert_eq!(summary.success_rate, None);
        assert_eq!(report.winner, None);
    }
}
