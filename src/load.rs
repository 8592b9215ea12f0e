//! Concurrent load generation.
//!
//! One dispatcher task per engine walks its own copy of the scenario, gates
//! every call on a semaphore permit and hands it to a worker task. Workers
//! drive the adapter's event stream through a collector, retry transient
//! failures, and push exactly one [`RequestResult`] per dispatched spec into
//! a shared unbounded channel.

use anyhow::Result;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::adapter::EngineAdapter;
use crate::collector::StreamingMetricsCollector;
use crate::config::ArrivalDistribution;
use crate::distribution::RequestDistribution;
use crate::metrics::Metrics;
use crate::request::{ErrorKind, RequestResult, RequestSpec};
use crate::scenario::Scenario;

/// What the `concurrency` limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    /// Each engine may have `concurrency` calls in flight
    #[default]
    PerEngine,
    /// All engines together may have `concurrency` calls in flight
    Global,
}

/// When an engine stops receiving new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// Dispatch this many specs per engine
    Requests(usize),
    /// Dispatch until this much time has passed since the measured phase began
    Duration(Duration),
}

/// Backoff between retries of a transient failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): the initial delay doubled
    /// per retry and capped at `max_delay`.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        let capped = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }
        let mut rng = rand::thread_rng();
        capped.mul_f64(rng.gen_range(0.5..=1.0))
    }
}

/// Optional cap on the dispatch rate of each engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub qps: f64,
    pub distribution: ArrivalDistribution,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadPolicy {
    pub concurrency: usize,
    pub scope: ConcurrencyScope,
    pub stop: StopCondition,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
    /// Specs sent to each engine before the measured phase; results discarded
    pub warmup_requests: usize,
    /// Probe each engine first and leave unhealthy ones undriven
    pub skip_unhealthy: bool,
}

impl LoadPolicy {
    pub fn new(concurrency: usize, stop: StopCondition) -> Self {
        Self {
            concurrency,
            scope: ConcurrencyScope::default(),
            stop,
            retry: RetryPolicy::default(),
            rate_limit: None,
            warmup_requests: 0,
            skip_unhealthy: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }
        if let Some(rate) = &self.rate_limit
            && !(rate.qps.is_finite() && rate.qps > 0.0)
        {
            anyhow::bail!("qps must be greater than 0");
        }
        if self.retry.initial_delay > self.retry.max_delay {
            anyhow::bail!("retry initial delay must not exceed the maximum delay");
        }
        Ok(())
    }
}

/// State shared by every dispatcher and worker of one run.
struct RunContext {
    policy: LoadPolicy,
    epoch: Instant,
    cancel: CancellationToken,
}

pub struct LoadEngine {
    policy: LoadPolicy,
    cancel: CancellationToken,
}

impl LoadEngine {
    pub fn new(policy: LoadPolicy) -> Result<Self> {
        Self::with_cancellation(policy, CancellationToken::new())
    }

    /// Use `cancel` as the run's hard-abort signal.
    pub fn with_cancellation(policy: LoadPolicy, cancel: CancellationToken) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy, cancel })
    }

    pub fn policy(&self) -> &LoadPolicy {
        &self.policy
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start driving `scenario` against every adapter.
    ///
    /// Each engine gets its own pass over the scenario. Results stream out of
    /// the returned handle as they complete, in no particular order.
    pub fn spawn<A, S>(&self, adapters: &[A], scenario: S) -> LoadRun
    where
        A: EngineAdapter + Clone,
        S: Scenario,
    {
        let ctx = Arc::new(RunContext {
            policy: self.policy.clone(),
            epoch: Instant::now(),
            cancel: self.cancel.clone(),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let global = Arc::new(Semaphore::new(self.policy.concurrency));
        let mut dispatchers = JoinSet::new();
        for adapter in adapters {
            let semaphore = match self.policy.scope {
                ConcurrencyScope::Global => Arc::clone(&global),
                ConcurrencyScope::PerEngine => Arc::new(Semaphore::new(self.policy.concurrency)),
            };
            dispatchers.spawn(drive_engine(
                Arc::clone(&ctx),
                adapter.clone(),
                scenario.clone(),
                semaphore,
                tx.clone(),
            ));
        }

        info!(
            "Load started: {} engine(s), concurrency {} ({:?}), stop {:?}",
            adapters.len(),
            self.policy.concurrency,
            self.policy.scope,
            self.policy.stop
        );

        LoadRun {
            results: rx,
            dispatchers,
            epoch: ctx.epoch,
        }
    }

    /// Run to completion and return every result.
    pub async fn run<A, S>(&self, adapters: &[A], scenario: S) -> Vec<RequestResult>
    where
        A: EngineAdapter + Clone,
        S: Scenario,
    {
        self.spawn(adapters, scenario).collect().await
    }
}

/// Handle on a running load. Dropping it aborts the run.
pub struct LoadRun {
    results: mpsc::UnboundedReceiver<RequestResult>,
    dispatchers: JoinSet<()>,
    epoch: Instant,
}

impl LoadRun {
    /// Instant every result offset is measured from.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Next completed result, or `None` once every engine has drained.
    pub async fn next_result(&mut self) -> Option<RequestResult> {
        self.results.recv().await
    }

    pub async fn collect(mut self) -> Vec<RequestResult> {
        let mut results = Vec::new();
        while let Some(result) = self.next_result().await {
            results.push(result);
        }
        while let Some(joined) = self.dispatchers.join_next().await {
            if let Err(e) = joined {
                warn!("Dispatcher task failed: {}", e);
            }
        }
        results
    }
}

async fn drive_engine<A: EngineAdapter + Clone, S: Scenario>(
    ctx: Arc<RunContext>,
    adapter: A,
    scenario: S,
    semaphore: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<RequestResult>,
) {
    let name = adapter.name().to_string();

    if ctx.policy.skip_unhealthy {
        let health = adapter.health_check().await;
        if !health.healthy {
            warn!(
                "Skipping unhealthy engine {}: {}",
                name,
                health.detail.as_deref().unwrap_or("unknown")
            );
            return;
        }
    }

    if ctx.policy.warmup_requests > 0 {
        info!("{}: warmup with {} requests", name, ctx.policy.warmup_requests);
        let warmup = StopCondition::Requests(ctx.policy.warmup_requests);
        let sent = dispatch(&ctx, &adapter, scenario.clone(), warmup, &semaphore, None).await;
        debug!("{}: warmup complete ({} requests, excluded from results)", name, sent);
    }

    let sent = dispatch(&ctx, &adapter, scenario, ctx.policy.stop, &semaphore, Some(&tx)).await;
    info!("{}: dispatched {} requests", name, sent);
}

/// Dispatch specs until `stop` is met, the scenario runs out or the run is
/// cancelled, then wait for every dispatched call to finish.
async fn dispatch<A: EngineAdapter + Clone, S: Scenario>(
    ctx: &Arc<RunContext>,
    adapter: &A,
    mut specs: S,
    stop: StopCondition,
    semaphore: &Arc<Semaphore>,
    tx: Option<&mpsc::UnboundedSender<RequestResult>>,
) -> usize {
    let pacing = match ctx.policy.rate_limit {
        Some(rate) => match RequestDistribution::new(&rate.distribution, rate.qps) {
            Ok(pacing) => {
                debug!(
                    "{}: pacing at {} qps ({} arrivals)",
                    adapter.name(),
                    rate.qps,
                    pacing.distribution_name()
                );
                Some(pacing)
            }
            Err(e) => {
                warn!("{}: rate limit disabled: {}", adapter.name(), e);
                None
            }
        },
        None => None,
    };

    let (limit, deadline) = match stop {
        StopCondition::Requests(n) => (Some(n), None),
        StopCondition::Duration(d) => (None, Some(tokio::time::Instant::now() + d)),
    };
    let until_deadline = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(until_deadline);

    let mut workers = JoinSet::new();
    let mut dispatched = 0usize;

    loop {
        if limit.is_some_and(|n| dispatched >= n) {
            break;
        }

        if let Some(pacing) = &pacing {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                _ = &mut until_deadline => break,
                _ = tokio::time::sleep(pacing.next_delay()) => {}
            }
        }

        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = &mut until_deadline => break,
            permit = Arc::clone(semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Some(spec) = specs.next() else {
            debug!("{}: scenario exhausted after {} requests", adapter.name(), dispatched);
            break;
        };

        dispatched += 1;
        let ctx = Arc::clone(ctx);
        let adapter = adapter.clone();
        let tx = tx.cloned();
        workers.spawn(async move {
            let measured = tx.is_some();
            let result = execute(&ctx, &adapter, spec, permit, measured).await;
            if let Some(tx) = tx {
                // Receiver gone means the run handle was dropped
                let _ = tx.send(result);
            }
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!("{}: worker task failed: {}", adapter.name(), e);
        }
    }
    dispatched
}

/// Perform one spec against one engine, retrying transient failures.
async fn execute<A: EngineAdapter>(
    ctx: &RunContext,
    adapter: &A,
    spec: RequestSpec,
    _permit: OwnedSemaphorePermit,
    measured: bool,
) -> RequestResult {
    let config = adapter.config();
    let model = config.resolve_model(&spec);
    let max_retries = config.retry_attempts;
    let mut attempt = 0u32;

    if measured {
        Metrics::record_request_sent();
    }

    loop {
        attempt += 1;
        let mut collector =
            StreamingMetricsCollector::new(spec.id, adapter.name(), model.clone(), ctx.epoch);
        let mut stream = adapter.send_request(&spec);

        while !collector.is_finished() {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => collector.cancel(Instant::now()),
                event = stream.next_event() => match event {
                    Some(event) => collector.observe(&event),
                    None => break,
                },
            }
        }
        // Aborts any I/O still running for this attempt
        drop(stream);

        let result = collector.into_result(attempt);
        let retryable = result.error_kind.is_some_and(ErrorKind::is_retryable);

        if retryable && attempt <= max_retries && !ctx.cancel.is_cancelled() {
            let delay = ctx.policy.retry.delay(attempt - 1);
            debug!(
                "{} request {} attempt {} failed ({}), retrying in {:?}",
                adapter.name(),
                spec.id,
                attempt,
                result.error_message.as_deref().unwrap_or("unknown"),
                delay
            );
            if measured {
                Metrics::record_retry();
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => return finish(result, measured),
                _ = tokio::time::sleep(delay) => continue,
            }
        }

        return finish(result, measured);
    }
}

fn finish(result: RequestResult, measured: bool) -> RequestResult {
    match (&result.error_kind, &result.error_message) {
        (Some(kind), Some(message)) => debug!(
            "{} request {} failed after {} attempt(s): {} {}",
            result.engine_name, result.request_id, result.attempts, kind, message
        ),
        _ => debug!(
            "{} request {} completed in {:?}",
            result.engine_name, result.request_id, result.total_duration
        ),
    }
    if measured {
        Metrics::record_result(&result);
    }
    result
}
