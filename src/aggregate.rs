//! Reduction of request results into comparable per-engine KPIs.
//!
//! Everything here is a pure function of its input slice: results may arrive
//! in any order and aggregating the same set twice gives identical output.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::request::{ErrorKind, RequestResult};

/// Minimum success rate for an engine to be eligible as comparison winner.
pub const DEFAULT_SUCCESS_FLOOR: f64 = 0.95;

/// Failure counts per taxonomy kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorBreakdown {
    #[serde(rename = "ConnectionError")]
    pub connection: usize,
    #[serde(rename = "TimeoutError")]
    pub timeout: usize,
    #[serde(rename = "ServerError")]
    pub server: usize,
    #[serde(rename = "ClientError")]
    pub client: usize,
    #[serde(rename = "ProtocolError")]
    pub protocol: usize,
    #[serde(rename = "CancelledError")]
    pub cancelled: usize,
}

impl ErrorBreakdown {
    pub fn record(&mut self, kind: ErrorKind) {
        *self.slot(kind) += 1;
    }

    pub fn get(&self, kind: ErrorKind) -> usize {
        match kind {
            ErrorKind::Connection => self.connection,
            ErrorKind::Timeout => self.timeout,
            ErrorKind::Server => self.server,
            ErrorKind::Client => self.client,
            ErrorKind::Protocol => self.protocol,
            ErrorKind::Cancelled => self.cancelled,
        }
    }

    fn slot(&mut self, kind: ErrorKind) -> &mut usize {
        match kind {
            ErrorKind::Connection => &mut self.connection,
            ErrorKind::Timeout => &mut self.timeout,
            ErrorKind::Server => &mut self.server,
            ErrorKind::Client => &mut self.client,
            ErrorKind::Protocol => &mut self.protocol,
            ErrorKind::Cancelled => &mut self.cancelled,
        }
    }
}

/// Summary of one engine's results.
///
/// `None` means "no data", which is reported differently from zero.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateMetrics {
    pub engine_name: String,
    pub model: Option<String>,
    /// Every result for the engine, cancelled ones included
    pub count: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// `successful / (count - cancelled)`
    pub success_rate: Option<f64>,
    pub latency_p50: Option<Duration>,
    pub latency_p95: Option<Duration>,
    pub latency_p99: Option<Duration>,
    pub ttft_p50: Option<Duration>,
    pub ttft_p95: Option<Duration>,
    pub ttft_p99: Option<Duration>,
    pub mean_inter_token_latency: Option<Duration>,
    pub mean_tokens_per_sec: Option<f64>,
    pub requests_per_second: Option<f64>,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub errors: ErrorBreakdown,
}

impl AggregateMetrics {
    /// An entry for an engine that produced no results at all.
    pub fn empty(engine_name: &str) -> Self {
        Self {
            engine_name: engine_name.to_string(),
            model: None,
            count: 0,
            successful: 0,
            failed: 0,
            cancelled: 0,
            success_rate: None,
            latency_p50: None,
            latency_p95: None,
            latency_p99: None,
            ttft_p50: None,
            ttft_p95: None,
            ttft_p99: None,
            mean_inter_token_latency: None,
            mean_tokens_per_sec: None,
            requests_per_second: None,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
            errors: ErrorBreakdown::default(),
        }
    }
}

/// Nearest-rank percentile over an ascending sample.
///
/// `rank = ceil(p / 100 * n)`, 1-indexed and clamped to `[1, n]`.
pub fn percentile<T: Copy>(sorted: &[T], p: f64) -> Option<T> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (p * n as f64 / 100.0).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

/// Cross-engine result of one comparison run.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub entries: Vec<AggregateMetrics>,
    /// Engine names, best first
    pub ranking: Vec<String>,
    /// Best engine whose success rate meets the floor, if any
    pub winner: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsAggregator {
    success_floor: f64,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_SUCCESS_FLOOR)
    }
}

impl MetricsAggregator {
    pub fn new(success_floor: f64) -> Self {
        Self { success_floor }
    }

    pub fn success_floor(&self) -> f64 {
        self.success_floor
    }

    /// Aggregate the results belonging to `engine_name`; others are ignored.
    pub fn aggregate(&self, engine_name: &str, results: &[RequestResult]) -> AggregateMetrics {
        let mut metrics = AggregateMetrics::empty(engine_name);
        let mut models = BTreeSet::new();
        let mut latencies = Vec::new();
        let mut ttfts = Vec::new();
        let mut itls = Vec::new();
        let mut rates = Vec::new();
        let mut first_start: Option<Duration> = None;
        let mut last_end: Option<Duration> = None;

        for r in results.iter().filter(|r| r.engine_name == engine_name) {
            metrics.count += 1;
            if let Some(model) = &r.model {
                models.insert(model.as_str());
            }

            if !r.success {
                let kind = r.error_kind.unwrap_or(ErrorKind::Protocol);
                metrics.errors.record(kind);
                if kind == ErrorKind::Cancelled {
                    metrics.cancelled += 1;
                } else {
                    metrics.failed += 1;
                }
                continue;
            }

            metrics.successful += 1;
            metrics.total_prompt_tokens += u64::from(r.prompt_tokens.unwrap_or(0));
            metrics.total_completion_tokens += u64::from(r.completion_tokens.unwrap_or(0));

            if let Some(total) = r.total_duration {
                latencies.push(total);
            }
            if let Some(ttft) = r.ttft {
                ttfts.push(ttft);
            }
            if let Some(itl) = r.inter_token_latency_avg {
                itls.push(itl);
            }
            if let Some(rate) = r.tokens_per_sec {
                rates.push(rate);
            }

            first_start = Some(first_start.map_or(r.request_start, |s| s.min(r.request_start)));
            if let Some(end) = r.end_time() {
                last_end = Some(last_end.map_or(end, |e| e.max(end)));
            }
        }

        metrics.model = models.into_iter().next().map(str::to_string);

        let attempted = metrics.count - metrics.cancelled;
        if attempted > 0 {
            metrics.success_rate = Some(metrics.successful as f64 / attempted as f64);
        }

        latencies.sort_unstable();
        metrics.latency_p50 = percentile(&latencies, 50.0);
        metrics.latency_p95 = percentile(&latencies, 95.0);
        metrics.latency_p99 = percentile(&latencies, 99.0);

        ttfts.sort_unstable();
        metrics.ttft_p50 = percentile(&ttfts, 50.0);
        metrics.ttft_p95 = percentile(&ttfts, 95.0);
        metrics.ttft_p99 = percentile(&ttfts, 99.0);

        if !itls.is_empty() {
            let sum: Duration = itls.iter().sum();
            metrics.mean_inter_token_latency = Some(sum / itls.len() as u32);
        }

        if !rates.is_empty() {
            // Summed in sorted order so arrival order cannot change the result
            rates.sort_unstable_by(f64::total_cmp);
            metrics.mean_tokens_per_sec = Some(rates.iter().sum::<f64>() / rates.len() as f64);
        }

        if let (Some(start), Some(end)) = (first_start, last_end) {
            let span = end.saturating_sub(start);
            if !span.is_zero() {
                metrics.requests_per_second = Some(metrics.successful as f64 / span.as_secs_f64());
            }
        }

        metrics
    }

    /// One entry per engine, in the order given, including engines with no
    /// results.
    pub fn aggregate_all(&self, engines: &[String], results: &[RequestResult]) -> Vec<AggregateMetrics> {
        engines
            .iter()
            .map(|engine| self.aggregate(engine, results))
            .collect()
    }

    /// Rank engines.
    ///
    /// Order: success rate at or above the floor first, then p95 latency
    /// ascending, then requests per second descending, then name. Undefined
    /// values sort after defined ones.
    pub fn compare(&self, entries: Vec<AggregateMetrics>) -> Comparison {
        let mut ranked: Vec<&AggregateMetrics> = entries.iter().collect();
        ranked.sort_by(|a, b| self.rank_order(a, b));

        let winner = ranked
            .first()
            .filter(|m| self.is_eligible(m))
            .map(|m| m.engine_name.clone());
        let ranking = ranked.iter().map(|m| m.engine_name.clone()).collect();

        Comparison {
            entries,
            ranking,
            winner,
        }
    }

    fn is_eligible(&self, metrics: &AggregateMetrics) -> bool {
        metrics
            .success_rate
            .is_some_and(|rate| rate >= self.success_floor)
    }

    fn rank_order(&self, a: &AggregateMetrics, b: &AggregateMetrics) -> Ordering {
        self.is_eligible(b)
            .cmp(&self.is_eligible(a))
            .then_with(|| none_last(a.latency_p95, b.latency_p95, |x, y| x.cmp(&y)))
            .then_with(|| {
                none_last(a.requests_per_second, b.requests_per_second, |x, y| {
                    y.total_cmp(&x)
                })
            })
            .then_with(|| a.engine_name.cmp(&b.engine_name))
    }
}

fn none_last<T>(a: Option<T>, b: Option<T>, cmp: impl Fn(T, T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => cmp(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
