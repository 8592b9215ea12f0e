//! Process telemetry.
//!
//! These counters are write-only from the load engine and exist for live
//! observation of the process. Reported results are always computed from
//! `RequestResult` records, never from these values.

use metriken::{AtomicHistogram, Counter, Gauge, LazyCounter, LazyGauge, metric};
use std::time::Duration;

use crate::request::{ErrorKind, RequestResult};

// Request metrics
#[metric(
    name = "requests",
    description = "Requests dispatched (retries excluded)",
    metadata = { status = "sent" }
)]
pub static REQUESTS_SENT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Successful requests",
    metadata = { status = "success" }
)]
pub static REQUESTS_SUCCESS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Failed requests",
    metadata = { status = "failed" }
)]
pub static REQUESTS_FAILED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Requests cancelled by the operator",
    metadata = { status = "cancelled" }
)]
pub static REQUESTS_CANCELLED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests",
    description = "Request retries",
    metadata = { status = "retried" }
)]
pub static REQUESTS_RETRIED: LazyCounter = LazyCounter::new(Counter::default);

// Error category metrics
#[metric(
    name = "errors",
    description = "Connection errors",
    metadata = { "type" = "connection" }
)]
pub static ERRORS_CONNECTION: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Timeouts",
    metadata = { "type" = "timeout" }
)]
pub static ERRORS_TIMEOUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "HTTP 5xx errors",
    metadata = { "type" = "server" }
)]
pub static ERRORS_SERVER: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "HTTP 4xx errors",
    metadata = { "type" = "client" }
)]
pub static ERRORS_CLIENT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors",
    description = "Unparsable or unexpected responses",
    metadata = { "type" = "protocol" }
)]
pub static ERRORS_PROTOCOL: LazyCounter = LazyCounter::new(Counter::default);

// Token metrics
#[metric(
    name = "tokens",
    description = "Input tokens processed",
    metadata = { direction = "input" }
)]
pub static TOKENS_INPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens",
    description = "Output tokens generated",
    metadata = { direction = "output" }
)]
pub static TOKENS_OUTPUT: LazyCounter = LazyCounter::new(Counter::default);

// Concurrency metrics
#[metric(
    name = "requests_inflight",
    description = "Current number of requests in flight"
)]
pub static REQUESTS_INFLIGHT: LazyGauge = LazyGauge::new(Gauge::default);

// Latency metrics (in nanoseconds)
// Histogram parameters: (grouping_power=5, max_value_power=64)
#[metric(
    name = "ttft",
    description = "Time to first token in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static TTFT: AtomicHistogram = AtomicHistogram::new(5, 64);

#[metric(
    name = "request_latency",
    description = "Total request latency in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static REQUEST_LATENCY: AtomicHistogram = AtomicHistogram::new(5, 64);

#[metric(
    name = "inter_token_latency",
    description = "Mean inter-token latency per request in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static INTER_TOKEN_LATENCY: AtomicHistogram = AtomicHistogram::new(5, 64);

pub struct Metrics;

impl Metrics {
    pub fn record_request_sent() {
        REQUESTS_SENT.increment();
        REQUESTS_INFLIGHT.increment();
    }

    pub fn record_retry() {
        REQUESTS_RETRIED.increment();
    }

    /// Record the final outcome of a request previously counted as sent.
    pub fn record_result(result: &RequestResult) {
        REQUESTS_INFLIGHT.decrement();

        if result.success {
            REQUESTS_SUCCESS.increment();
            record_duration(&REQUEST_LATENCY, result.total_duration);
            record_duration(&TTFT, result.ttft);
            record_duration(&INTER_TOKEN_LATENCY, result.inter_token_latency_avg);
            TOKENS_INPUT.add(u64::from(result.prompt_tokens.unwrap_or(0)));
            TOKENS_OUTPUT.add(u64::from(result.completion_tokens.unwrap_or(0)));
            return;
        }

        match result.error_kind {
            Some(ErrorKind::Cancelled) => {
                REQUESTS_CANCELLED.increment();
                return;
            }
            Some(ErrorKind::Connection) => ERRORS_CONNECTION.increment(),
            Some(ErrorKind::Timeout) => ERRORS_TIMEOUT.increment(),
            Some(ErrorKind::Server) => ERRORS_SERVER.increment(),
            Some(ErrorKind::Client) => ERRORS_CLIENT.increment(),
            Some(ErrorKind::Protocol) | None => ERRORS_PROTOCOL.increment(),
        };
        REQUESTS_FAILED.increment();
    }
}

fn record_duration(histogram: &AtomicHistogram, duration: Option<Duration>) {
    if let Some(duration) = duration {
        let _ = histogram.increment(duration.as_nanos() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_result_counts_outcomes() {
        let mut result = RequestResult {
            request_id: 0,
            engine_name: "a".to_string(),
            model: None,
            success: true,
            error_kind: None,
            error_message: None,
            attempts: 1,
            request_start: Duration::ZERO,
            first_token_time: Some(Duration::from_millis(5)),
            completion_time: Some(Duration::from_millis(20)),
            total_duration: Some(Duration::from_millis(20)),
            prompt_tokens: Some(3),
            completion_tokens: Some(7),
            ttft: Some(Duration::from_millis(5)),
            inter_token_latency_avg: None,
            tokens_per_sec: None,
            eval_duration: None,
        };

        // Counters are process-wide and other tests run concurrently, so only
        // check that ours moved.
        let success = REQUESTS_SUCCESS.value();
        let output = TOKENS_OUTPUT.value();
        Metrics::record_request_sent();
        Metrics::record_result(&result);
        assert!(REQUESTS_SUCCESS.value() > success);
        assert!(TOKENS_OUTPUT.value() >= output + 7);

        let client = ERRORS_CLIENT.value();
        result.success = false;
        result.error_kind = Some(ErrorKind::Client);
        Metrics::record_request_sent();
        Metrics::record_result(&result);
        assert!(ERRORS_CLIENT.value() > client);
    }
}
