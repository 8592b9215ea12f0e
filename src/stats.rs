use std::time::Duration;

use crate::aggregate::{AggregateMetrics, MetricsAggregator};
use crate::metrics::{REQUESTS_INFLIGHT, REQUESTS_RETRIED, REQUESTS_SENT};
use crate::request::RequestResult;

/// Print with timestamp prefix
macro_rules! output {
    () => {
        let now = chrono::Utc::now();
        println!("{}", now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false));
    };
    ($($arg:tt)*) => {{
        let now = chrono::Utc::now();
        print!("{} ", now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false));
        println!($($arg)*);
    }};
}

/// Periodic view of a run in progress.
///
/// Each window re-aggregates every result received so far; nothing is
/// carried over between windows except the dispatch counters used for rates.
pub struct LiveView {
    aggregator: MetricsAggregator,
    engines: Vec<String>,
    interval: Duration,
    window_id: u64,
    previous_sent: u64,
    previous_retried: u64,
}

impl LiveView {
    pub fn new(aggregator: MetricsAggregator, engines: Vec<String>, interval: Duration) -> Self {
        Self {
            aggregator,
            engines,
            interval,
            window_id: 0,
            previous_sent: REQUESTS_SENT.value(),
            previous_retried: REQUESTS_RETRIED.value(),
        }
    }

    pub fn print(&mut self, results: &[RequestResult]) {
        output!();
        for line in self.render(results) {
            output!("{}", line);
        }
    }

    fn render(&mut self, results: &[RequestResult]) -> Vec<String> {
        self.window_id += 1;

        let sent = REQUESTS_SENT.value();
        let retried = REQUESTS_RETRIED.value();
        let interval_secs = self.interval.as_secs_f64();
        let sent_rate = sent.saturating_sub(self.previous_sent) as f64 / interval_secs;
        let retry_rate = retried.saturating_sub(self.previous_retried) as f64 / interval_secs;
        self.previous_sent = sent;
        self.previous_retried = retried;

        let mut lines = vec![
            "-----".to_string(),
            format!("Window: {}", self.window_id),
            format!(
                "Requests/s: Sent: {:.2} Retried: {:.2} In-flight: {}",
                sent_rate,
                retry_rate,
                REQUESTS_INFLIGHT.value()
            ),
        ];

        for metrics in self.aggregator.aggregate_all(&self.engines, results) {
            lines.push(engine_line(&metrics));
        }

        lines
    }
}

fn engine_line(metrics: &AggregateMetrics) -> String {
    let ms = |d: Option<Duration>| d.map_or_else(|| "-".to_string(), |d| d.as_millis().to_string());

    format!(
        "{}: Responses: {} Ok: {} Err: {} Success: {} Latency (ms): p50: {} p95: {} p99: {} TTFT p50 (ms): {} Requests/s: {} Tokens/s: {}",
        metrics.engine_name,
        metrics.count,
        metrics.successful,
        metrics.failed,
        metrics
            .success_rate
            .map_or_else(|| "-".to_string(), |r| format!("{:.2}%", r * 100.0)),
        ms(metrics.latency_p50),
        ms(metrics.latency_p95),
        ms(metrics.latency_p99),
        ms(metrics.ttft_p50),
        metrics
            .requests_per_second
            .map_or_else(|| "-".to_string(), |r| format!("{:.2}", r)),
        metrics
            .mean_tokens_per_sec
            .map_or_else(|| "-".to_string(), |r| format!("{:.2}", r)),
    )
}
