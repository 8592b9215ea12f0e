use std::time::{Duration, Instant};

use crate::client::AdapterError;
use crate::request::{CompletionInfo, RequestResult, StreamEvent};

enum Outcome {
    Completed { at: Instant, info: CompletionInfo },
    Failed { at: Instant, error: AdapterError },
}

/// Folds one call's event sequence into a [`RequestResult`].
///
/// Events after the first terminal event are ignored. Timing is kept as raw
/// instants and only converted to offsets from the run epoch when the result
/// is built.
pub struct StreamingMetricsCollector {
    request_id: u64,
    engine_name: String,
    model: Option<String>,
    epoch: Instant,
    started: Option<Instant>,
    first_byte: Option<Instant>,
    first_token: Option<Instant>,
    last_token: Option<Instant>,
    last_event: Option<Instant>,
    tokens_seen: u32,
    token_gaps: Duration,
    outcome: Option<Outcome>,
}

impl StreamingMetricsCollector {
    pub fn new(request_id: u64, engine_name: &str, model: Option<String>, epoch: Instant) -> Self {
        Self {
            request_id,
            engine_name: engine_name.to_string(),
            model,
            epoch,
            started: None,
            first_byte: None,
            first_token: None,
            last_token: None,
            last_event: None,
            tokens_seen: 0,
            token_gaps: Duration::ZERO,
            outcome: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn observe(&mut self, event: &StreamEvent) {
        if self.outcome.is_some() {
            log::debug!(
                "{} request {}: ignoring event after terminal: {:?}",
                self.engine_name,
                self.request_id,
                event
            );
            return;
        }

        let at = event.at();
        self.started.get_or_insert(at);
        self.last_event = Some(at);

        match event {
            StreamEvent::RequestStarted { .. } => {}
            StreamEvent::FirstByteReceived { .. } => {
                self.first_byte.get_or_insert(at);
            }
            StreamEvent::TokenReceived { .. } => {
                if let Some(previous) = self.last_token {
                    self.token_gaps += at.saturating_duration_since(previous);
                }
                self.first_token.get_or_insert(at);
                self.last_token = Some(at);
                self.tokens_seen += 1;
            }
            StreamEvent::ResponseCompleted { info, .. } => {
                self.outcome = Some(Outcome::Completed {
                    at,
                    info: info.clone(),
                });
            }
            StreamEvent::Error { error, .. } => {
                self.outcome = Some(Outcome::Failed {
                    at,
                    error: error.clone(),
                });
            }
        }
    }

    /// Finalize as cancelled unless a terminal event was already observed.
    pub fn cancel(&mut self, at: Instant) {
        if self.outcome.is_none() {
            self.started.get_or_insert(at);
            self.outcome = Some(Outcome::Failed {
                at,
                error: AdapterError::Cancelled,
            });
        }
    }

    pub fn into_result(self, attempts: u32) -> RequestResult {
        let epoch = self.epoch;
        let outcome = self.outcome.unwrap_or_else(|| Outcome::Failed {
            at: self.last_event.unwrap_or(epoch),
            error: AdapterError::Protocol("event stream ended without a terminal event".to_string()),
        });

        let started = self.started.unwrap_or(epoch);
        let offset = |at: Instant| at.saturating_duration_since(epoch);

        // Non-token streams only ever report their first byte
        let first = self.first_token.or(self.first_byte);

        let mut result = RequestResult {
            request_id: self.request_id,
            engine_name: self.engine_name,
            model: self.model,
            success: false,
            error_kind: None,
            error_message: None,
            attempts,
            request_start: offset(started),
            first_token_time: first.map(offset),
            completion_time: None,
            total_duration: None,
            prompt_tokens: None,
            completion_tokens: None,
            ttft: first.map(|at| at.saturating_duration_since(started)),
            inter_token_latency_avg: None,
            tokens_per_sec: None,
            eval_duration: None,
        };

        match outcome {
            Outcome::Completed { at, info } => {
                let total = at.saturating_duration_since(started);
                let completion_tokens = info
                    .completion_tokens
                    .or((self.tokens_seen > 0).then_some(self.tokens_seen));

                result.success = true;
                result.completion_time = Some(offset(at));
                result.total_duration = Some(total);
                result.prompt_tokens = info.prompt_tokens;
                result.completion_tokens = completion_tokens;
                result.eval_duration = info.eval_duration;
                result.tokens_per_sec = completion_tokens
                    .filter(|n| *n > 0 && !total.is_zero())
                    .map(|n| n as f64 / total.as_secs_f64());

                // Gaps between tokens plus the tail from the last token to completion
                if self.tokens_seen >= 2
                    && let Some(last) = self.last_token
                {
                    let tail = at.saturating_duration_since(last);
                    result.inter_token_latency_avg =
                        Some((self.token_gaps + tail) / self.tokens_seen);
                }
            }
            Outcome::Failed { at, error } => {
                result.total_duration = Some(at.saturating_duration_since(started));
                result.error_kind = Some(error.kind());
                result.error_message = Some(error.to_string());
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ErrorKind;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_streaming_timing() {
        let epoch = Instant::now();
        let start = epoch + ms(10);
        let mut collector = StreamingMetricsCollector::new(1, "vllm", None, epoch);

        collector.observe(&StreamEvent::RequestStarted { at: start });
        collector.observe(&StreamEvent::FirstByteReceived { at: start + ms(45) });
        for (index, t) in [50, 120, 300].into_iter().enumerate() {
            collector.observe(&StreamEvent::TokenReceived {
                index: index as u32,
                at: start + ms(t),
            });
        }
        collector.observe(&StreamEvent::ResponseCompleted {
            at: start + ms(320),
            info: CompletionInfo::default(),
        });

        let result = collector.into_result(1);
        assert!(result.success);
        assert_eq!(result.request_start, ms(10));
        assert_eq!(result.ttft, Some(ms(50)));
        assert_eq!(result.first_token_time, Some(ms(60)));
        assert_eq!(result.total_duration, Some(ms(320)));
        assert_eq!(result.completion_time, Some(ms(330)));
        assert_eq!(result.inter_token_latency_avg, Some(ms(90)));
        assert_eq!(result.completion_tokens, Some(3));
        let tps = result.tokens_per_sec.unwrap();
        assert!((tps - 3.0 / 0.32).abs() < 1e-9);
    }

    #[test]
    fn test_stall_after_first_byte_keeps_partial_timing() {
        let epoch = Instant::now();
        let mut collector = StreamingMetricsCollector::new(2, "tgi", None, epoch);

        collector.observe(&StreamEvent::RequestStarted { at: epoch });
        collector.observe(&StreamEvent::FirstByteReceived { at: epoch + ms(30) });
        collector.observe(&StreamEvent::Error {
            at: epoch + ms(200),
            error: AdapterError::Timeout(ms(200)),
        });

        let result = collector.into_result(1);
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.first_token_time, Some(ms(30)));
        assert_eq!(result.ttft, Some(ms(30)));
        assert_eq!(result.completion_time, None);
        assert_eq!(result.total_duration, Some(ms(200)));
        assert_eq!(result.tokens_per_sec, None);
    }

    #[test]
    fn test_zero_tokens_has_no_rate() {
        let epoch = Instant::now();
        let mut collector = StreamingMetricsCollector::new(3, "ollama", None, epoch);
        collector.observe(&StreamEvent::RequestStarted { at: epoch });
        collector.observe(&StreamEvent::ResponseCompleted {
            at: epoch + ms(40),
            info: CompletionInfo {
                completion_tokens: Some(0),
                ..Default::default()
            },
        });

        let result = collector.into_result(1);
        assert!(result.success);
        assert_eq!(result.completion_tokens, Some(0));
        assert_eq!(result.tokens_per_sec, None);
        assert_eq!(result.inter_token_latency_avg, None);
    }

    #[test]
    fn test_non_streaming_has_no_ttft() {
        let epoch = Instant::now();
        let mut collector = StreamingMetricsCollector::new(4, "vllm", None, epoch);
        collector.observe(&StreamEvent::RequestStarted { at: epoch });
        collector.observe(&StreamEvent::ResponseCompleted {
            at: epoch + ms(100),
            info: CompletionInfo {
                prompt_tokens: Some(9),
                completion_tokens: Some(20),
                eval_duration: Some(ms(80)),
            },
        });

        let result = collector.into_result(1);
        assert_eq!(result.ttft, None);
        assert_eq!(result.first_token_time, None);
        assert_eq!(result.total_duration, Some(ms(100)));
        assert_eq!(result.prompt_tokens, Some(9));
        assert_eq!(result.eval_duration, Some(ms(80)));
        assert!((result.tokens_per_sec.unwrap() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_events_after_terminal_are_ignored() {
        let epoch = Instant::now();
        let mut collector = StreamingMetricsCollector::new(5, "vllm", None, epoch);
        collector.observe(&StreamEvent::RequestStarted { at: epoch });
        collector.observe(&StreamEvent::Error {
            at: epoch + ms(5),
            error: AdapterError::Client {
                status: 400,
                message: "bad".to_string(),
            },
        });
        collector.observe(&StreamEvent::TokenReceived {
            index: 0,
            at: epoch + ms(6),
        });
        collector.cancel(epoch + ms(7));

        let result = collector.into_result(1);
        assert_eq!(result.error_kind, Some(ErrorKind::Client));
        assert_eq!(result.first_token_time, None);
        assert_eq!(result.total_duration, Some(ms(5)));
    }

    #[test]
    fn test_cancel_and_missing_terminal() {
        let epoch = Instant::now();
        let mut collector = StreamingMetricsCollector::new(6, "vllm", None, epoch);
        collector.observe(&StreamEvent::RequestStarted { at: epoch + ms(1) });
        collector.cancel(epoch + ms(50));
        let result = collector.into_result(2);
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(result.attempts, 2);
        assert_eq!(result.total_duration, Some(ms(49)));

        let mut collector = StreamingMetricsCollector::new(7, "vllm", None, epoch);
        collector.observe(&StreamEvent::RequestStarted { at: epoch });
        assert!(!collector.is_finished());
        let result = collector.into_result(1);
        assert_eq!(result.error_kind, Some(ErrorKind::Protocol));
    }
}
