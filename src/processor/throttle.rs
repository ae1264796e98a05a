//! Sliding-window throttler.

use super::{Processor, SharedProcessor};
use crate::exchange::{json_to_text, Exchange, ExchangeError};
use crate::expression::SharedExpression;
use crate::metrics::metrics;
use crate::pool::PoolHandle;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TIME_PERIOD: Duration = Duration::from_millis(1000);

/// Admission timestamps within the current period.
struct Window {
    period: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl Window {
    /// Admits now, or returns how long to wait before the next free slot.
    fn try_acquire(&self, max_requests: u64) -> Option<Duration> {
        let now = Instant::now();
        let mut admitted = self.admitted.lock().unwrap_or_else(|err| err.into_inner());
        while let Some(oldest) = admitted.front() {
            if now.duration_since(*oldest) >= self.period {
                admitted.pop_front();
            } else {
                break;
            }
        }
        if (admitted.len() as u64) < max_requests {
            admitted.push_back(now);
            return None;
        }
        let oldest = admitted.front().copied().unwrap_or(now);
        Some((oldest + self.period).saturating_duration_since(now))
    }

    async fn acquire(&self, max_requests: u64) {
        while let Some(wait) = self.try_acquire(max_requests) {
            tokio::time::sleep(wait).await;
        }
    }
}

pub struct ThrottleSettings {
    pub time_period: Duration,
    pub reject_execution: bool,
    pub async_delayed: bool,
    pub caller_runs_when_rejected: bool,
}

pub struct ThrottleProcessor {
    route: Arc<str>,
    node: String,
    expression: SharedExpression,
    window: Arc<Window>,
    reject_execution: bool,
    async_delayed: bool,
    caller_runs_when_rejected: bool,
    pool: Option<PoolHandle>,
    output: SharedProcessor,
}

impl ThrottleProcessor {
    pub fn new(
        route: Arc<str>,
        node: String,
        expression: SharedExpression,
        settings: ThrottleSettings,
        pool: Option<PoolHandle>,
        output: SharedProcessor,
    ) -> Self {
        Self {
            route,
            node,
            expression,
            window: Arc::new(Window {
                period: settings.time_period,
                admitted: Mutex::new(VecDeque::new()),
            }),
            reject_execution: settings.reject_execution,
            async_delayed: settings.async_delayed,
            caller_runs_when_rejected: settings.caller_runs_when_rejected,
            pool,
            output,
        }
    }

    fn max_requests(&self, exchange: &Exchange) -> Result<u64, ExchangeError> {
        let value = self.expression.evaluate(exchange)?;
        let parsed = match &value {
            JsonValue::Number(number) => number.as_u64(),
            other => json_to_text(other).and_then(|text| text.trim().parse::<u64>().ok()),
        };
        parsed.ok_or_else(|| {
            ExchangeError::expression(
                self.expression.describe(),
                format!("maximum requests per period must be a non-negative integer, got {value}"),
            )
        })
    }

    async fn delay_on_pool(
        &self,
        pool: &PoolHandle,
        max_requests: u64,
        exchange: &mut Exchange,
    ) -> Result<(), ExchangeError> {
        let window = self.window.clone();
        let output = self.output.clone();
        let mut delayed = exchange.clone();
        let submitted = pool.pool().submit(async move {
            window.acquire(max_requests).await;
            let result = output.process(&mut delayed).await;
            (delayed, result)
        });
        match submitted {
            Ok(task) => {
                let (delayed, result) = task.await?;
                *exchange = delayed;
                result
            }
            Err(err) if self.caller_runs_when_rejected => {
                tracing::debug!(
                    target: "courier::throttle",
                    event = "delayed_caller_runs",
                    route = %self.route,
                    node = %self.node,
                    error = %err,
                );
                self.window.acquire(max_requests).await;
                self.output.process(exchange).await
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Processor for ThrottleProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let max_requests = self.max_requests(exchange)?;
        let Some(wait) = self.window.try_acquire(max_requests) else {
            return self.output.process(exchange).await;
        };

        if self.reject_execution {
            metrics().record_throttle_rejection(&self.route);
            crate::route_event!(
                debug,
                "courier::throttle",
                "throttle_rejected",
                route = self.route,
                node = self.node,
                max_requests = max_requests,
            );
            return Err(ExchangeError::ThrottleRejected {
                max_requests,
                period_ms: self.window.period.as_millis() as u64,
            });
        }

        tracing::trace!(
            target: "courier::throttle",
            event = "throttle_delayed",
            route = %self.route,
            node = %self.node,
            wait_ms = wait.as_millis() as u64,
        );
        if self.async_delayed {
            if let Some(pool) = &self.pool {
                return self.delay_on_pool(pool, max_requests, exchange).await;
            }
        }
        self.window.acquire(max_requests).await;
        self.output.process(exchange).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::constant;
    use crate::processor::processor_fn;
    use serde_json::json;

    fn throttle(reject_execution: bool) -> ThrottleProcessor {
        ThrottleProcessor::new(
            Arc::from("orders"),
            "throttle1".into(),
            constant(2),
            ThrottleSettings {
                time_period: Duration::from_millis(1000),
                reject_execution,
                async_delayed: false,
                caller_runs_when_rejected: true,
            },
            None,
            processor_fn(|_| Ok(())),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_until_next_period() {
        let throttle = throttle(false);
        let started = Instant::now();
        for _ in 0..3 {
            let mut exchange = Exchange::new(json!(null));
            throttle.process(&mut exchange).await.expect("admitted");
        }
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_when_configured() {
        let throttle = throttle(true);
        for _ in 0..2 {
            let mut exchange = Exchange::new(json!(null));
            throttle.process(&mut exchange).await.expect("admitted");
        }
        let mut exchange = Exchange::new(json!(null));
        let err = throttle.process(&mut exchange).await.unwrap_err();
        assert_eq!(err.kind(), "ThrottleRejected");

        tokio::time::advance(Duration::from_millis(1001)).await;
        throttle.process(&mut exchange).await.expect("next period");
    }
}
