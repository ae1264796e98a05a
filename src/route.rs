//! Route runtime: the consumer processor registered for a started route.

use crate::exchange::{Exchange, ExchangeError, ROUTE_ID};
use crate::metrics::metrics;
use crate::pool::PoolHandle;
use crate::processor::on_completion::OnCompletionHook;
use crate::processor::{take_failure, Processor, SharedProcessor};
use crate::definition::OnCompletionMode;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Stopped,
    Started,
    /// Definition replaced by advice and not yet restarted.
    Merged,
}

/// Hooks into the lifecycle of a route and of the exchanges it consumes.
pub trait RoutePolicy: Send + Sync {
    fn on_init(&self, _route: &str) {}

    fn on_start(&self, _route: &str) {}

    fn on_stop(&self, _route: &str) {}

    fn on_exchange_begin(&self, _route: &str, _exchange: &Exchange) {}

    fn on_exchange_done(&self, _route: &str, _exchange: &Exchange) {}
}

pub type SharedRoutePolicy = Arc<dyn RoutePolicy>;

/// Everything reification produced for one route.
pub struct BuiltRoute {
    pub id: Arc<str>,
    pub from: String,
    pub pipeline: SharedProcessor,
    pub on_completions: Vec<OnCompletionHook>,
    pub policies: Vec<SharedRoutePolicy>,
    pub owned_pools: Vec<PoolHandle>,
}

impl BuiltRoute {
    /// Shuts down the pools this route created, completion hook pools included.
    pub fn release(&self) {
        for pool in &self.owned_pools {
            pool.shutdown_if_owned();
        }
    }
}

/// Processor registered on the route's `from` URI while it is started.
pub struct RouteConsumer {
    route: BuiltRoute,
    inflight: Arc<AtomicUsize>,
}

struct InflightGuard(Arc<AtomicUsize>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RouteConsumer {
    pub fn new(route: BuiltRoute) -> Self {
        Self {
            route,
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn route(&self) -> &BuiltRoute {
        &self.route
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    async fn run_hooks(&self, exchange: &mut Exchange, mode: OnCompletionMode) {
        for hook in self.route.on_completions.iter().filter(|hook| hook.mode() == mode) {
            hook.run(exchange).await;
        }
    }
}

#[async_trait]
impl Processor for RouteConsumer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        let _guard = InflightGuard(self.inflight.clone());
        let route = &*self.route.id;

        exchange.capture_original();
        exchange.set_property(ROUTE_ID, route.to_string());
        for policy in &self.route.policies {
            policy.on_exchange_begin(route, exchange);
        }

        if let Err(err) = self.route.pipeline.process(exchange).await {
            exchange.set_exception(err);
        }

        if exchange.is_failed() {
            metrics().record_exchange_failed(route);
            tracing::debug!(
                target: "courier::route",
                event = "exchange_failed",
                route = %route,
                exchange_id = %exchange.id(),
                error = %exchange.exception().map(ToString::to_string).unwrap_or_default(),
            );
        } else {
            metrics().record_exchange_completed(route);
        }

        self.run_hooks(exchange, OnCompletionMode::BeforeConsumer).await;
        self.run_hooks(exchange, OnCompletionMode::AfterConsumer).await;

        for policy in &self.route.policies {
            policy.on_exchange_done(route, exchange);
        }
        take_failure(exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor_fn;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl RoutePolicy for Recording {
        fn on_exchange_begin(&self, route: &str, _exchange: &Exchange) {
            self.events.lock().unwrap().push(format!("begin:{route}"));
        }

        fn on_exchange_done(&self, route: &str, exchange: &Exchange) {
            let outcome = if exchange.is_failed() { "failed" } else { "ok" };
            self.events.lock().unwrap().push(format!("done:{route}:{outcome}"));
        }
    }

    #[tokio::test]
    async fn policies_observe_each_exchange() {
        let policy = Arc::new(Recording::default());
        let consumer = RouteConsumer::new(BuiltRoute {
            id: Arc::from("orders"),
            from: "direct:orders".into(),
            pipeline: processor_fn(|_| Err(ExchangeError::raised("IoError", "down"))),
            on_completions: Vec::new(),
            policies: vec![policy.clone()],
            owned_pools: Vec::new(),
        });

        let mut exchange = Exchange::new(json!(null));
        let err = consumer.process(&mut exchange).await.unwrap_err();
        assert_eq!(err.kind(), "IoError");
        assert!(!exchange.is_failed());
        assert_eq!(exchange.property(ROUTE_ID), Some(&json!("orders")));
        assert_eq!(
            *policy.events.lock().unwrap(),
            vec!["begin:orders", "done:orders:failed"]
        );
        assert_eq!(consumer.inflight(), 0);
    }
}
