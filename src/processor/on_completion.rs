//! Route-level completion hooks.

use super::SharedProcessor;
use crate::definition::OnCompletionMode;
use crate::exchange::{Exchange, EXCEPTION_CAUGHT};
use crate::expression::SharedPredicate;
use crate::pool::PoolHandle;
use serde_json::json;
use std::sync::Arc;

pub struct OnCompletionHook {
    route: Arc<str>,
    mode: OnCompletionMode,
    on_complete_only: bool,
    on_failure_only: bool,
    on_when: Option<SharedPredicate>,
    output: SharedProcessor,
    pool: Option<PoolHandle>,
}

pub struct OnCompletionSettings {
    pub mode: OnCompletionMode,
    pub on_complete_only: bool,
    pub on_failure_only: bool,
    pub on_when: Option<SharedPredicate>,
}

impl OnCompletionHook {
    pub fn new(
        route: Arc<str>,
        settings: OnCompletionSettings,
        output: SharedProcessor,
        pool: Option<PoolHandle>,
    ) -> Self {
        Self {
            route,
            mode: settings.mode,
            on_complete_only: settings.on_complete_only,
            on_failure_only: settings.on_failure_only,
            on_when: settings.on_when,
            output,
            pool,
        }
    }

    pub fn mode(&self) -> OnCompletionMode {
        self.mode
    }

    /// Whether the hook fires for `exchange`; its failure state must be set.
    fn applies(&self, exchange: &Exchange) -> bool {
        let failed = exchange.is_failed();
        if (self.on_complete_only && failed) || (self.on_failure_only && !failed) {
            return false;
        }
        match &self.on_when {
            Some(on_when) => on_when.matches(exchange).unwrap_or_else(|err| {
                tracing::warn!(
                    target: "courier::on_completion",
                    event = "predicate_failed",
                    route = %self.route,
                    error = %err,
                );
                false
            }),
            None => true,
        }
    }

    /// Runs the hook for a finished route. Hook failures are logged and never
    /// change the outcome of `exchange`.
    pub async fn run(&self, exchange: &mut Exchange) {
        if !self.applies(exchange) {
            return;
        }
        match self.mode {
            OnCompletionMode::BeforeConsumer => self.run_before_consumer(exchange).await,
            OnCompletionMode::AfterConsumer => self.run_after_consumer(exchange).await,
        }
    }

    async fn run_before_consumer(&self, exchange: &mut Exchange) {
        let failure = exchange.take_exception();
        if let Some(err) = &failure {
            exchange.set_property(EXCEPTION_CAUGHT, json!({ "kind": err.kind(), "message": err.to_string() }));
        }
        let stop = exchange.is_route_stop();
        exchange.set_route_stop(false);
        if let Err(err) = self.output.process(exchange).await {
            log_failure(&self.route, exchange, &err.to_string());
        }
        exchange.set_route_stop(stop);
        if let Some(err) = failure {
            exchange.set_exception(err);
        }
    }

    async fn run_after_consumer(&self, exchange: &Exchange) {
        let mut copy = exchange.copy();
        if let Some(err) = exchange.exception() {
            copy.set_property(EXCEPTION_CAUGHT, json!({ "kind": err.kind(), "message": err.to_string() }));
        }
        let output = self.output.clone();
        let route = self.route.clone();
        let work = async move {
            if let Err(err) = output.process(&mut copy).await {
                copy.set_exception(err.clone());
                log_failure(&route, &copy, &err.to_string());
            }
            copy.done();
        };

        let Some(pool) = &self.pool else {
            work.await;
            return;
        };
        match pool.pool().submit(work) {
            Ok(task) => {
                tokio::spawn(task);
            }
            Err(err) => log_failure(&self.route, exchange, &err.to_string()),
        }
    }
}

fn log_failure(route: &str, exchange: &Exchange, error: &str) {
    tracing::warn!(
        target: "courier::on_completion",
        event = "on_completion_failed",
        route = %route,
        exchange_id = %exchange.id(),
        error = %error,
    );
}
