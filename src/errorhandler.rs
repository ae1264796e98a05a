//! Error handler wrapping: exception clauses, redelivery and dead letter.
//!
//! Every reified node runs inside an [`ErrorHandlerProcessor`]. A failure is
//! redelivered to that node according to the selected clause or the
//! handler's policy. Once exhausted, the clause (or dead letter endpoint)
//! takes over. A failure raised while handling a failure surfaces as
//! [`ExchangeError::Fatal`] and is never handled again.

use crate::endpoint::{send_to, SharedEndpoint};
use crate::exchange::{
    Exchange, ExchangeError, EXCEPTION_CAUGHT, FAILURE_ENDPOINT, REDELIVERED, REDELIVERY_COUNTER,
};
use crate::expression::SharedPredicate;
use crate::metrics::metrics;
use crate::processor::{Processor, SharedProcessor};
use crate::retry::RedeliveryPolicy;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseScope {
    Route,
    Context,
}

pub struct ExceptionClause {
    /// Failure kinds selected by this clause; empty selects every kind.
    pub kinds: Vec<String>,
    pub scope: ClauseScope,
    pub on_when: Option<SharedPredicate>,
    pub handled: Option<SharedPredicate>,
    pub continued: Option<SharedPredicate>,
    pub retry_while: Option<SharedPredicate>,
    pub maximum_redeliveries: Option<i32>,
    pub redelivery_delay: Option<Duration>,
    pub on_redelivery: Option<SharedProcessor>,
    pub use_original_message: bool,
    pub processor: Option<SharedProcessor>,
}

impl ExceptionClause {
    fn selects(&self, err: &ExchangeError) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|kind| kind == err.kind())
    }

    fn specificity(&self) -> u8 {
        match (self.kinds.is_empty(), self.on_when.is_some()) {
            (false, true) => 3,
            (false, false) => 2,
            (true, true) => 1,
            (true, false) => 0,
        }
    }
}

pub enum ErrorHandlerKind {
    /// Failures propagate once redeliveries are exhausted.
    Default,
    /// Exhausted failures are sent to the endpoint and marked handled.
    DeadLetterChannel {
        endpoint: SharedEndpoint,
        use_original_message: bool,
    },
    None,
}

/// Per-route handler configuration shared by every wrapped node.
pub struct ErrorHandler {
    route: Arc<str>,
    kind: ErrorHandlerKind,
    policy: RedeliveryPolicy,
    on_redelivery: Option<SharedProcessor>,
    clauses: Vec<Arc<ExceptionClause>>,
}

impl ErrorHandler {
    /// `clauses` hold route clauses first, then context clauses.
    pub fn new(
        route: Arc<str>,
        kind: ErrorHandlerKind,
        policy: RedeliveryPolicy,
        on_redelivery: Option<SharedProcessor>,
        clauses: Vec<Arc<ExceptionClause>>,
    ) -> Self {
        Self {
            route,
            kind,
            policy,
            on_redelivery,
            clauses,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, ErrorHandlerKind::None)
    }

    fn uses_original_message(&self) -> bool {
        matches!(
            self.kind,
            ErrorHandlerKind::DeadLetterChannel {
                use_original_message: true,
                ..
            }
        ) || self.clauses.iter().any(|clause| clause.use_original_message)
    }

    /// Most specific matching clause; route clauses win ties over context ones.
    fn select_clause(&self, err: &ExchangeError, exchange: &mut Exchange) -> Option<Arc<ExceptionClause>> {
        let mut best: Option<&Arc<ExceptionClause>> = None;
        for clause in &self.clauses {
            if !clause.selects(err) {
                continue;
            }
            if let Some(on_when) = &clause.on_when {
                if !self.evaluate_with_failure(on_when, err, exchange) {
                    continue;
                }
            }
            let better = match best {
                None => true,
                Some(current) => clause.specificity() > current.specificity(),
            };
            if better {
                best = Some(clause);
            }
        }
        best.cloned()
    }

    /// Evaluates `predicate` with `err` visible on the exchange. An evaluation
    /// failure counts as `false`.
    fn evaluate_with_failure(&self, predicate: &SharedPredicate, err: &ExchangeError, exchange: &mut Exchange) -> bool {
        exchange.set_exception(err.clone());
        let outcome = predicate.matches(exchange);
        exchange.take_exception();
        outcome.unwrap_or_else(|eval_err| {
            tracing::warn!(
                target: "courier::errorhandler",
                event = "predicate_failed",
                route = %self.route,
                predicate = %predicate.describe(),
                error = %eval_err,
            );
            false
        })
    }

    pub async fn run(&self, inner: &dyn Processor, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        if self.is_none() {
            return inner.process(exchange).await;
        }
        if self.uses_original_message() {
            exchange.capture_original();
        }
        let mut attempt: u32 = 0;
        loop {
            let err = match inner.process(exchange).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if err.is_fatal() || exchange.is_failure_handled() {
                return Err(err);
            }

            let clause = self.select_clause(&err, exchange);
            let policy = match &clause {
                Some(clause) => self
                    .policy
                    .overridden(clause.maximum_redeliveries, clause.redelivery_delay),
                None => self.policy.clone(),
            };
            attempt += 1;
            let retry = match clause.as_ref().and_then(|clause| clause.retry_while.as_ref()) {
                Some(retry_while) => self.evaluate_with_failure(retry_while, &err, exchange),
                None => policy.allows(attempt),
            };
            if !retry {
                return self
                    .exhausted(exchange, err, clause.as_deref())
                    .await;
            }

            let delay = policy.delay_for(attempt);
            metrics().record_redelivery(&self.route);
            tracing::debug!(
                target: "courier::errorhandler",
                event = "redelivery_scheduled",
                route = %self.route,
                exchange_id = %exchange.id(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            exchange.set_header(REDELIVERED, true);
            exchange.set_header(REDELIVERY_COUNTER, attempt);

            let on_redelivery = clause
                .as_ref()
                .and_then(|clause| clause.on_redelivery.clone())
                .or_else(|| self.on_redelivery.clone());
            if let Some(on_redelivery) = on_redelivery {
                if let Err(cause) = on_redelivery.process(exchange).await {
                    exchange.set_failure_handled(true);
                    return Err(ExchangeError::fatal(err, cause));
                }
            }
        }
    }

    async fn exhausted(
        &self,
        exchange: &mut Exchange,
        err: ExchangeError,
        clause: Option<&ExceptionClause>,
    ) -> Result<(), ExchangeError> {
        exchange.set_property(EXCEPTION_CAUGHT, caught_json(&err));

        if let Some(clause) = clause {
            if clause.use_original_message {
                exchange.restore_original();
            }
            let handled = clause
                .handled
                .as_ref()
                .is_some_and(|handled| self.evaluate_with_failure(handled, &err, exchange));
            let continued = clause
                .continued
                .as_ref()
                .is_some_and(|continued| self.evaluate_with_failure(continued, &err, exchange));

            if let Some(processor) = &clause.processor {
                if let Err(cause) = processor.process(exchange).await {
                    exchange.set_failure_handled(true);
                    return Err(fatal_from(err, cause));
                }
            }

            tracing::info!(
                target: "courier::errorhandler",
                event = "exception_clause_applied",
                route = %self.route,
                exchange_id = %exchange.id(),
                kind = %err.kind(),
                handled,
                continued,
            );
            if continued {
                exchange.remove_property(EXCEPTION_CAUGHT);
                return Ok(());
            }
            if handled {
                exchange.set_route_stop(true);
                return Ok(());
            }
            exchange.set_failure_handled(true);
            return Err(err);
        }

        match &self.kind {
            ErrorHandlerKind::DeadLetterChannel {
                endpoint,
                use_original_message,
            } => {
                if *use_original_message {
                    exchange.restore_original();
                }
                exchange.set_property(FAILURE_ENDPOINT, endpoint.uri().to_string());
                tracing::warn!(
                    target: "courier::errorhandler",
                    event = "dead_letter",
                    route = %self.route,
                    exchange_id = %exchange.id(),
                    endpoint = %endpoint.uri(),
                    error = %err,
                );
                if let Err(cause) = send_to(endpoint, exchange).await {
                    exchange.set_failure_handled(true);
                    return Err(ExchangeError::fatal(err, cause));
                }
                exchange.set_route_stop(true);
                Ok(())
            }
            ErrorHandlerKind::Default | ErrorHandlerKind::None => {
                exchange.set_failure_handled(true);
                Err(err)
            }
        }
    }
}

fn caught_json(err: &ExchangeError) -> JsonValue {
    json!({ "kind": err.kind(), "message": err.to_string() })
}

fn fatal_from(original: ExchangeError, cause: ExchangeError) -> ExchangeError {
    if cause.is_fatal() {
        cause
    } else {
        ExchangeError::fatal(original, cause)
    }
}

/// Runs `inner` under the route's error handler.
pub struct ErrorHandlerProcessor {
    handler: Arc<ErrorHandler>,
    inner: SharedProcessor,
}

impl ErrorHandlerProcessor {
    pub fn new(handler: Arc<ErrorHandler>, inner: SharedProcessor) -> Self {
        Self { handler, inner }
    }
}

#[async_trait]
impl Processor for ErrorHandlerProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        self.handler.run(self.inner.as_ref(), exchange).await
    }
}

/// Guards processors that run while a failure is being handled: anything
/// they raise becomes fatal instead of re-entering normal handling.
pub struct FatalFallbackProcessor {
    inner: SharedProcessor,
}

impl FatalFallbackProcessor {
    pub fn new(inner: SharedProcessor) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Processor for FatalFallbackProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        match self.inner.process(exchange).await {
            Ok(()) => Ok(()),
            Err(cause) if cause.is_fatal() => Err(cause),
            Err(cause) => {
                let original = exchange
                    .property(EXCEPTION_CAUGHT)
                    .map(|caught| {
                        let kind = caught.get("kind").and_then(JsonValue::as_str).unwrap_or("Unknown");
                        let message = caught
                            .get("message")
                            .and_then(JsonValue::as_str)
                            .unwrap_or_default();
                        ExchangeError::raised(kind, message)
                    })
                    .unwrap_or_else(|| ExchangeError::raised("Unknown", "failure while handling failure"));
                tracing::error!(
                    target: "courier::errorhandler",
                    event = "fatal_fallback",
                    exchange_id = %exchange.id(),
                    original = %original,
                    error = %cause,
                );
                Err(ExchangeError::fatal(original, cause))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::predicate_fn;
    use crate::processor::processor_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing_times(times: usize, counter: Arc<AtomicUsize>) -> SharedProcessor {
        processor_fn(move |_exchange| {
            let seen = counter.fetch_add(1, Ordering::SeqCst);
            if seen < times {
                Err(ExchangeError::raised("IoError", "flaky"))
            } else {
                Ok(())
            }
        })
    }

    fn clause(kinds: &[&str]) -> ExceptionClause {
        ExceptionClause {
            kinds: kinds.iter().map(|kind| kind.to_string()).collect(),
            scope: ClauseScope::Route,
            on_when: None,
            handled: None,
            continued: None,
            retry_while: None,
            maximum_redeliveries: None,
            redelivery_delay: None,
            on_redelivery: None,
            use_original_message: false,
            processor: None,
        }
    }

    fn handler(policy: RedeliveryPolicy, clauses: Vec<ExceptionClause>) -> ErrorHandler {
        ErrorHandler::new(
            Arc::from("test"),
            ErrorHandlerKind::Default,
            policy,
            None,
            clauses.into_iter().map(Arc::new).collect(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn redelivers_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = failing_times(2, calls.clone());
        let handler = handler(
            RedeliveryPolicy {
                maximum_redeliveries: 3,
                redelivery_delay: Duration::from_millis(10),
                ..RedeliveryPolicy::default()
            },
            Vec::new(),
        );

        let mut exchange = Exchange::new(json!(null));
        handler.run(inner.as_ref(), &mut exchange).await.expect("third attempt succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exchange.header(REDELIVERY_COUNTER), Some(&json!(2)));
        assert_eq!(exchange.header(REDELIVERED), Some(&json!(true)));
    }

    #[tokio::test]
    async fn unhandled_clause_marks_failure_handled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = failing_times(usize::MAX, calls);
        let handler = handler(RedeliveryPolicy::default(), vec![clause(&["IoError"])]);

        let mut exchange = Exchange::new(json!(null));
        let err = handler.run(inner.as_ref(), &mut exchange).await.unwrap_err();
        assert_eq!(err.kind(), "IoError");
        assert!(exchange.is_failure_handled());
        assert_eq!(
            exchange.property(EXCEPTION_CAUGHT).and_then(|c| c.get("kind")),
            Some(&json!("IoError"))
        );
    }

    #[tokio::test]
    async fn specific_clause_beats_catch_all() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = failing_times(usize::MAX, calls);
        let mut catch_all = clause(&[]);
        catch_all.handled = Some(predicate_fn(|_| true));
        catch_all.processor = Some(processor_fn(|exchange| {
            exchange.set_body(json!("catch-all"));
            Ok(())
        }));
        let mut specific = clause(&["IoError"]);
        specific.handled = Some(predicate_fn(|_| true));
        specific.processor = Some(processor_fn(|exchange| {
            exchange.set_body(json!("specific"));
            Ok(())
        }));
        let handler = handler(RedeliveryPolicy::default(), vec![catch_all, specific]);

        let mut exchange = Exchange::new(json!(null));
        handler.run(inner.as_ref(), &mut exchange).await.expect("handled");
        assert_eq!(exchange.body(), &json!("specific"));
        assert!(exchange.is_route_stop());
    }

    #[tokio::test]
    async fn failure_inside_clause_is_fatal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = failing_times(usize::MAX, calls);
        let mut broken = clause(&["IoError"]);
        broken.handled = Some(predicate_fn(|_| true));
        broken.processor = Some(Arc::new(FatalFallbackProcessor::new(processor_fn(|_| {
            Err(ExchangeError::raised("Boom", "handler broke"))
        }))));
        let handler = handler(RedeliveryPolicy::default(), vec![broken]);

        let mut exchange = Exchange::new(json!(null));
        let err = handler.run(inner.as_ref(), &mut exchange).await.unwrap_err();
        assert!(err.is_fatal());
        let ExchangeError::Fatal { original, cause } = err else {
            unreachable!()
        };
        assert_eq!(original.kind(), "IoError");
        assert_eq!(cause.kind(), "Boom");
    }
}
