use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const CORRELATION_ID: &str = "correlation_id";
pub const EXCEPTION_CAUGHT: &str = "exception_caught";
pub const FAILURE_ENDPOINT: &str = "failure_endpoint";
pub const FILTER_MATCHED: &str = "filter_matched";
pub const DUPLICATE_MESSAGE: &str = "duplicate_message";
pub const MULTICAST_INDEX: &str = "multicast_index";
pub const MULTICAST_COMPLETE: &str = "multicast_complete";
pub const SPLIT_INDEX: &str = "split_index";
pub const SPLIT_SIZE: &str = "split_size";
pub const SPLIT_COMPLETE: &str = "split_complete";
pub const RECIPIENT_LIST_ENDPOINT: &str = "recipient_list_endpoint";
pub const SLIP_ENDPOINT: &str = "slip_endpoint";
pub const DYNAMIC_ROUTER_HOPS: &str = "dynamic_router_hops";
pub const TO_ENDPOINT: &str = "to_endpoint";
pub const INTERCEPTED_ENDPOINT: &str = "intercepted_endpoint";
pub const MESSAGE_HISTORY: &str = "message_history";
pub const ROUTE_ID: &str = "route_id";
pub const REDELIVERED: &str = "redelivered";
pub const REDELIVERY_COUNTER: &str = "redelivery_counter";
pub const SAGA_ID: &str = "saga_id";

/// Failure carried by an exchange while it moves through a route.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    #[error("{kind}: {message}")]
    Raised { kind: String, message: String },
    #[error("expression `{expression}` failed: {reason}")]
    Expression { expression: String, reason: String },
    #[error("no endpoint could be resolved for `{uri}`")]
    NoSuchEndpoint { uri: String },
    #[error("exceeded {max_requests} requests per {period_ms}ms, exchange rejected")]
    ThrottleRejected { max_requests: u64, period_ms: u64 },
    #[error("thread pool `{pool}` rejected the task")]
    PoolRejected { pool: String },
    #[error("timed out after {timeout_ms}ms with {pending} of {total} branches outstanding")]
    Timeout {
        timeout_ms: u64,
        pending: usize,
        total: usize,
    },
    #[error("aggregation failed: {reason}")]
    Aggregation { reason: String },
    #[error("saga failure: {reason}")]
    Saga { reason: String },
    #[error("route `{route}` is not started")]
    RouteNotStarted { route: String },
    #[error("fatal failure while handling `{original}`: {cause}")]
    Fatal {
        original: Box<ExchangeError>,
        cause: Box<ExchangeError>,
    },
}

impl ExchangeError {
    pub fn raised(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Raised {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn expression(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    pub fn fatal(original: ExchangeError, cause: ExchangeError) -> Self {
        Self::Fatal {
            original: Box::new(original),
            cause: Box::new(cause),
        }
    }

    /// Type name used by exception clauses to select this failure.
    pub fn kind(&self) -> &str {
        match self {
            ExchangeError::Raised { kind, .. } => kind,
            ExchangeError::Expression { .. } => "ExpressionError",
            ExchangeError::NoSuchEndpoint { .. } => "NoSuchEndpoint",
            ExchangeError::ThrottleRejected { .. } => "ThrottleRejected",
            ExchangeError::PoolRejected { .. } => "PoolRejected",
            ExchangeError::Timeout { .. } => "Timeout",
            ExchangeError::Aggregation { .. } => "AggregationError",
            ExchangeError::Saga { .. } => "SagaError",
            ExchangeError::RouteNotStarted { .. } => "RouteNotStarted",
            ExchangeError::Fatal { .. } => "Fatal",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Fatal { .. })
    }

    fn to_json(&self) -> JsonValue {
        json!({ "kind": self.kind(), "message": self.to_string() })
    }
}

/// Callback invoked once the unit of work of an exchange is done.
pub trait Synchronization: Send + Sync {
    fn on_complete(&self, exchange: &Exchange);
    fn on_failure(&self, exchange: &Exchange);
}

/// Message as it entered the first route the exchange was consumed by.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginalMessage {
    pub body: JsonValue,
    pub headers: BTreeMap<String, JsonValue>,
}

#[derive(Clone)]
pub struct Exchange {
    id: String,
    body: JsonValue,
    headers: BTreeMap<String, JsonValue>,
    properties: BTreeMap<String, JsonValue>,
    exception: Option<ExchangeError>,
    route_stop: bool,
    failure_handled: bool,
    synchronizations: Vec<Arc<dyn Synchronization>>,
    original: Option<Arc<OriginalMessage>>,
}

impl Exchange {
    pub fn new(body: impl Into<JsonValue>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body: body.into(),
            headers: BTreeMap::new(),
            properties: BTreeMap::new(),
            exception: None,
            route_stop: false,
            failure_handled: false,
            synchronizations: Vec::new(),
            original: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &JsonValue {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut JsonValue {
        &mut self.body
    }

    pub fn set_body(&mut self, body: impl Into<JsonValue>) {
        self.body = body.into();
    }

    pub fn into_body(self) -> JsonValue {
        self.body
    }

    pub fn headers(&self) -> &BTreeMap<String, JsonValue> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&JsonValue> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<JsonValue>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<JsonValue> {
        self.headers.remove(name)
    }

    pub fn properties(&self) -> &BTreeMap<String, JsonValue> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&JsonValue> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<JsonValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove_property(&mut self, name: &str) -> Option<JsonValue> {
        self.properties.remove(name)
    }

    pub fn exception(&self) -> Option<&ExchangeError> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, error: ExchangeError) {
        self.exception = Some(error);
    }

    pub fn take_exception(&mut self) -> Option<ExchangeError> {
        self.exception.take()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    pub fn is_route_stop(&self) -> bool {
        self.route_stop
    }

    pub fn set_route_stop(&mut self, stop: bool) {
        self.route_stop = stop;
    }

    pub fn is_failure_handled(&self) -> bool {
        self.failure_handled
    }

    pub fn set_failure_handled(&mut self, handled: bool) {
        self.failure_handled = handled;
    }

    pub fn add_synchronization(&mut self, synchronization: Arc<dyn Synchronization>) {
        self.synchronizations.push(synchronization);
    }

    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.len()
    }

    /// Moves pending unit-of-work callbacks onto `target`.
    pub fn handover_synchronizations(&mut self, target: &mut Exchange) {
        target.synchronizations.append(&mut self.synchronizations);
    }

    /// Records the current message as the original one. Later calls keep the
    /// first capture, so a route reached through `direct:` sees the caller's input.
    pub fn capture_original(&mut self) {
        if self.original.is_none() {
            self.original = Some(Arc::new(OriginalMessage {
                body: self.body.clone(),
                headers: self.headers.clone(),
            }));
        }
    }

    pub fn original_message(&self) -> Option<&OriginalMessage> {
        self.original.as_deref()
    }

    /// Replaces body and headers with the captured original message, if any.
    pub fn restore_original(&mut self) -> bool {
        let Some(original) = self.original.clone() else {
            return false;
        };
        self.body = original.body.clone();
        self.headers = original.headers.clone();
        true
    }

    /// Correlated copy for a sub-exchange: fresh id, same message, no failure state.
    pub fn copy(&self) -> Exchange {
        let mut copy = Exchange::new(self.body.clone());
        copy.headers = self.headers.clone();
        copy.properties = self.properties.clone();
        copy.properties
            .insert(CORRELATION_ID.to_string(), JsonValue::String(self.id.clone()));
        copy.original = self.original.clone();
        copy
    }

    /// Copies message, properties and failure state of `source` onto this exchange.
    pub fn copy_results_from(&mut self, source: &Exchange) {
        self.body = source.body.clone();
        self.headers = source.headers.clone();
        for (key, value) in &source.properties {
            if key != CORRELATION_ID {
                self.properties.insert(key.clone(), value.clone());
            }
        }
        self.exception = source.exception.clone();
        self.failure_handled = source.failure_handled;
    }

    /// Runs and drains the unit-of-work callbacks.
    pub fn done(&mut self) {
        let synchronizations = std::mem::take(&mut self.synchronizations);
        let failed = self.is_failed();
        for synchronization in synchronizations {
            if failed {
                synchronization.on_failure(self);
            } else {
                synchronization.on_complete(self);
            }
        }
    }

    /// JSON view handed to expression languages.
    pub fn to_json(&self) -> JsonValue {
        let headers: JsonMap<String, JsonValue> = self
            .headers
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let properties: JsonMap<String, JsonValue> = self
            .properties
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        json!({
            "id": self.id,
            "body": self.body,
            "headers": headers,
            "properties": properties,
            "exception": self.exception.as_ref().map(ExchangeError::to_json),
        })
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("body", &self.body)
            .field("headers", &self.headers)
            .field("properties", &self.properties)
            .field("exception", &self.exception)
            .field("route_stop", &self.route_stop)
            .field("failure_handled", &self.failure_handled)
            .field("synchronizations", &self.synchronizations.len())
            .field("original", &self.original)
            .finish()
    }
}

/// Renders a JSON value as plain text; `None` for null.
pub fn json_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Bool(flag) => Some(flag.to_string()),
        JsonValue::Number(num) => Some(num.to_string()),
        other => Some(other.to_string()),
    }
}

/// JSON truthiness used for predicates.
pub fn is_truthy(value: &JsonValue) -> bool {
    !matches!(value, JsonValue::Null | JsonValue::Bool(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        completed: AtomicUsize,
        failed: AtomicUsize,
    }

    impl Synchronization for Counting {
        fn on_complete(&self, _exchange: &Exchange) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _exchange: &Exchange) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn copy_is_correlated_and_clean() {
        let mut parent = Exchange::new(json!({"a": 1})).with_header("h", "v");
        parent.set_exception(ExchangeError::raised("Boom", "x"));
        parent.set_route_stop(true);

        let copy = parent.copy();
        assert_ne!(copy.id(), parent.id());
        assert_eq!(copy.body(), parent.body());
        assert_eq!(copy.header("h"), Some(&json!("v")));
        assert_eq!(copy.property(CORRELATION_ID), Some(&json!(parent.id())));
        assert!(copy.exception().is_none());
        assert!(!copy.is_route_stop());
    }

    #[test]
    fn first_capture_wins_and_restores_message() {
        let mut exchange = Exchange::new(json!("in")).with_header("h", "v");
        assert!(!exchange.restore_original());

        exchange.capture_original();
        exchange.set_body("changed");
        exchange.remove_header("h");
        exchange.set_header("extra", 1);
        exchange.capture_original();

        assert_eq!(exchange.copy().original_message(), exchange.original_message());
        assert!(exchange.restore_original());
        assert_eq!(exchange.body(), &json!("in"));
        assert_eq!(exchange.header("h"), Some(&json!("v")));
        assert_eq!(exchange.header("extra"), None);
    }

    #[test]
    fn done_dispatches_on_failure_state() {
        let sync = Arc::new(Counting::default());
        let mut exchange = Exchange::new(JsonValue::Null);
        exchange.add_synchronization(sync.clone());
        exchange.set_exception(ExchangeError::raised("Boom", "x"));
        exchange.done();
        exchange.done();

        assert_eq!(sync.failed.load(Ordering::SeqCst), 1);
        assert_eq!(sync.completed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn truthiness_and_text() {
        assert!(!is_truthy(&JsonValue::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!(0)));
        assert_eq!(json_to_text(&json!(12)).as_deref(), Some("12"));
        assert_eq!(json_to_text(&JsonValue::Null), None);
    }
}
