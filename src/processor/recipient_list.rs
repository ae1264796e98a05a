use super::fanout::{Branch, BranchTarget, FanOut};
use super::{Processor, SharedProcessor};
use crate::endpoint::{EndpointCache, SharedEndpoint};
use crate::exchange::{json_to_text, Exchange, ExchangeError, RECIPIENT_LIST_ENDPOINT};
use crate::expression::SharedExpression;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

const RECIPIENTS: &str = "recipient_list_recipients";

/// Destination URIs from an evaluated value: array elements, or a string split
/// on `delimiter`. Blank entries are dropped.
pub fn destinations(value: &JsonValue, delimiter: &str) -> Vec<String> {
    let parts: Vec<String> = match value {
        JsonValue::Null => Vec::new(),
        JsonValue::Array(items) => items.iter().filter_map(json_to_text).collect(),
        JsonValue::String(text) => text.split(delimiter).map(str::to_string).collect(),
        other => json_to_text(other).into_iter().collect(),
    };
    parts
        .into_iter()
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Evaluates the recipients and stores them on the exchange. Runs under the
/// route's error handler so evaluation failures are recoverable.
pub struct EvaluateRecipients {
    expression: SharedExpression,
}

impl EvaluateRecipients {
    pub fn new(expression: SharedExpression) -> Self {
        Self { expression }
    }
}

#[async_trait]
impl Processor for EvaluateRecipients {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let value = self.expression.evaluate(exchange)?;
        exchange.set_property(RECIPIENTS, value);
        Ok(())
    }
}

/// Sends a copy to every evaluated recipient under its own failure policy.
pub struct RecipientListProcessor {
    evaluation: SharedProcessor,
    delimiter: String,
    ignore_invalid_endpoints: bool,
    cache: Arc<EndpointCache>,
    fanout: FanOut,
}

impl RecipientListProcessor {
    pub fn new(
        evaluation: SharedProcessor,
        delimiter: String,
        ignore_invalid_endpoints: bool,
        cache: Arc<EndpointCache>,
        fanout: FanOut,
    ) -> Self {
        Self {
            evaluation,
            delimiter,
            ignore_invalid_endpoints,
            cache,
            fanout,
        }
    }

    fn resolve(&self, uris: Vec<String>) -> Result<Vec<SharedEndpoint>, ExchangeError> {
        let mut endpoints = Vec::with_capacity(uris.len());
        for uri in uris {
            match self.cache.resolve(&uri) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(err) if self.ignore_invalid_endpoints => {
                    tracing::debug!(
                        target: "courier::recipient_list",
                        event = "invalid_endpoint_ignored",
                        route = %self.fanout.settings().route,
                        uri = %uri,
                        error = %err,
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(endpoints)
    }
}

#[async_trait]
impl Processor for RecipientListProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        self.evaluation.process(exchange).await?;
        if exchange.is_route_stop() {
            exchange.remove_property(RECIPIENTS);
            return Ok(());
        }
        let value = exchange.remove_property(RECIPIENTS).unwrap_or(JsonValue::Null);
        let endpoints = self.resolve(destinations(&value, &self.delimiter))?;

        let branches = endpoints
            .into_iter()
            .map(|endpoint| {
                let mut sub = exchange.copy();
                sub.set_property(RECIPIENT_LIST_ENDPOINT, endpoint.uri().to_string());
                Branch {
                    exchange: sub,
                    target: BranchTarget::Endpoint(endpoint),
                }
            })
            .collect();
        self.fanout.run(exchange, branches).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn destinations_from_strings_and_arrays() {
        assert_eq!(
            destinations(&json!("direct:a, direct:b,"), ","),
            vec!["direct:a", "direct:b"]
        );
        assert_eq!(
            destinations(&json!(["direct:a", null, "direct:b"]), ","),
            vec!["direct:a", "direct:b"]
        );
        assert!(destinations(&JsonValue::Null, ",").is_empty());
        assert!(destinations(&json!("  "), ",").is_empty());
    }
}
