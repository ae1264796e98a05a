use super::{take_failure, Processor};
use crate::aggregation::SharedAggregationStrategy;
use crate::endpoint::{send_to, EndpointCache};
use crate::exchange::{json_to_text, Exchange, ExchangeError};
use crate::expression::SharedExpression;
use async_trait::async_trait;
use std::sync::Arc;

/// Calls a resource endpoint with a copy and merges the reply into the exchange.
pub struct EnrichProcessor {
    route: Arc<str>,
    node: String,
    expression: SharedExpression,
    strategy: SharedAggregationStrategy,
    cache: Arc<EndpointCache>,
    aggregate_on_exception: bool,
    ignore_invalid_endpoint: bool,
    share_unit_of_work: bool,
}

pub struct EnrichSettings {
    pub aggregate_on_exception: bool,
    pub ignore_invalid_endpoint: bool,
    pub share_unit_of_work: bool,
}

impl EnrichProcessor {
    pub fn new(
        route: Arc<str>,
        node: String,
        expression: SharedExpression,
        strategy: SharedAggregationStrategy,
        cache: Arc<EndpointCache>,
        settings: EnrichSettings,
    ) -> Self {
        Self {
            route,
            node,
            expression,
            strategy,
            cache,
            aggregate_on_exception: settings.aggregate_on_exception,
            ignore_invalid_endpoint: settings.ignore_invalid_endpoint,
            share_unit_of_work: settings.share_unit_of_work,
        }
    }
}

#[async_trait]
impl Processor for EnrichProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let value = self.expression.evaluate(exchange)?;
        let Some(uri) = json_to_text(&value).filter(|uri| !uri.trim().is_empty()) else {
            return Err(ExchangeError::NoSuchEndpoint { uri: String::new() });
        };
        let endpoint = match self.cache.resolve(&uri) {
            Ok(endpoint) => endpoint,
            Err(err) if self.ignore_invalid_endpoint => {
                crate::route_event!(
                    debug,
                    "courier::enrich",
                    "invalid_endpoint_ignored",
                    route = self.route,
                    node = self.node,
                    uri = uri,
                    error = err,
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let mut resource = exchange.copy();
        if let Err(err) = send_to(&endpoint, &mut resource).await {
            resource.set_exception(err);
        }
        if self.share_unit_of_work {
            resource.handover_synchronizations(exchange);
        } else {
            resource.done();
        }

        if let Some(err) = resource.exception().cloned() {
            if !self.aggregate_on_exception {
                return Err(err);
            }
        }
        let original = exchange.clone();
        let merged = self.strategy.aggregate(Some(original), resource)?;
        exchange.copy_results_from(&merged);
        take_failure(exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{aggregation_fn, UseLatestAggregationStrategy};
    use crate::endpoint::{DirectComponent, DirectConsumers, EndpointRegistry};
    use crate::expression::constant;
    use crate::processor::processor_fn;
    use serde_json::json;

    fn cache() -> Arc<EndpointCache> {
        let consumers = Arc::new(DirectConsumers::default());
        consumers.register(
            "direct:price",
            processor_fn(|exchange| {
                exchange.set_body(json!({"price": 12}));
                Ok(())
            }),
        );
        consumers.register(
            "direct:broken",
            processor_fn(|_| Err(ExchangeError::raised("IoError", "down"))),
        );
        let registry = EndpointRegistry::default();
        registry.add_component("direct", Arc::new(DirectComponent::new(consumers)));
        Arc::new(EndpointCache::new(Arc::new(registry), 8))
    }

    fn settings(aggregate_on_exception: bool) -> EnrichSettings {
        EnrichSettings {
            aggregate_on_exception,
            ignore_invalid_endpoint: false,
            share_unit_of_work: false,
        }
    }

    #[tokio::test]
    async fn merges_resource_reply() {
        let merge = aggregation_fn(|original, resource| {
            let mut original = original.expect("enrich passes the original");
            let price = resource.body()["price"].clone();
            original.body_mut()["price"] = price;
            Ok(original)
        });
        let enrich = EnrichProcessor::new(
            Arc::from("orders"),
            "enrich1".into(),
            constant("direct:price"),
            merge,
            cache(),
            settings(false),
        );
        let mut exchange = Exchange::new(json!({"item": "pen"}));
        enrich.process(&mut exchange).await.expect("enriched");
        assert_eq!(exchange.body(), &json!({"item": "pen", "price": 12}));
    }

    #[tokio::test]
    async fn resource_failure_propagates_unless_aggregated() {
        let enrich = EnrichProcessor::new(
            Arc::from("orders"),
            "enrich1".into(),
            constant("direct:broken"),
            Arc::new(UseLatestAggregationStrategy),
            cache(),
            settings(false),
        );
        let mut exchange = Exchange::new(json!("original"));
        let err = enrich.process(&mut exchange).await.unwrap_err();
        assert_eq!(err.kind(), "IoError");
        assert_eq!(exchange.body(), &json!("original"));
    }
}
