use super::recipient_list::destinations;
use super::Processor;
use crate::endpoint::{send_to, EndpointCache, SharedEndpoint};
use crate::errorhandler::ErrorHandler;
use crate::exchange::{Exchange, ExchangeError, SLIP_ENDPOINT};
use crate::expression::SharedExpression;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

const HOP_DESTINATIONS: &str = "hop_destinations";

/// Evaluates the destination expression into a transient property so the
/// evaluation can run under the error handler.
struct EvaluateDestinations {
    expression: SharedExpression,
}

#[async_trait]
impl Processor for EvaluateDestinations {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let value = self.expression.evaluate(exchange)?;
        exchange.set_property(HOP_DESTINATIONS, value);
        Ok(())
    }
}

/// One delivery to a resolved slip or router destination.
struct Hop {
    endpoint: SharedEndpoint,
}

#[async_trait]
impl Processor for Hop {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        send_to(&self.endpoint, exchange).await
    }
}

/// Destination resolution and delivery shared by routing slip and dynamic router.
pub struct HopDelivery {
    pub route: Arc<str>,
    pub node: String,
    pub cache: Arc<EndpointCache>,
    pub ignore_invalid_endpoints: bool,
    /// Wraps every hop; absent when the route disables error handling.
    pub handler: Option<Arc<ErrorHandler>>,
}

impl HopDelivery {
    /// Evaluates `expression` into destination URIs under the error handler.
    /// A handled or continued evaluation failure yields no destinations.
    pub async fn destinations(
        &self,
        expression: &SharedExpression,
        delimiter: &str,
        exchange: &mut Exchange,
    ) -> Result<Vec<String>, ExchangeError> {
        let evaluate = EvaluateDestinations {
            expression: expression.clone(),
        };
        let outcome = match &self.handler {
            Some(handler) => handler.run(&evaluate, exchange).await,
            None => evaluate.process(exchange).await,
        };
        let value = exchange.remove_property(HOP_DESTINATIONS).unwrap_or(JsonValue::Null);
        outcome?;
        Ok(destinations(&value, delimiter))
    }

    /// `Ok(false)` when the destination was invalid and skipped.
    pub async fn deliver(&self, uri: &str, exchange: &mut Exchange) -> Result<bool, ExchangeError> {
        let endpoint = match self.cache.resolve(uri) {
            Ok(endpoint) => endpoint,
            Err(err) if self.ignore_invalid_endpoints => {
                crate::route_event!(
                    debug,
                    "courier::routing_slip",
                    "invalid_endpoint_ignored",
                    route = self.route,
                    node = self.node,
                    uri = uri,
                    error = err,
                );
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        exchange.set_property(SLIP_ENDPOINT, uri.to_string());
        let hop = Hop { endpoint };
        match &self.handler {
            Some(handler) => handler.run(&hop, exchange).await?,
            None => hop.process(exchange).await?,
        }
        Ok(true)
    }
}

/// Visits destinations computed once, in order.
pub struct RoutingSlipProcessor {
    expression: SharedExpression,
    delimiter: String,
    delivery: HopDelivery,
}

impl RoutingSlipProcessor {
    pub fn new(expression: SharedExpression, delimiter: String, delivery: HopDelivery) -> Self {
        Self {
            expression,
            delimiter,
            delivery,
        }
    }
}

#[async_trait]
impl Processor for RoutingSlipProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let uris = self
            .delivery
            .destinations(&self.expression, &self.delimiter, exchange)
            .await?;
        for uri in uris {
            if exchange.is_route_stop() {
                break;
            }
            self.delivery.deliver(&uri, exchange).await?;
        }
        Ok(())
    }
}
