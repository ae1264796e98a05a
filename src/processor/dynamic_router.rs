use super::routing_slip::HopDelivery;
use super::Processor;
use crate::exchange::{Exchange, ExchangeError, DYNAMIC_ROUTER_HOPS};
use crate::expression::SharedExpression;
use async_trait::async_trait;

/// Re-evaluates its expression after every hop until it yields no destination.
pub struct DynamicRouterProcessor {
    expression: SharedExpression,
    delimiter: String,
    max_hops: Option<u32>,
    delivery: HopDelivery,
}

impl DynamicRouterProcessor {
    pub fn new(
        expression: SharedExpression,
        delimiter: String,
        max_hops: Option<u32>,
        delivery: HopDelivery,
    ) -> Self {
        Self {
            expression,
            delimiter,
            max_hops,
            delivery,
        }
    }
}

#[async_trait]
impl Processor for DynamicRouterProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let mut hops: u32 = 0;
        loop {
            exchange.set_property(DYNAMIC_ROUTER_HOPS, hops);
            let uris = self
                .delivery
                .destinations(&self.expression, &self.delimiter, exchange)
                .await?;
            if uris.is_empty() {
                return Ok(());
            }
            for uri in uris {
                if exchange.is_route_stop() {
                    return Ok(());
                }
                if let Some(max_hops) = self.max_hops {
                    if hops >= max_hops {
                        return Err(ExchangeError::raised(
                            "DynamicRouterMaxHops",
                            format!("dynamic router exceeded {max_hops} hops"),
                        ));
                    }
                }
                self.delivery.deliver(&uri, exchange).await?;
                hops += 1;
            }
            if exchange.is_route_stop() {
                return Ok(());
            }
        }
    }
}
