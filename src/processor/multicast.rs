use super::fanout::{Branch, BranchTarget, FanOut};
use super::{Processor, SharedProcessor};
use crate::exchange::{Exchange, ExchangeError, MULTICAST_COMPLETE, MULTICAST_INDEX};
use async_trait::async_trait;

/// Sends a copy of the exchange to every child and aggregates the replies.
pub struct MulticastProcessor {
    fanout: FanOut,
    outputs: Vec<SharedProcessor>,
}

impl MulticastProcessor {
    pub fn new(fanout: FanOut, outputs: Vec<SharedProcessor>) -> Self {
        Self { fanout, outputs }
    }
}

#[async_trait]
impl Processor for MulticastProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let total = self.outputs.len();
        let branches = self
            .outputs
            .iter()
            .enumerate()
            .map(|(index, output)| {
                let mut sub = exchange.copy();
                sub.set_property(MULTICAST_INDEX, index);
                sub.set_property(MULTICAST_COMPLETE, index + 1 == total);
                Branch {
                    exchange: sub,
                    target: BranchTarget::Processor(output.clone()),
                }
            })
            .collect();
        self.fanout.run(exchange, branches).await
    }
}
