use super::{Processor, SharedProcessor};
use crate::exchange::{Exchange, ExchangeError};
use async_trait::async_trait;

/// Runs its children in order on the same exchange. A failure or a stop
/// request ends the pipeline early.
pub struct Pipeline {
    outputs: Vec<SharedProcessor>,
}

impl Pipeline {
    pub fn new(outputs: Vec<SharedProcessor>) -> Self {
        Self { outputs }
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        for output in &self.outputs {
            if exchange.is_route_stop() {
                break;
            }
            output.process(exchange).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor_fn;
    use serde_json::json;

    #[tokio::test]
    async fn stop_skips_remaining_outputs() {
        let pipeline = Pipeline::new(vec![
            processor_fn(|exchange| {
                exchange.set_body(json!("first"));
                exchange.set_route_stop(true);
                Ok(())
            }),
            processor_fn(|exchange| {
                exchange.set_body(json!("second"));
                Ok(())
            }),
        ]);
        let mut exchange = Exchange::new(json!(null));
        pipeline.process(&mut exchange).await.expect("pipeline");
        assert_eq!(exchange.body(), &json!("first"));
    }
}
