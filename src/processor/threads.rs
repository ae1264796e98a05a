use super::{Processor, SharedProcessor};
use crate::exchange::{Exchange, ExchangeError};
use crate::pool::PoolHandle;
use async_trait::async_trait;

/// Continues the child chain on a pool task and waits for it.
pub struct ThreadsProcessor {
    pool: PoolHandle,
    output: SharedProcessor,
}

impl ThreadsProcessor {
    pub fn new(pool: PoolHandle, output: SharedProcessor) -> Self {
        Self { pool, output }
    }
}

#[async_trait]
impl Processor for ThreadsProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let output = self.output.clone();
        let mut handed_off = exchange.clone();
        let task = self.pool.pool().submit(async move {
            let result = output.process(&mut handed_off).await;
            (handed_off, result)
        })?;
        let (finished, result) = task.await?;
        *exchange = finished;
        result
    }
}
