//! Executable processors produced by reification.

pub mod basic;
pub mod channel;
pub mod choice;
pub mod dynamic_router;
pub mod enrich;
pub mod fanout;
pub mod idempotent;
pub mod multicast;
pub mod on_completion;
pub mod pipeline;
pub mod recipient_list;
pub mod routing_slip;
pub mod saga;
pub mod splitter;
pub mod threads;
pub mod throttle;

use crate::exchange::{Exchange, ExchangeError};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Processor: Send + Sync {
    /// Processes `exchange` in place. A returned error is the failure of this
    /// node; it is not also stored on the exchange.
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError>;
}

pub type SharedProcessor = Arc<dyn Processor>;

impl std::fmt::Debug for dyn Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Processor")
    }
}

#[async_trait]
impl<P> Processor for Arc<P>
where
    P: Processor + ?Sized,
{
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        (**self).process(exchange).await
    }
}

struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), ExchangeError> + Send + Sync,
{
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        (self.f)(exchange)
    }
}

/// Wraps a synchronous closure as a processor.
pub fn processor_fn<F>(f: F) -> SharedProcessor
where
    F: Fn(&mut Exchange) -> Result<(), ExchangeError> + Send + Sync + 'static,
{
    Arc::new(FnProcessor { f })
}

/// Moves a failure stored on `exchange` into the returned result.
pub(crate) fn take_failure(exchange: &mut Exchange) -> Result<(), ExchangeError> {
    match exchange.take_exception() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
