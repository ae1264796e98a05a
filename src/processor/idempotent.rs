use super::{Processor, SharedProcessor};
use crate::exchange::{json_to_text, Exchange, ExchangeError, Synchronization, DUPLICATE_MESSAGE};
use crate::expression::SharedExpression;
use crate::idempotent::SharedIdempotentRepository;
use crate::metrics::metrics;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct IdempotentSettings {
    pub eager: bool,
    pub completion_eager: bool,
    pub skip_duplicate: bool,
    pub remove_on_failure: bool,
}

impl Default for IdempotentSettings {
    fn default() -> Self {
        Self {
            eager: true,
            completion_eager: false,
            skip_duplicate: true,
            remove_on_failure: true,
        }
    }
}

/// Settles the key once the unit of work of the exchange is done.
struct SettleKey {
    repository: SharedIdempotentRepository,
    key: String,
    settings: IdempotentSettings,
}

impl SettleKey {
    fn completed(&self) {
        if !self.settings.eager {
            self.repository.add(&self.key);
        }
        self.repository.confirm(&self.key);
    }

    fn failed(&self) {
        if self.settings.eager && self.settings.remove_on_failure {
            self.repository.remove(&self.key);
        }
    }
}

impl Synchronization for SettleKey {
    fn on_complete(&self, _exchange: &Exchange) {
        self.completed();
    }

    fn on_failure(&self, _exchange: &Exchange) {
        self.failed();
    }
}

pub struct IdempotentConsumerProcessor {
    route: Arc<str>,
    node: String,
    expression: SharedExpression,
    repository: SharedIdempotentRepository,
    settings: IdempotentSettings,
    output: SharedProcessor,
}

impl IdempotentConsumerProcessor {
    pub fn new(
        route: Arc<str>,
        node: String,
        expression: SharedExpression,
        repository: SharedIdempotentRepository,
        settings: IdempotentSettings,
        output: SharedProcessor,
    ) -> Self {
        Self {
            route,
            node,
            expression,
            repository,
            settings,
            output,
        }
    }
}

#[async_trait]
impl Processor for IdempotentConsumerProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let value = self.expression.evaluate(exchange)?;
        let key = json_to_text(&value).ok_or_else(|| {
            ExchangeError::raised(
                "NoMessageIdException",
                format!("no message id evaluated by `{}`", self.expression.describe()),
            )
        })?;

        let is_new = if self.settings.eager {
            self.repository.add(&key)
        } else {
            !self.repository.contains(&key)
        };
        if !is_new {
            exchange.set_property(DUPLICATE_MESSAGE, true);
            metrics().inc_idempotent_duplicate();
            crate::route_event!(
                debug,
                "courier::idempotent",
                "duplicate_message",
                route = self.route,
                node = self.node,
                key = key,
                skipped = self.settings.skip_duplicate,
            );
            if self.settings.skip_duplicate {
                return Ok(());
            }
            return self.output.process(exchange).await;
        }

        let settle = SettleKey {
            repository: self.repository.clone(),
            key,
            settings: self.settings,
        };
        if !self.settings.completion_eager {
            exchange.add_synchronization(Arc::new(settle));
            return self.output.process(exchange).await;
        }

        let result = self.output.process(exchange).await;
        match &result {
            Ok(()) => settle.completed(),
            Err(_) => settle.failed(),
        }
        result
    }
}
