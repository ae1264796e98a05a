use super::{Processor, SharedProcessor};
use crate::definition::{SagaCompletionMode, SagaPropagation};
use crate::exchange::{json_to_text, Exchange, ExchangeError, SAGA_ID};
use crate::saga::{SagaStep, SharedSagaCoordinator, SharedSagaService};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Runs the child chain as a step of a saga chosen by the propagation mode.
pub struct SagaProcessor {
    route: Arc<str>,
    node: String,
    service: SharedSagaService,
    step: Arc<SagaStep>,
    propagation: SagaPropagation,
    completion_mode: SagaCompletionMode,
    output: SharedProcessor,
}

impl SagaProcessor {
    pub fn new(
        route: Arc<str>,
        node: String,
        service: SharedSagaService,
        step: Arc<SagaStep>,
        propagation: SagaPropagation,
        completion_mode: SagaCompletionMode,
        output: SharedProcessor,
    ) -> Self {
        Self {
            route,
            node,
            service,
            step,
            propagation,
            completion_mode,
            output,
        }
    }

    async fn current(&self, exchange: &Exchange) -> Result<Option<SharedSagaCoordinator>, ExchangeError> {
        match exchange.header(SAGA_ID).and_then(json_to_text) {
            Some(id) => self.service.get_saga(&id).await,
            None => Ok(None),
        }
    }

    /// The saga to enlist in and whether this node created it.
    async fn select(
        &self,
        current: Option<SharedSagaCoordinator>,
    ) -> Result<Option<(SharedSagaCoordinator, bool)>, ExchangeError> {
        let selected = match (self.propagation, current) {
            (SagaPropagation::Required, Some(saga))
            | (SagaPropagation::Mandatory, Some(saga))
            | (SagaPropagation::Supports, Some(saga)) => Some((saga, false)),
            (SagaPropagation::Required, None) | (SagaPropagation::RequiresNew, _) => {
                Some((self.service.new_saga().await?, true))
            }
            (SagaPropagation::Mandatory, None) => {
                return Err(ExchangeError::Saga {
                    reason: "mandatory saga propagation without an active saga".to_string(),
                })
            }
            (SagaPropagation::Never, Some(saga)) => {
                return Err(ExchangeError::Saga {
                    reason: format!("saga {} is active but propagation is never", saga.id()),
                })
            }
            (SagaPropagation::Supports, None)
            | (SagaPropagation::NotSupported, _)
            | (SagaPropagation::Never, None) => None,
        };
        Ok(selected)
    }

    async fn settle(
        &self,
        saga: &SharedSagaCoordinator,
        created: bool,
        result: Result<(), ExchangeError>,
    ) -> Result<(), ExchangeError> {
        match result {
            Err(err) => {
                crate::route_event!(
                    info,
                    "courier::saga",
                    "saga_step_failed",
                    route = self.route,
                    node = self.node,
                    saga_id = saga.id(),
                    error = err,
                );
                match saga.compensate().await {
                    Ok(()) => Err(err),
                    Err(cause) => Err(ExchangeError::fatal(err, cause)),
                }
            }
            Ok(()) if created && self.completion_mode == SagaCompletionMode::Auto => saga.complete().await,
            Ok(()) => Ok(()),
        }
    }
}

#[async_trait]
impl Processor for SagaProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let outer_header = exchange.header(SAGA_ID).cloned();
        let current = self.current(exchange).await?;
        let Some((saga, created)) = self.select(current).await? else {
            exchange.remove_header(SAGA_ID);
            let result = self.output.process(exchange).await;
            restore_header(exchange, outer_header);
            return result;
        };

        saga.begin_step(exchange, self.step.clone()).await?;
        exchange.set_header(SAGA_ID, saga.id().to_string());
        let result = self.output.process(exchange).await;
        let settled = self.settle(&saga, created, result).await;
        if self.propagation == SagaPropagation::RequiresNew {
            restore_header(exchange, outer_header);
        }
        settled
    }
}

fn restore_header(exchange: &mut Exchange, header: Option<JsonValue>) {
    match header {
        Some(value) => exchange.set_header(SAGA_ID, value),
        None => {
            exchange.remove_header(SAGA_ID);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointRegistry;
    use crate::processor::processor_fn;
    use crate::saga::{InMemorySagaService, SagaService, SagaStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn saga_node(
        service: SharedSagaService,
        propagation: SagaPropagation,
        output: SharedProcessor,
    ) -> SagaProcessor {
        SagaProcessor::new(
            Arc::from("orders"),
            "saga1".into(),
            service,
            Arc::new(SagaStep {
                compensation: None,
                completion: None,
                options: BTreeMap::new(),
                timeout: None,
            }),
            propagation,
            SagaCompletionMode::Auto,
            output,
        )
    }

    fn in_memory() -> Arc<InMemorySagaService> {
        Arc::new(InMemorySagaService::new(Arc::new(EndpointRegistry::default())))
    }

    #[tokio::test]
    async fn required_creates_and_completes() {
        let service = in_memory();
        let node = saga_node(service.clone(), SagaPropagation::Required, processor_fn(|_| Ok(())));
        let mut exchange = Exchange::new(json!(null));
        node.process(&mut exchange).await.expect("saga");

        let id = exchange.header(SAGA_ID).and_then(json_to_text).expect("saga id");
        assert!(service.get_saga(&id).await.unwrap().is_none(), "completed saga is released");
        assert_eq!(service.active_sagas(), 0);
    }

    #[tokio::test]
    async fn manual_completion_keeps_the_saga_active() {
        let service = in_memory();
        let mut node = saga_node(service.clone(), SagaPropagation::Required, processor_fn(|_| Ok(())));
        node.completion_mode = SagaCompletionMode::Manual;
        let mut exchange = Exchange::new(json!(null));
        node.process(&mut exchange).await.expect("saga");

        let id = exchange.header(SAGA_ID).and_then(json_to_text).expect("saga id");
        let saga = service.get_saga(&id).await.unwrap().expect("still active");
        assert_eq!(saga.status(), SagaStatus::Active);
        saga.complete().await.expect("completed");
        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(service.active_sagas(), 0);
    }

    #[tokio::test]
    async fn failure_compensates() {
        let service = in_memory();
        let node = saga_node(
            service.clone(),
            SagaPropagation::Required,
            processor_fn(|_| Err(ExchangeError::raised("IoError", "down"))),
        );
        let mut exchange = Exchange::new(json!(null));
        let err = node.process(&mut exchange).await.unwrap_err();
        assert_eq!(err.kind(), "IoError");

        let id = exchange.header(SAGA_ID).and_then(json_to_text).expect("saga id");
        assert!(service.get_saga(&id).await.unwrap().is_none(), "compensated saga is released");
        assert_eq!(service.active_sagas(), 0);
    }

    #[tokio::test]
    async fn mandatory_requires_active_saga() {
        let service: SharedSagaService = Arc::new(InMemorySagaService::new(Arc::new(EndpointRegistry::default())));
        let node = saga_node(service, SagaPropagation::Mandatory, processor_fn(|_| Ok(())));
        let mut exchange = Exchange::new(json!(null));
        let err = node.process(&mut exchange).await.unwrap_err();
        assert_eq!(err.kind(), "SagaError");
    }
}
