//! Saga services and the in-memory coordinator.
//!
//! A coordinator moves through `Active -> Completed` or
//! `Active -> Compensating -> Compensated`. Completion and compensation call
//! the endpoints each step registered, with the step's evaluated options as
//! headers.

use crate::endpoint::{Component, Endpoint, EndpointRegistry, SharedEndpoint};
use crate::exchange::{json_to_text, Exchange, ExchangeError, SAGA_ID};
use crate::expression::SharedExpression;
use crate::metrics::metrics;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStatus {
    Active,
    Completed,
    Compensating,
    Compensated,
}

/// Completion and compensation actions declared by one saga node.
#[derive(Debug)]
pub struct SagaStep {
    pub compensation: Option<String>,
    pub completion: Option<String>,
    pub options: BTreeMap<String, SharedExpression>,
    pub timeout: Option<Duration>,
}

#[async_trait]
pub trait SagaCoordinator: Send + Sync {
    fn id(&self) -> &str;

    fn status(&self) -> SagaStatus;

    /// Enlists `step`, evaluating its options against `exchange`.
    async fn begin_step(&self, exchange: &Exchange, step: Arc<SagaStep>) -> Result<(), ExchangeError>;

    async fn complete(&self) -> Result<(), ExchangeError>;

    async fn compensate(&self) -> Result<(), ExchangeError>;
}

pub type SharedSagaCoordinator = Arc<dyn SagaCoordinator>;

#[async_trait]
pub trait SagaService: Send + Sync {
    async fn new_saga(&self) -> Result<SharedSagaCoordinator, ExchangeError>;

    async fn get_saga(&self, id: &str) -> Result<Option<SharedSagaCoordinator>, ExchangeError>;

    /// Called when the route holding a saga node is built. `key` names the
    /// node within its route; rebuilding the route replaces the step
    /// registered under the same key.
    fn register_step(&self, key: &str, step: Arc<SagaStep>) -> Result<(), ExchangeError>;
}

pub type SharedSagaService = Arc<dyn SagaService>;

struct EnlistedStep {
    step: Arc<SagaStep>,
    options: BTreeMap<String, JsonValue>,
}

struct SagaState {
    status: SagaStatus,
    steps: Vec<EnlistedStep>,
}

type SagaTable = Mutex<HashMap<String, Arc<InMemorySagaCoordinator>>>;

pub struct InMemorySagaCoordinator {
    id: String,
    endpoints: Arc<EndpointRegistry>,
    state: Mutex<SagaState>,
    me: Weak<InMemorySagaCoordinator>,
    table: Weak<SagaTable>,
}

impl InMemorySagaCoordinator {
    fn new(endpoints: Arc<EndpointRegistry>, table: Weak<SagaTable>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: Uuid::new_v4().to_string(),
            endpoints,
            state: Mutex::new(SagaState {
                status: SagaStatus::Active,
                steps: Vec::new(),
            }),
            me: me.clone(),
            table,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SagaState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Drops the service's reference once the saga is settled.
    fn release(&self) {
        if let Some(table) = self.table.upgrade() {
            table
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .remove(&self.id);
        }
    }

    /// Moves `Active` to `next`; `Ok(false)` when the saga already reached
    /// `settled` and the call is a repeat.
    fn transition(&self, next: SagaStatus, settled: &[SagaStatus]) -> Result<bool, ExchangeError> {
        let mut state = self.lock();
        if settled.contains(&state.status) {
            return Ok(false);
        }
        if state.status != SagaStatus::Active {
            return Err(ExchangeError::Saga {
                reason: format!("saga {} is {:?} and cannot move to {:?}", self.id, state.status, next),
            });
        }
        state.status = next;
        Ok(true)
    }

    fn set_status(&self, status: SagaStatus) {
        self.lock().status = status;
    }

    /// Calls `uri` for each step in `order`, returning the first failure.
    async fn invoke_all(&self, calls: Vec<(String, BTreeMap<String, JsonValue>)>) -> Result<(), ExchangeError> {
        let mut first_failure = None;
        for (uri, options) in calls {
            if let Err(err) = self.invoke(&uri, options).await {
                tracing::warn!(
                    target: "courier::saga",
                    event = "saga_endpoint_failed",
                    saga_id = %self.id,
                    uri = %uri,
                    error = %err,
                );
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn invoke(&self, uri: &str, options: BTreeMap<String, JsonValue>) -> Result<(), ExchangeError> {
        let endpoint = self.endpoints.resolve(uri)?;
        let mut exchange = Exchange::new(JsonValue::Null);
        exchange.set_header(SAGA_ID, self.id.clone());
        for (name, value) in options {
            exchange.set_header(name, value);
        }
        endpoint.send(&mut exchange).await?;
        match exchange.take_exception() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn calls(&self, select: fn(&SagaStep) -> Option<&String>, reverse: bool) -> Vec<(String, BTreeMap<String, JsonValue>)> {
        let state = self.lock();
        let mut calls: Vec<_> = state
            .steps
            .iter()
            .filter_map(|enlisted| select(&enlisted.step).map(|uri| (uri.clone(), enlisted.options.clone())))
            .collect();
        if reverse {
            calls.reverse();
        }
        calls
    }

    fn schedule_timeout(&self, timeout: Duration) {
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(coordinator) = me.upgrade() else {
                return;
            };
            if coordinator.status() != SagaStatus::Active {
                return;
            }
            tracing::warn!(
                target: "courier::saga",
                event = "saga_timed_out",
                saga_id = %coordinator.id,
                timeout_ms = timeout.as_millis() as u64,
            );
            if let Err(err) = coordinator.compensate().await {
                tracing::error!(
                    target: "courier::saga",
                    event = "saga_timeout_compensation_failed",
                    saga_id = %coordinator.id,
                    error = %err,
                );
            }
        });
    }
}

#[async_trait]
impl SagaCoordinator for InMemorySagaCoordinator {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> SagaStatus {
        self.lock().status
    }

    async fn begin_step(&self, exchange: &Exchange, step: Arc<SagaStep>) -> Result<(), ExchangeError> {
        let mut options = BTreeMap::new();
        for (name, expression) in &step.options {
            options.insert(name.clone(), expression.evaluate(exchange)?);
        }
        let timeout = step.timeout;
        {
            let mut state = self.lock();
            if state.status != SagaStatus::Active {
                return Err(ExchangeError::Saga {
                    reason: format!("saga {} is {:?} and cannot enlist steps", self.id, state.status),
                });
            }
            state.steps.push(EnlistedStep { step, options });
        }
        if let Some(timeout) = timeout {
            self.schedule_timeout(timeout);
        }
        Ok(())
    }

    async fn complete(&self) -> Result<(), ExchangeError> {
        if !self.transition(SagaStatus::Completed, &[SagaStatus::Completed])? {
            return Ok(());
        }
        self.release();
        let calls = self.calls(|step| step.completion.as_ref(), false);
        metrics().inc_saga_completed();
        tracing::debug!(target: "courier::saga", event = "saga_completed", saga_id = %self.id, steps = calls.len());
        self.invoke_all(calls).await
    }

    async fn compensate(&self) -> Result<(), ExchangeError> {
        if !self.transition(
            SagaStatus::Compensating,
            &[SagaStatus::Compensating, SagaStatus::Compensated],
        )? {
            return Ok(());
        }
        let calls = self.calls(|step| step.compensation.as_ref(), true);
        tracing::info!(target: "courier::saga", event = "saga_compensating", saga_id = %self.id, steps = calls.len());
        let result = self.invoke_all(calls).await;
        self.set_status(SagaStatus::Compensated);
        self.release();
        metrics().inc_saga_compensated();
        result
    }
}

/// Saga service keeping coordinators in memory while they are active.
///
/// Completed and compensated sagas are dropped from the service; callers
/// still holding a coordinator can read its final status.
pub struct InMemorySagaService {
    endpoints: Arc<EndpointRegistry>,
    sagas: Arc<SagaTable>,
    steps: Mutex<HashMap<String, Arc<SagaStep>>>,
}

impl InMemorySagaService {
    pub fn new(endpoints: Arc<EndpointRegistry>) -> Self {
        Self {
            endpoints,
            sagas: Arc::new(Mutex::new(HashMap::new())),
            steps: Mutex::new(HashMap::new()),
        }
    }

    pub fn registered_steps(&self) -> usize {
        self.steps.lock().unwrap_or_else(|err| err.into_inner()).len()
    }

    /// Sagas started and not yet settled.
    pub fn active_sagas(&self) -> usize {
        self.sagas.lock().unwrap_or_else(|err| err.into_inner()).len()
    }
}

#[async_trait]
impl SagaService for InMemorySagaService {
    async fn new_saga(&self) -> Result<SharedSagaCoordinator, ExchangeError> {
        let coordinator = InMemorySagaCoordinator::new(self.endpoints.clone(), Arc::downgrade(&self.sagas));
        self.sagas
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(coordinator.id.clone(), coordinator.clone());
        Ok(coordinator)
    }

    async fn get_saga(&self, id: &str) -> Result<Option<SharedSagaCoordinator>, ExchangeError> {
        Ok(self
            .sagas
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(id)
            .cloned()
            .map(|coordinator| coordinator as SharedSagaCoordinator))
    }

    fn register_step(&self, key: &str, step: Arc<SagaStep>) -> Result<(), ExchangeError> {
        self.steps
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(key.to_string(), step);
        Ok(())
    }
}

/// `saga:complete` and `saga:compensate` act on the saga named by the
/// exchange's `saga_id` header; used with manual completion.
pub struct SagaComponent {
    service: SharedSagaService,
}

impl SagaComponent {
    pub fn new(service: SharedSagaService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Clone, Copy)]
enum SagaAction {
    Complete,
    Compensate,
}

impl Component for SagaComponent {
    fn create_endpoint(&self, uri: &str, remaining: &str) -> Result<SharedEndpoint, String> {
        let action = match remaining.trim() {
            "complete" => SagaAction::Complete,
            "compensate" => SagaAction::Compensate,
            other => return Err(format!("unknown saga action `{other}`")),
        };
        Ok(Arc::new(SagaEndpoint {
            uri: uri.to_string(),
            action,
            service: self.service.clone(),
        }))
    }
}

struct SagaEndpoint {
    uri: String,
    action: SagaAction,
    service: SharedSagaService,
}

#[async_trait]
impl Endpoint for SagaEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let id = exchange
            .header(SAGA_ID)
            .and_then(json_to_text)
            .ok_or_else(|| ExchangeError::Saga {
                reason: "exchange is not part of a saga".to_string(),
            })?;
        let coordinator = self.service.get_saga(&id).await?.ok_or_else(|| ExchangeError::Saga {
            reason: format!("unknown saga {id}"),
        })?;
        match self.action {
            SagaAction::Complete => coordinator.complete().await,
            SagaAction::Compensate => coordinator.compensate().await,
        }
    }
}
