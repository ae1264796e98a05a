//! The engine: owns the registries, builds routes and drives their lifecycle.
//!
//! Routes consume `direct:` URIs. Starting a route reifies its definition
//! and registers the resulting consumer; stopping it unregisters the consumer,
//! waits for in-flight exchanges and shuts down the pools the route owns.

use crate::config::EngineConfig;
use crate::definition::param::resolve_placeholders;
use crate::definition::{
    ErrorHandlerDefinition, InterceptSendToEndpointDefinition, OnExceptionDefinition,
    ProcessorDefinition, RouteDefinition, RoutesDefinition, ShutdownRoute,
};
use crate::endpoint::{
    send_to, Component, DirectComponent, DirectConsumers, EndpointRegistry, LogComponent,
    SendInterceptor, SharedEndpoint, DIRECT_CONSUMER_NOT_AVAILABLE,
};
use crate::error::{BuildError, Error, Result};
use crate::exchange::{Exchange, ExchangeError};
use crate::expression::{Language, LanguageRegistry};
use crate::pool::{PoolHandle, ThreadPool, ThreadPoolManager};
use crate::registry::Registry;
use crate::reifier::{build_interceptor, build_route, BuildEnv, RouteContext};
use crate::route::{BuiltRoute, RouteConsumer, RouteStatus};
use crate::saga::{InMemorySagaService, SagaComponent, SharedSagaService};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::cmp::Reverse;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const INFLIGHT_POLL: Duration = Duration::from_millis(10);

struct RouteEntry {
    definition: RouteDefinition,
    status: RouteStatus,
    consumer: Option<Arc<RouteConsumer>>,
}

#[derive(Default)]
struct EngineState {
    started: bool,
    routes: Vec<RouteEntry>,
    context_clauses: Vec<OnExceptionDefinition>,
    default_error_handler: Option<ErrorHandlerDefinition>,
    interceptor_pools: Vec<PoolHandle>,
}

impl EngineState {
    fn entry(&self, route: &str) -> Option<&RouteEntry> {
        self.routes.iter().find(|entry| entry.definition.id == route)
    }

    fn entry_mut(&mut self, route: &str) -> Result<&mut RouteEntry, BuildError> {
        self.routes
            .iter_mut()
            .find(|entry| entry.definition.id == route)
            .ok_or_else(|| BuildError::UnknownRoute {
                route: route.to_string(),
            })
    }
}

enum SagaSetup {
    None,
    InMemory,
    Service(SharedSagaService),
}

pub struct CourierEngineBuilder {
    config: EngineConfig,
    registry: Arc<Registry>,
    languages: LanguageRegistry,
    endpoints: Arc<EndpointRegistry>,
    consumers: Arc<DirectConsumers>,
    pools: Vec<(String, Arc<ThreadPool>)>,
    saga: SagaSetup,
}

impl Default for CourierEngineBuilder {
    fn default() -> Self {
        let consumers = Arc::new(DirectConsumers::default());
        let endpoints = Arc::new(EndpointRegistry::default());
        endpoints.add_component("direct", Arc::new(DirectComponent::new(consumers.clone())));
        endpoints.add_component("log", Arc::new(LogComponent));
        Self {
            config: EngineConfig::default(),
            registry: Arc::new(Registry::new()),
            languages: LanguageRegistry::default(),
            endpoints,
            consumers,
            pools: Vec::new(),
            saga: SagaSetup::None,
        }
    }
}

impl CourierEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// Binds a bean (processor, aggregation strategy, repository, policy)
    /// under `name` for lookup by `*_ref` options.
    pub fn bind<T>(self, name: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.registry.bind(name, value);
        self
    }

    pub fn language(mut self, language: Arc<dyn Language>) -> Self {
        self.languages.register(language);
        self
    }

    pub fn component(self, scheme: impl Into<String>, component: Arc<dyn Component>) -> Self {
        self.endpoints.add_component(scheme, component);
        self
    }

    pub fn endpoint(self, endpoint: SharedEndpoint) -> Self {
        self.endpoints.add_endpoint(endpoint);
        self
    }

    /// Registers a shared pool for `executor_ref`. The engine never shuts it down.
    pub fn pool(mut self, name: impl Into<String>, pool: Arc<ThreadPool>) -> Self {
        self.pools.push((name.into(), pool));
        self
    }

    pub fn saga_service(mut self, service: SharedSagaService) -> Self {
        self.saga = SagaSetup::Service(service);
        self
    }

    pub fn in_memory_saga_service(mut self) -> Self {
        self.saga = SagaSetup::InMemory;
        self
    }

    /// Builds the engine and adds the routes referenced by `routes_path`.
    pub fn build(self) -> Result<CourierEngine> {
        let saga_service: Option<SharedSagaService> = match self.saga {
            SagaSetup::None => None,
            SagaSetup::InMemory => Some(Arc::new(InMemorySagaService::new(self.endpoints.clone()))),
            SagaSetup::Service(service) => Some(service),
        };
        if let Some(service) = &saga_service {
            self.endpoints
                .add_component("saga", Arc::new(SagaComponent::new(service.clone())));
        }

        let pools = Arc::new(ThreadPoolManager::new(self.config.thread_pools.clone()));
        for (name, pool) in self.pools {
            pools.register(name, pool);
        }

        let routes = self.config.load_routes()?;
        let engine = CourierEngine {
            config: Arc::new(self.config),
            registry: self.registry,
            languages: Arc::new(self.languages),
            endpoints: self.endpoints,
            consumers: self.consumers,
            pools,
            saga_service,
            state: Mutex::new(EngineState::default()),
        };
        if let Some(routes) = routes {
            engine.add_routes(routes)?;
        }
        Ok(engine)
    }
}

pub struct CourierEngine {
    config: Arc<EngineConfig>,
    registry: Arc<Registry>,
    languages: Arc<LanguageRegistry>,
    endpoints: Arc<EndpointRegistry>,
    consumers: Arc<DirectConsumers>,
    pools: Arc<ThreadPoolManager>,
    saga_service: Option<SharedSagaService>,
    state: Mutex<EngineState>,
}

impl CourierEngine {
    pub fn builder() -> CourierEngineBuilder {
        CourierEngineBuilder::default()
    }

    pub fn from_config(config: EngineConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    pub fn saga_service(&self) -> Option<&SharedSagaService> {
        self.saga_service.as_ref()
    }

    pub fn register_endpoint(&self, endpoint: SharedEndpoint) {
        self.endpoints.add_endpoint(endpoint);
    }

    pub fn register_pool(&self, name: impl Into<String>, pool: Arc<ThreadPool>) {
        self.pools.register(name, pool);
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn env(&self, state: &EngineState) -> BuildEnv {
        BuildEnv {
            config: self.config.clone(),
            registry: self.registry.clone(),
            languages: self.languages.clone(),
            endpoints: self.endpoints.clone(),
            pools: self.pools.clone(),
            saga_service: self.saga_service.clone(),
            context_clauses: state.context_clauses.clone(),
            default_error_handler: state.default_error_handler.clone(),
        }
    }

    fn register_interceptors<'d>(
        &self,
        env: &BuildEnv,
        owner: &str,
        definitions: impl IntoIterator<Item = &'d InterceptSendToEndpointDefinition>,
        registered: &mut Vec<(Arc<SendInterceptor>, Vec<PoolHandle>)>,
    ) -> Result<(), BuildError> {
        for definition in definitions {
            let (interceptor, pools) = build_interceptor(env, owner, definition)?;
            self.endpoints.add_interceptor(interceptor.clone());
            registered.push((interceptor, pools));
        }
        Ok(())
    }

    fn rollback_interceptors(&self, registered: Vec<(Arc<SendInterceptor>, Vec<PoolHandle>)>) {
        for (interceptor, pools) in registered {
            self.endpoints.remove_interceptor(&interceptor);
            for pool in pools {
                pool.shutdown_if_owned();
            }
        }
    }

    /// Adds routes, context clauses, interceptors and the default error
    /// handler. Every new route is built before any is committed; when the
    /// engine is running, routes with `auto_startup` start immediately.
    pub fn add_routes(&self, routes: RoutesDefinition) -> Result<()> {
        let mut state = self.lock();
        for (index, route) in routes.routes.iter().enumerate() {
            let clash = state.entry(&route.id).is_some()
                || routes.routes[..index].iter().any(|earlier| earlier.id == route.id);
            if clash {
                return Err(BuildError::DuplicateRoute {
                    route: route.id.clone(),
                }
                .into());
            }
        }

        let previous_clauses = state.context_clauses.len();
        let previous_handler = state.default_error_handler.clone();
        state.context_clauses.extend(routes.on_exception.iter().cloned());
        if routes.error_handler.is_some() {
            state.default_error_handler = routes.error_handler.clone();
        }
        let env = self.env(&state);

        let mut interceptors = Vec::new();
        let mut built = Vec::new();
        let outcome = (|| -> Result<(), BuildError> {
            self.register_interceptors(&env, "context", &routes.intercept_send_to_endpoint, &mut interceptors)?;
            for route in &routes.routes {
                self.register_interceptors(&env, &route.id, route.intercepts(), &mut interceptors)?;
            }
            for route in &routes.routes {
                let auto_startup = self.auto_startup(&env, route)?;
                built.push((build_route(&env, route)?, auto_startup));
            }
            Ok(())
        })();

        if let Err(err) = outcome {
            for (route, _) in &built {
                route.release();
            }
            self.rollback_interceptors(interceptors);
            state.context_clauses.truncate(previous_clauses);
            state.default_error_handler = previous_handler;
            tracing::warn!(
                target: "courier::engine",
                event = "routes_rejected",
                route = %err.route(),
                error = %err,
            );
            return Err(err.into());
        }
        state
            .interceptor_pools
            .extend(interceptors.into_iter().flat_map(|(_, pools)| pools));

        let mut first_error = None;
        for (definition, (route, auto_startup)) in routes.routes.into_iter().zip(built) {
            let start = state.started && auto_startup;
            tracing::info!(
                target: "courier::engine",
                event = "route_added",
                route = %definition.id,
                from = %route.from,
                start,
            );
            let mut entry = RouteEntry {
                definition,
                status: RouteStatus::Stopped,
                consumer: None,
            };
            if start {
                if let Err(err) = self.activate(&state, &mut entry, route) {
                    first_error.get_or_insert(err);
                }
            } else {
                route.release();
            }
            state.routes.push(entry);
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn auto_startup(&self, env: &BuildEnv, route: &RouteDefinition) -> Result<bool, BuildError> {
        RouteContext::new(env, &route.id).flag("route", &route.auto_startup, true)
    }

    /// Registers the consumer of a freshly built route.
    fn activate(
        &self,
        state: &EngineState,
        entry: &mut RouteEntry,
        route: BuiltRoute,
    ) -> Result<(), BuildError> {
        let owner = state.routes.iter().find(|other| {
            other.status == RouteStatus::Started
                && other.definition.id != entry.definition.id
                && other
                    .consumer
                    .as_ref()
                    .is_some_and(|consumer| consumer.route().from == route.from)
        });
        if let Some(owner) = owner {
            route.release();
            return Err(BuildError::InvalidEndpoint {
                route: entry.definition.id.clone(),
                node: "route".to_string(),
                uri: route.from.clone(),
                reason: format!("already consumed by route `{}`", owner.definition.id),
            });
        }

        for policy in &route.policies {
            policy.on_start(&route.id);
        }
        let consumer = Arc::new(RouteConsumer::new(route));
        self.consumers.register(&consumer.route().from, consumer.clone());
        tracing::info!(
            target: "courier::engine",
            event = "route_started",
            route = %entry.definition.id,
            from = %consumer.route().from,
        );
        entry.consumer = Some(consumer);
        entry.status = RouteStatus::Started;
        Ok(())
    }

    fn start_locked(&self, state: &mut EngineState, route: &str) -> Result<(), BuildError> {
        let env = self.env(state);
        let index = state
            .routes
            .iter()
            .position(|entry| entry.definition.id == route)
            .ok_or_else(|| BuildError::UnknownRoute {
                route: route.to_string(),
            })?;
        if state.routes[index].status == RouteStatus::Started {
            return Ok(());
        }
        let built = build_route(&env, &state.routes[index].definition)?;
        let mut entry = state.routes.remove(index);
        let outcome = self.activate(state, &mut entry, built);
        state.routes.insert(index, entry);
        outcome
    }

    /// Starts every route with `auto_startup`, ordered by `startup_order`
    /// and then by declaration.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock();
        state.started = true;
        let env = self.env(&state);

        let mut order: Vec<(i32, usize, String)> = Vec::new();
        for (index, entry) in state.routes.iter().enumerate() {
            if self.auto_startup(&env, &entry.definition)? {
                let startup_order = entry.definition.startup_order.unwrap_or(i32::MAX);
                order.push((startup_order, index, entry.definition.id.clone()));
            }
        }
        order.sort();
        for (_, _, route) in order {
            self.start_locked(&mut state, &route)?;
        }
        tracing::info!(
            target: "courier::engine",
            event = "engine_started",
            routes = state.routes.len(),
        );
        Ok(())
    }

    pub fn start_route(&self, route: &str) -> Result<()> {
        let mut state = self.lock();
        Ok(self.start_locked(&mut state, route)?)
    }

    /// Stops `route`, waiting up to the configured shutdown timeout for its
    /// in-flight exchanges before releasing its pools.
    pub async fn stop_route(&self, route: &str) -> Result<()> {
        let consumer = {
            let mut state = self.lock();
            let entry = state.entry_mut(route)?;
            if entry.status != RouteStatus::Started {
                return Ok(());
            }
            entry.status = RouteStatus::Stopped;
            entry.consumer.take()
        };
        let Some(consumer) = consumer else {
            return Ok(());
        };
        self.consumers.unregister(&consumer.route().from);

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while consumer.inflight() > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    target: "courier::engine",
                    event = "route_stop_timeout",
                    route = %route,
                    inflight = consumer.inflight(),
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                );
                break;
            }
            tokio::time::sleep(INFLIGHT_POLL).await;
        }

        consumer.route().release();
        for policy in &consumer.route().policies {
            policy.on_stop(route);
        }
        tracing::info!(target: "courier::engine", event = "route_stopped", route = %route);
        Ok(())
    }

    /// Stops every started route in reverse startup order, deferred routes last.
    pub async fn stop(&self) -> Result<()> {
        let order = {
            let mut state = self.lock();
            state.started = false;
            let mut order: Vec<(bool, Reverse<i32>, Reverse<usize>, String)> = state
                .routes
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.status == RouteStatus::Started)
                .map(|(index, entry)| {
                    (
                        entry.definition.shutdown_route == ShutdownRoute::Defer,
                        Reverse(entry.definition.startup_order.unwrap_or(i32::MAX)),
                        Reverse(index),
                        entry.definition.id.clone(),
                    )
                })
                .collect();
            order.sort();
            order
        };
        for (_, _, _, route) in order {
            self.stop_route(&route).await?;
        }
        let pools = std::mem::take(&mut self.lock().interceptor_pools);
        for pool in pools {
            pool.shutdown_if_owned();
        }
        tracing::info!(target: "courier::engine", event = "engine_stopped");
        Ok(())
    }

    pub fn route_status(&self, route: &str) -> Option<RouteStatus> {
        self.lock().entry(route).map(|entry| entry.status)
    }

    pub fn route_ids(&self) -> Vec<String> {
        self.lock()
            .routes
            .iter()
            .map(|entry| entry.definition.id.clone())
            .collect()
    }

    /// The route declared on `uri` when it exists but is not started.
    fn stopped_consumer_of(&self, uri: &str) -> Option<String> {
        let state = self.lock();
        state
            .routes
            .iter()
            .filter(|entry| entry.status != RouteStatus::Started)
            .find(|entry| {
                resolve_placeholders(&entry.definition.from, &self.config.properties)
                    .is_ok_and(|from| from.trim() == uri.trim())
            })
            .map(|entry| entry.definition.id.clone())
    }

    /// Sends `exchange` to `uri` and completes its unit of work. A failure is
    /// left on the returned exchange.
    pub async fn send(&self, uri: &str, mut exchange: Exchange) -> Exchange {
        let outcome = match self.endpoints.resolve(uri) {
            Ok(endpoint) => send_to(&endpoint, &mut exchange).await,
            Err(err) => Err(err),
        };
        let outcome = outcome.map_err(|err| match self.stopped_consumer_of(uri) {
            Some(route) if err.kind() == DIRECT_CONSUMER_NOT_AVAILABLE => {
                ExchangeError::RouteNotStarted { route }
            }
            _ => err,
        });
        if let Err(err) = outcome {
            tracing::debug!(
                target: "courier::engine",
                event = "exchange_failed",
                uri = %uri,
                exchange_id = %exchange.id(),
                error = %err,
            );
            exchange.set_exception(err);
        }
        exchange.set_route_stop(false);
        exchange.done();
        exchange
    }

    /// Sends `body` to `uri` and returns the resulting body.
    pub async fn request(&self, uri: &str, body: impl Into<JsonValue>) -> Result<JsonValue, ExchangeError> {
        let mut exchange = self.send(uri, Exchange::new(body)).await;
        match exchange.take_exception() {
            Some(err) => Err(err),
            None => Ok(exchange.into_body()),
        }
    }

    /// Merges the exception clauses and interceptors of `advice` into
    /// `route`. A started route goes `Started -> Stopped -> Merged -> Started`,
    /// a stopped one `Stopped -> Merged -> Stopped`. On a build failure the
    /// previous definition is restored.
    pub async fn advice_with(&self, route: &str, advice: RoutesDefinition) -> Result<()> {
        let reject = |reason: &str| -> Error {
            BuildError::Advice {
                route: route.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };
        if !advice.routes.is_empty() {
            return Err(reject("advice may not define routes"));
        }
        if advice.error_handler.is_some() {
            return Err(reject("advice may not replace the error handler"));
        }

        let was_started = match self.route_status(route) {
            Some(status) => status == RouteStatus::Started,
            None => {
                return Err(BuildError::UnknownRoute {
                    route: route.to_string(),
                }
                .into())
            }
        };
        if was_started {
            self.stop_route(route).await?;
        }

        let mut state = self.lock();
        let entry = state.entry_mut(route)?;
        let previous = entry.definition.clone();
        let mut merged = previous.clone();
        merged
            .outputs
            .extend(advice.on_exception.into_iter().map(ProcessorDefinition::OnException));
        merged.outputs.extend(
            advice
                .intercept_send_to_endpoint
                .into_iter()
                .map(ProcessorDefinition::InterceptSendToEndpoint),
        );
        entry.definition = merged.clone();
        entry.status = RouteStatus::Merged;
        tracing::info!(target: "courier::engine", event = "route_merged", route = %route);

        let env = self.env(&state);
        let mut interceptors = Vec::new();
        let new_intercepts = merged.intercepts().skip(previous.intercepts().count());
        let outcome = self
            .register_interceptors(&env, route, new_intercepts, &mut interceptors)
            .and_then(|()| {
                if was_started {
                    self.start_locked(&mut state, route)
                } else {
                    build_route(&env, &merged).map(|built| built.release())
                }
            });

        match outcome {
            Ok(()) => {
                state
                    .interceptor_pools
                    .extend(interceptors.into_iter().flat_map(|(_, pools)| pools));
                if !was_started {
                    state.entry_mut(route)?.status = RouteStatus::Stopped;
                }
                Ok(())
            }
            Err(err) => {
                self.rollback_interceptors(interceptors);
                let entry = state.entry_mut(route)?;
                entry.definition = previous;
                entry.status = RouteStatus::Stopped;
                if was_started {
                    self.start_locked(&mut state, route)?;
                }
                Err(err.into())
            }
        }
    }
}
