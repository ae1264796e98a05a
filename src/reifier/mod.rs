//! Reification: turns definition trees into executable processors.
//!
//! A [`RouteContext`] lives for one build pass. It hands out node ids,
//! resolves placeholders and references, collects the pools the route owns
//! and wraps every produced node in the route's channel and error handler.

mod error_handling;
mod fanout;
mod gates;

pub use error_handling::build_interceptor;

use crate::aggregation::{SharedAggregationStrategy, UseLatestAggregationStrategy};
use crate::config::{EngineConfig, ThreadPoolProfile};
use crate::definition::param::{parse_duration_text, resolve_placeholders};
use crate::definition::{
    DurationParam, ErrorHandlerDefinition, ExecutorOptions, ExpressionDefinition,
    OnExceptionDefinition, Param, ProcessorDefinition, RouteDefinition,
};
use crate::endpoint::{EndpointCache, EndpointRegistry, SharedEndpoint};
use crate::error::BuildError;
use crate::errorhandler::{ErrorHandler, ErrorHandlerProcessor};
use crate::expression::{
    constant, expression_fn, ExpressionPredicate, Language, LanguageRegistry, SharedExpression,
    SharedPredicate, DEFAULT_LANGUAGE,
};
use crate::pool::{PoolHandle, ThreadPoolManager};
use crate::processor::basic::{
    LogProcessor, RemoveHeaderProcessor, SendProcessor, SetBodyProcessor, SetHeaderProcessor,
    SetPropertyProcessor, StopProcessor, ThrowExceptionProcessor,
};
use crate::processor::channel::{Channel, ChannelFlags};
use crate::processor::choice::{ChoiceProcessor, FilterProcessor};
use crate::processor::on_completion::OnCompletionHook;
use crate::processor::pipeline::Pipeline;
use crate::processor::SharedProcessor;
use crate::registry::Registry;
use crate::route::{BuiltRoute, SharedRoutePolicy};
use crate::saga::SharedSagaService;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Engine resources a build pass may use.
#[derive(Clone)]
pub struct BuildEnv {
    pub config: Arc<EngineConfig>,
    pub registry: Arc<Registry>,
    pub languages: Arc<LanguageRegistry>,
    pub endpoints: Arc<EndpointRegistry>,
    pub pools: Arc<ThreadPoolManager>,
    pub saga_service: Option<SharedSagaService>,
    /// Engine-wide clauses, consulted after a route's own clauses.
    pub context_clauses: Vec<OnExceptionDefinition>,
    pub default_error_handler: Option<ErrorHandlerDefinition>,
}

pub struct RouteContext<'a> {
    env: &'a BuildEnv,
    route: Arc<str>,
    counters: HashMap<&'static str, usize>,
    flags: ChannelFlags,
    error_handler: Option<Arc<ErrorHandler>>,
    /// Off while building clause and interceptor outputs.
    wrap_error_handler: bool,
    endpoint_cache: Arc<EndpointCache>,
    owned_pools: Vec<PoolHandle>,
    on_completions: Vec<OnCompletionHook>,
}

impl<'a> RouteContext<'a> {
    pub fn new(env: &'a BuildEnv, route: &str) -> Self {
        Self {
            env,
            route: Arc::from(route),
            counters: HashMap::new(),
            flags: ChannelFlags::default(),
            error_handler: None,
            wrap_error_handler: true,
            endpoint_cache: Arc::new(EndpointCache::new(
                env.endpoints.clone(),
                env.config.endpoint_cache_size,
            )),
            owned_pools: Vec::new(),
            on_completions: Vec::new(),
        }
    }

    pub fn route(&self) -> &Arc<str> {
        &self.route
    }

    pub fn env(&self) -> &'a BuildEnv {
        self.env
    }

    fn next_node(&mut self, kind: &'static str) -> String {
        let counter = self.counters.entry(kind).or_insert(0);
        *counter += 1;
        format!("{kind}{counter}")
    }

    fn invalid(&self, node: &str, reason: impl Into<String>) -> BuildError {
        BuildError::InvalidConfiguration {
            route: self.route.to_string(),
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    fn missing(&self, node: &str, kind: &'static str, name: &str) -> BuildError {
        BuildError::MissingReference {
            route: self.route.to_string(),
            node: node.to_string(),
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn text(&self, node: &str, text: &str) -> Result<String, BuildError> {
        resolve_placeholders(text, &self.env.config.properties).map_err(|key| {
            BuildError::UnresolvedPlaceholder {
                route: self.route.to_string(),
                node: node.to_string(),
                key,
            }
        })
    }

    pub(crate) fn param<T>(&self, node: &str, param: &Option<Param<T>>, default: T) -> Result<T, BuildError>
    where
        T: FromStr + Clone,
        T::Err: Display,
    {
        match param {
            None => Ok(default),
            Some(Param::Value(value)) => Ok(value.clone()),
            Some(Param::Placeholder(text)) => {
                let resolved = self.text(node, text)?;
                resolved
                    .trim()
                    .parse::<T>()
                    .map_err(|err| self.invalid(node, format!("cannot parse `{resolved}`: {err}")))
            }
        }
    }

    pub(crate) fn flag(&self, node: &str, param: &Option<Param<bool>>, default: bool) -> Result<bool, BuildError> {
        self.param(node, param, default)
    }

    pub(crate) fn duration(&self, node: &str, param: &Option<DurationParam>) -> Result<Option<Duration>, BuildError> {
        match param {
            None => Ok(None),
            Some(DurationParam::Millis(ms)) => Ok(Some(Duration::from_millis(*ms))),
            Some(DurationParam::Text(text)) => {
                let resolved = self.text(node, text)?;
                parse_duration_text(&resolved)
                    .map(Some)
                    .map_err(|reason| self.invalid(node, reason))
            }
        }
    }

    pub(crate) fn lookup<T>(&self, node: &str, kind: &'static str, name: &str) -> Result<T, BuildError>
    where
        T: Any + Clone + Send + Sync,
    {
        self.env
            .registry
            .lookup::<T>(name)
            .ok_or_else(|| self.missing(node, kind, name))
    }

    pub(crate) fn processor_ref(&self, node: &str, name: &Option<String>) -> Result<Option<SharedProcessor>, BuildError> {
        name.as_deref()
            .map(|name| self.lookup::<SharedProcessor>(node, "processor", name))
            .transpose()
    }

    fn language(&self, node: &str, name: &str) -> Result<Arc<dyn Language>, BuildError> {
        self.env
            .languages
            .get(name)
            .ok_or_else(|| BuildError::UnknownLanguage {
                route: self.route.to_string(),
                node: node.to_string(),
                language: name.to_string(),
            })
    }

    fn compile<T>(
        &self,
        node: &str,
        language: &str,
        text: &str,
        create: impl FnOnce(&dyn Language, &str) -> Result<T, String>,
    ) -> Result<T, BuildError> {
        let text = self.text(node, text)?;
        let language_impl = self.language(node, language)?;
        create(language_impl.as_ref(), &text).map_err(|reason| BuildError::InvalidExpression {
            route: self.route.to_string(),
            node: node.to_string(),
            language: language.to_string(),
            expression: text.clone(),
            reason,
        })
    }

    pub(crate) fn expression(&self, node: &str, definition: &ExpressionDefinition) -> Result<SharedExpression, BuildError> {
        match definition {
            ExpressionDefinition::Text(text) => {
                self.compile(node, DEFAULT_LANGUAGE, text, |language, text| language.create_expression(text))
            }
            ExpressionDefinition::Language {
                language,
                expression,
            } => self.compile(node, language, expression, |language, text| language.create_expression(text)),
            ExpressionDefinition::Constant(value) => Ok(constant(value.clone())),
            ExpressionDefinition::Expression(expression) => Ok(expression.clone()),
            ExpressionDefinition::Predicate(predicate) => {
                let predicate = predicate.clone();
                Ok(expression_fn(move |exchange| predicate.matches(exchange).map(JsonValue::Bool)))
            }
        }
    }

    pub(crate) fn predicate(&self, node: &str, definition: &ExpressionDefinition) -> Result<SharedPredicate, BuildError> {
        match definition {
            ExpressionDefinition::Text(text) => {
                self.compile(node, DEFAULT_LANGUAGE, text, |language, text| language.create_predicate(text))
            }
            ExpressionDefinition::Language {
                language,
                expression,
            } => self.compile(node, language, expression, |language, text| language.create_predicate(text)),
            ExpressionDefinition::Predicate(predicate) => Ok(predicate.clone()),
            other => Ok(Arc::new(ExpressionPredicate::new(self.expression(node, other)?))),
        }
    }

    pub(crate) fn strategy(
        &self,
        node: &str,
        instance: &Option<SharedAggregationStrategy>,
        reference: &Option<String>,
    ) -> Result<SharedAggregationStrategy, BuildError> {
        if let Some(strategy) = instance {
            return Ok(strategy.clone());
        }
        match reference {
            Some(name) => self.lookup::<SharedAggregationStrategy>(node, "aggregation strategy", name),
            None => Ok(Arc::new(UseLatestAggregationStrategy)),
        }
    }

    pub(crate) fn endpoint(&self, node: &str, uri: &str) -> Result<SharedEndpoint, BuildError> {
        let uri = self.text(node, uri)?;
        self.env
            .endpoints
            .resolve(&uri)
            .map_err(|err| BuildError::InvalidEndpoint {
                route: self.route.to_string(),
                node: node.to_string(),
                uri: uri.clone(),
                reason: err.to_string(),
            })
    }

    /// The route's shared cache, or a dedicated one when `cache_size` is set.
    pub(crate) fn endpoint_cache(&self, node: &str, cache_size: &Option<Param<usize>>) -> Result<Arc<EndpointCache>, BuildError> {
        match cache_size {
            None => Ok(self.endpoint_cache.clone()),
            Some(_) => {
                let capacity = self.param(node, cache_size, self.env.config.endpoint_cache_size)?;
                Ok(Arc::new(EndpointCache::new(self.env.endpoints.clone(), capacity)))
            }
        }
    }

    /// Resolves the pool for a node. Explicit references and discrete sizing
    /// are mutually exclusive; `required` creates a default pool when neither
    /// is given.
    pub(crate) fn executor(
        &mut self,
        node: &str,
        options: &ExecutorOptions,
        required: bool,
    ) -> Result<Option<PoolHandle>, BuildError> {
        if options.executor_ref.is_some() && options.has_sizing() {
            return Err(self.invalid(
                node,
                "executor_ref cannot be combined with pool_size, max_pool_size, max_queue_size or rejected_policy",
            ));
        }
        if let Some(reference) = &options.executor_ref {
            return self.executor_ref(node, reference).map(Some);
        }
        let pools = self.env.pools.clone();
        let handle = if options.has_sizing() {
            let defaults = pools.default_profile().clone();
            let profile = ThreadPoolProfile {
                pool_size: self.param(node, &options.pool_size, defaults.pool_size)?,
                max_pool_size: self.param(node, &options.max_pool_size, defaults.max_pool_size)?,
                max_queue_size: self.param(node, &options.max_queue_size, defaults.max_queue_size)?,
                rejected_policy: options.rejected_policy.unwrap_or(defaults.rejected_policy),
            };
            pools.new_pool(&self.pool_source(node), profile)
        } else if required {
            pools.new_default_pool(&self.pool_source(node))
        } else {
            return Ok(None);
        };
        self.owned_pools.push(handle.clone());
        Ok(Some(handle))
    }

    pub(crate) fn executor_ref(&mut self, node: &str, reference: &str) -> Result<PoolHandle, BuildError> {
        let reference = self.text(node, reference)?;
        let handle = self
            .env
            .pools
            .resolve(&self.pool_source(node), &reference)
            .ok_or_else(|| self.missing(node, "thread pool", &reference))?;
        if handle.is_owned() {
            self.owned_pools.push(handle.clone());
        }
        Ok(handle)
    }

    fn pool_source(&self, node: &str) -> String {
        format!("{}.{}", self.route, node)
    }

    /// The handler new nodes run under; `None` while wrapping is disabled.
    pub(crate) fn error_handler(&self) -> Option<&Arc<ErrorHandler>> {
        self.error_handler
            .as_ref()
            .filter(|handler| self.wrap_error_handler && !handler.is_none())
    }

    /// Runs `build` with error handler wrapping disabled.
    pub(crate) fn without_error_handler<T>(
        &mut self,
        build: impl FnOnce(&mut Self) -> Result<T, BuildError>,
    ) -> Result<T, BuildError> {
        let previous = std::mem::replace(&mut self.wrap_error_handler, false);
        let result = build(self);
        self.wrap_error_handler = previous;
        result
    }

    fn channel(&self, node: &str, processor: SharedProcessor) -> SharedProcessor {
        if self.flags.is_passthrough() {
            return processor;
        }
        Arc::new(Channel::new(
            self.route.clone(),
            node.to_string(),
            processor,
            self.flags.clone(),
        ))
    }

    pub(crate) fn wrap_with_error_handler(&self, processor: SharedProcessor) -> SharedProcessor {
        match self.error_handler() {
            Some(handler) => Arc::new(ErrorHandlerProcessor::new(handler.clone(), processor)),
            None => processor,
        }
    }

    /// Reifies one node and wraps it in the channel and error handler.
    pub(crate) fn node(&mut self, definition: &ProcessorDefinition) -> Result<SharedProcessor, BuildError> {
        let node = self.next_node(definition.kind());
        let processor = self.reify(definition, &node)?;
        let processor = self.channel(&node, processor);
        Ok(match definition {
            // these run evaluation and delivery under the error handler themselves
            ProcessorDefinition::RecipientList(_)
            | ProcessorDefinition::DynamicRouter(_)
            | ProcessorDefinition::RoutingSlip(_) => processor,
            _ => self.wrap_with_error_handler(processor),
        })
    }

    /// Reifies `outputs` into a single processor, skipping registrations.
    pub(crate) fn chain(&mut self, outputs: &[ProcessorDefinition]) -> Result<SharedProcessor, BuildError> {
        let mut processors = Vec::with_capacity(outputs.len());
        for output in outputs.iter().filter(|output| !output.is_registration()) {
            processors.push(self.node(output)?);
        }
        Ok(match processors.len() {
            1 => processors.remove(0),
            _ => Arc::new(Pipeline::new(processors)),
        })
    }

    fn reify(&mut self, definition: &ProcessorDefinition, node: &str) -> Result<SharedProcessor, BuildError> {
        let processor: SharedProcessor = match definition {
            ProcessorDefinition::To { uri } => Arc::new(SendProcessor::new(self.endpoint(node, uri)?)),
            ProcessorDefinition::Process { reference } => {
                let reference = self.text(node, reference)?;
                self.lookup::<SharedProcessor>(node, "processor", &reference)?
            }
            ProcessorDefinition::Instance { processor } => processor.clone(),
            ProcessorDefinition::SetBody { expression } => {
                Arc::new(SetBodyProcessor::new(self.expression(node, expression)?))
            }
            ProcessorDefinition::SetHeader { name, expression } => Arc::new(SetHeaderProcessor::new(
                name.clone(),
                self.expression(node, expression)?,
            )),
            ProcessorDefinition::SetProperty { name, expression } => Arc::new(SetPropertyProcessor::new(
                name.clone(),
                self.expression(node, expression)?,
            )),
            ProcessorDefinition::RemoveHeader { name } => Arc::new(RemoveHeaderProcessor::new(name.clone())),
            ProcessorDefinition::Log(log) => Arc::new(LogProcessor::new(
                self.route.to_string(),
                log.log_name.clone(),
                self.text(node, &log.message)?,
                log.logging_level,
            )),
            ProcessorDefinition::ThrowException { kind, message } => Arc::new(ThrowExceptionProcessor::new(
                kind.clone(),
                self.text(node, message)?,
            )),
            ProcessorDefinition::Stop => Arc::new(StopProcessor),
            ProcessorDefinition::Pipeline { outputs } => self.chain(outputs)?,
            ProcessorDefinition::Choice(choice) => {
                let mut whens = Vec::with_capacity(choice.when.len());
                for when in &choice.when {
                    whens.push((self.predicate(node, &when.predicate)?, self.chain(&when.outputs)?));
                }
                let otherwise = match &choice.otherwise {
                    Some(outputs) => Some(self.chain(outputs)?),
                    None => None,
                };
                if whens.is_empty() && otherwise.is_none() {
                    return Err(self.invalid(node, "choice requires at least one when or otherwise"));
                }
                Arc::new(ChoiceProcessor::new(whens, otherwise))
            }
            ProcessorDefinition::Filter { predicate, outputs } => {
                if outputs.is_empty() {
                    return Err(self.invalid(node, "filter requires at least one output"));
                }
                Arc::new(FilterProcessor::new(self.predicate(node, predicate)?, self.chain(outputs)?))
            }
            ProcessorDefinition::Multicast(multicast) => fanout::multicast(self, node, multicast)?,
            ProcessorDefinition::Split(split) => fanout::split(self, node, split)?,
            ProcessorDefinition::RecipientList(list) => fanout::recipient_list(self, node, list)?,
            ProcessorDefinition::DynamicRouter(router) => fanout::dynamic_router(self, node, router)?,
            ProcessorDefinition::RoutingSlip(slip) => fanout::routing_slip(self, node, slip)?,
            ProcessorDefinition::Enrich(enrich) => fanout::enrich(self, node, enrich)?,
            ProcessorDefinition::IdempotentConsumer(consumer) => gates::idempotent_consumer(self, node, consumer)?,
            ProcessorDefinition::Throttle(throttle) => gates::throttle(self, node, throttle)?,
            ProcessorDefinition::Threads(threads) => gates::threads(self, node, threads)?,
            ProcessorDefinition::Saga(saga) => gates::saga(self, node, saga)?,
            ProcessorDefinition::OnException(_)
            | ProcessorDefinition::OnCompletion(_)
            | ProcessorDefinition::InterceptSendToEndpoint(_) => {
                return Err(self.invalid(node, format!("{} must be declared at route level", definition.kind())))
            }
        };
        Ok(processor)
    }
}

/// Builds a route: applies its flags, registers its clauses and completion
/// hooks, then reifies its outputs in declaration order.
pub fn build_route(env: &BuildEnv, definition: &RouteDefinition) -> Result<BuiltRoute, BuildError> {
    let mut ctx = RouteContext::new(env, &definition.id);
    let route_node = "route";

    if !definition.outputs.iter().any(|output| !output.is_registration()) {
        return Err(BuildError::NoOutputs {
            route: definition.id.clone(),
        });
    }
    let from = ctx.text(route_node, &definition.from)?;
    if !from.starts_with("direct:") || from.len() <= "direct:".len() {
        return Err(BuildError::InvalidEndpoint {
            route: definition.id.clone(),
            node: route_node.to_string(),
            uri: from,
            reason: "routes consume from direct: endpoints".to_string(),
        });
    }

    ctx.flags = ChannelFlags {
        trace: ctx.flag(route_node, &definition.trace, false)?,
        message_history: ctx.flag(route_node, &definition.message_history, false)?,
        log_mask: ctx.flag(route_node, &definition.log_mask, false)?,
        handle_fault: ctx.flag(route_node, &definition.handle_fault, false)?,
        delayer: ctx.duration(route_node, &definition.delayer)?,
    };
    if ctx.flag(route_node, &definition.stream_caching, false)? {
        tracing::debug!(
            target: "courier::reifier",
            event = "stream_caching_ignored",
            route = %definition.id,
        );
    }

    let mut policies = Vec::with_capacity(definition.route_policy_refs.len());
    for name in &definition.route_policy_refs {
        let policy = ctx.lookup::<SharedRoutePolicy>(route_node, "route policy", name)?;
        policy.on_init(&definition.id);
        policies.push(policy);
    }

    error_handling::install_error_handler(&mut ctx, definition)?;
    error_handling::install_on_completions(&mut ctx, definition)?;

    let mut outputs = Vec::new();
    for output in definition.outputs.iter().filter(|output| !output.is_registration()) {
        outputs.push(ctx.node(output)?);
    }

    tracing::debug!(
        target: "courier::reifier",
        event = "route_built",
        route = %definition.id,
        outputs = outputs.len(),
        owned_pools = ctx.owned_pools.len(),
    );
    Ok(BuiltRoute {
        id: ctx.route.clone(),
        from,
        pipeline: Arc::new(Pipeline::new(outputs)),
        on_completions: std::mem::take(&mut ctx.on_completions),
        policies,
        owned_pools: std::mem::take(&mut ctx.owned_pools),
    })
}
