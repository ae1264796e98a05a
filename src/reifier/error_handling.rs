//! Route registrations: error handler and clauses, completion hooks and
//! send interceptors.

use super::{BuildEnv, RouteContext};
use crate::definition::{
    ErrorHandlerDefinition, ExpressionDefinition, InterceptSendToEndpointDefinition,
    OnCompletionDefinition, OnExceptionDefinition, ProcessorDefinition, RedeliveryPolicyDefinition,
    RouteDefinition,
};
use crate::endpoint::SendInterceptor;
use crate::error::BuildError;
use crate::errorhandler::{
    ClauseScope, ErrorHandler, ErrorHandlerKind, ExceptionClause, FatalFallbackProcessor,
};
use crate::pool::PoolHandle;
use crate::processor::on_completion::{OnCompletionHook, OnCompletionSettings};
use crate::processor::SharedProcessor;
use crate::retry::RedeliveryPolicy;
use std::sync::Arc;

fn redelivery_policy(
    ctx: &RouteContext<'_>,
    node: &str,
    definition: &RedeliveryPolicyDefinition,
) -> Result<RedeliveryPolicy, BuildError> {
    let defaults = RedeliveryPolicy::default();
    Ok(RedeliveryPolicy {
        maximum_redeliveries: ctx.param(node, &definition.maximum_redeliveries, defaults.maximum_redeliveries)?,
        redelivery_delay: ctx
            .duration(node, &definition.redelivery_delay)?
            .unwrap_or(defaults.redelivery_delay),
        maximum_redelivery_delay: ctx
            .duration(node, &definition.maximum_redelivery_delay)?
            .unwrap_or(defaults.maximum_redelivery_delay),
        use_exponential_backoff: ctx.flag(node, &definition.use_exponential_backoff, defaults.use_exponential_backoff)?,
        backoff_multiplier: ctx.param(node, &definition.backoff_multiplier, defaults.backoff_multiplier)?,
        use_collision_avoidance: ctx.flag(node, &definition.use_collision_avoidance, defaults.use_collision_avoidance)?,
    })
}

fn exception_clause(
    ctx: &mut RouteContext<'_>,
    definition: &OnExceptionDefinition,
    scope: ClauseScope,
) -> Result<Arc<ExceptionClause>, BuildError> {
    let node = ctx.next_node("on_exception");
    let node = node.as_str();
    let predicate = |ctx: &RouteContext<'_>, definition: &Option<ExpressionDefinition>| match definition {
        Some(definition) => ctx.predicate(node, definition).map(Some),
        None => Ok(None),
    };

    let processor = if definition.outputs.is_empty() {
        None
    } else {
        let chain = ctx.without_error_handler(|ctx| ctx.chain(&definition.outputs))?;
        Some(Arc::new(FatalFallbackProcessor::new(chain)) as SharedProcessor)
    };

    Ok(Arc::new(ExceptionClause {
        kinds: definition.exceptions.clone(),
        scope,
        on_when: predicate(ctx, &definition.on_when)?,
        handled: predicate(ctx, &definition.handled)?,
        continued: predicate(ctx, &definition.continued)?,
        retry_while: predicate(ctx, &definition.retry_while)?,
        maximum_redeliveries: definition
            .maximum_redeliveries
            .as_ref()
            .map(|_| ctx.param(node, &definition.maximum_redeliveries, 0))
            .transpose()?,
        redelivery_delay: ctx.duration(node, &definition.redelivery_delay)?,
        on_redelivery: ctx.processor_ref(node, &definition.on_redelivery_ref)?,
        use_original_message: ctx.flag(node, &definition.use_original_message, false)?,
        processor,
    }))
}

/// Builds the route's handler: its own definition, else the engine default,
/// else the default kind. Route clauses come before context clauses.
pub(super) fn install_error_handler(
    ctx: &mut RouteContext<'_>,
    route: &RouteDefinition,
) -> Result<(), BuildError> {
    let env = ctx.env();
    let definition = route
        .error_handler
        .clone()
        .or_else(|| env.default_error_handler.clone())
        .unwrap_or_default();
    let node = "error_handler";

    let (kind, policy, on_redelivery) = match &definition {
        ErrorHandlerDefinition::Default {
            redelivery_policy: policy,
            on_redelivery_ref,
        } => (
            ErrorHandlerKind::Default,
            redelivery_policy(ctx, node, policy)?,
            ctx.processor_ref(node, on_redelivery_ref)?,
        ),
        ErrorHandlerDefinition::DeadLetterChannel {
            dead_letter_uri,
            redelivery_policy: policy,
            on_redelivery_ref,
            use_original_message,
        } => (
            ErrorHandlerKind::DeadLetterChannel {
                endpoint: ctx.endpoint(node, dead_letter_uri)?,
                use_original_message: ctx.flag(node, use_original_message, false)?,
            },
            redelivery_policy(ctx, node, policy)?,
            ctx.processor_ref(node, on_redelivery_ref)?,
        ),
        ErrorHandlerDefinition::None => (ErrorHandlerKind::None, RedeliveryPolicy::default(), None),
    };

    let mut clauses = Vec::new();
    for clause in route.on_exceptions() {
        clauses.push(exception_clause(ctx, clause, ClauseScope::Route)?);
    }
    for clause in &env.context_clauses {
        clauses.push(exception_clause(ctx, clause, ClauseScope::Context)?);
    }

    ctx.error_handler = Some(Arc::new(ErrorHandler::new(
        ctx.route().clone(),
        kind,
        policy,
        on_redelivery,
        clauses,
    )));
    Ok(())
}

fn completion_hook(
    ctx: &mut RouteContext<'_>,
    definition: &OnCompletionDefinition,
) -> Result<OnCompletionHook, BuildError> {
    let node = ctx.next_node("on_completion");
    let node = node.as_str();
    let settings = OnCompletionSettings {
        mode: definition.mode,
        on_complete_only: ctx.flag(node, &definition.on_complete_only, false)?,
        on_failure_only: ctx.flag(node, &definition.on_failure_only, false)?,
        on_when: match &definition.on_when {
            Some(on_when) => Some(ctx.predicate(node, on_when)?),
            None => None,
        },
    };
    if settings.on_complete_only && settings.on_failure_only {
        return Err(ctx.invalid(node, "on_complete_only and on_failure_only are mutually exclusive"));
    }
    if definition.outputs.is_empty() {
        return Err(ctx.invalid(node, "on_completion requires at least one output"));
    }

    let pool = if ctx.flag(node, &definition.parallel_processing, false)? {
        Some(match &definition.executor_ref {
            Some(reference) => ctx.executor_ref(node, reference)?,
            None => {
                let handle = ctx.env().pools.new_default_pool(&ctx.pool_source(node));
                ctx.owned_pools.push(handle.clone());
                handle
            }
        })
    } else {
        None
    };
    let output = ctx.without_error_handler(|ctx| ctx.chain(&definition.outputs))?;
    Ok(OnCompletionHook::new(ctx.route().clone(), settings, output, pool))
}

pub(super) fn install_on_completions(
    ctx: &mut RouteContext<'_>,
    route: &RouteDefinition,
) -> Result<(), BuildError> {
    for output in &route.outputs {
        if let ProcessorDefinition::OnCompletion(definition) = output {
            let hook = completion_hook(ctx, definition)?;
            ctx.on_completions.push(hook);
        }
    }
    Ok(())
}

/// Builds an interceptor for registration on the endpoint registry. `owner`
/// names the route declaring it, or the engine for context-level ones. The
/// returned pools are owned by the interceptor's chain.
pub fn build_interceptor(
    env: &BuildEnv,
    owner: &str,
    definition: &InterceptSendToEndpointDefinition,
) -> Result<(Arc<SendInterceptor>, Vec<PoolHandle>), BuildError> {
    let mut ctx = RouteContext::new(env, owner);
    let node = ctx.next_node("intercept_send_to_endpoint");
    let node = node.as_str();

    let pattern = ctx.text(node, &definition.uri)?;
    if pattern.trim().is_empty() {
        return Err(ctx.invalid(node, "intercept uri must not be empty"));
    }
    let when = match &definition.when {
        Some(when) => Some(ctx.predicate(node, when)?),
        None => None,
    };
    let skip_send_to_original_endpoint = ctx.flag(node, &definition.skip_send_to_original_endpoint, false)?;
    let processor = ctx.without_error_handler(|ctx| ctx.chain(&definition.outputs))?;

    tracing::debug!(
        target: "courier::reifier",
        event = "interceptor_built",
        owner = %owner,
        pattern = %pattern,
        skip_send_to_original_endpoint,
    );
    let interceptor = Arc::new(SendInterceptor {
        pattern: pattern.trim().to_string(),
        when,
        skip_send_to_original_endpoint,
        processor,
    });
    Ok((interceptor, std::mem::take(&mut ctx.owned_pools)))
}
