//! Nodes that gate their outputs: idempotent consumer, throttle, threads, saga.

use super::RouteContext;
use crate::definition::{
    IdempotentConsumerDefinition, SagaDefinition, ThreadsDefinition, ThrottleDefinition,
};
use crate::error::BuildError;
use crate::idempotent::SharedIdempotentRepository;
use crate::processor::idempotent::{IdempotentConsumerProcessor, IdempotentSettings};
use crate::processor::saga::SagaProcessor;
use crate::processor::threads::ThreadsProcessor;
use crate::processor::throttle::{ThrottleProcessor, ThrottleSettings, DEFAULT_TIME_PERIOD};
use crate::processor::SharedProcessor;
use crate::saga::SagaStep;
use std::collections::BTreeMap;
use std::sync::Arc;

pub(super) fn idempotent_consumer(
    ctx: &mut RouteContext<'_>,
    node: &str,
    definition: &IdempotentConsumerDefinition,
) -> Result<SharedProcessor, BuildError> {
    let defaults = IdempotentSettings::default();
    let settings = IdempotentSettings {
        eager: ctx.flag(node, &definition.eager, defaults.eager)?,
        completion_eager: ctx.flag(node, &definition.completion_eager, defaults.completion_eager)?,
        skip_duplicate: ctx.flag(node, &definition.skip_duplicate, defaults.skip_duplicate)?,
        remove_on_failure: ctx.flag(node, &definition.remove_on_failure, defaults.remove_on_failure)?,
    };
    let repository_name = ctx.text(node, &definition.repository_ref)?;
    let repository =
        ctx.lookup::<SharedIdempotentRepository>(node, "idempotent repository", &repository_name)?;
    let expression = ctx.expression(node, &definition.expression)?;
    let output = ctx.chain(&definition.outputs)?;
    Ok(Arc::new(IdempotentConsumerProcessor::new(
        ctx.route().clone(),
        node.to_string(),
        expression,
        repository,
        settings,
        output,
    )))
}

pub(super) fn throttle(
    ctx: &mut RouteContext<'_>,
    node: &str,
    definition: &ThrottleDefinition,
) -> Result<SharedProcessor, BuildError> {
    let Some(expression) = &definition.expression else {
        return Err(ctx.invalid(node, "throttle requires a maximum requests expression"));
    };
    let expression = ctx.expression(node, expression)?;
    let settings = ThrottleSettings {
        time_period: ctx.duration(node, &definition.time_period)?.unwrap_or(DEFAULT_TIME_PERIOD),
        reject_execution: ctx.flag(node, &definition.reject_execution, false)?,
        async_delayed: ctx.flag(node, &definition.async_delayed, false)?,
        caller_runs_when_rejected: ctx.flag(node, &definition.caller_runs_when_rejected, true)?,
    };
    if settings.time_period.is_zero() {
        return Err(ctx.invalid(node, "time_period must be positive"));
    }
    let pool = match (&definition.executor_ref, settings.async_delayed) {
        (Some(reference), _) => Some(ctx.executor_ref(node, reference)?),
        (None, true) => {
            let handle = ctx.env().pools.new_default_pool(&ctx.pool_source(node));
            ctx.owned_pools.push(handle.clone());
            Some(handle)
        }
        (None, false) => None,
    };
    let output = ctx.chain(&definition.outputs)?;
    Ok(Arc::new(ThrottleProcessor::new(
        ctx.route().clone(),
        node.to_string(),
        expression,
        settings,
        pool,
        output,
    )))
}

pub(super) fn threads(
    ctx: &mut RouteContext<'_>,
    node: &str,
    definition: &ThreadsDefinition,
) -> Result<SharedProcessor, BuildError> {
    let pool = ctx
        .executor(node, &definition.executor, true)?
        .ok_or_else(|| ctx.invalid(node, "threads requires a pool"))?;
    let output = ctx.chain(&definition.outputs)?;
    Ok(Arc::new(ThreadsProcessor::new(pool, output)))
}

pub(super) fn saga(
    ctx: &mut RouteContext<'_>,
    node: &str,
    definition: &SagaDefinition,
) -> Result<SharedProcessor, BuildError> {
    let service = ctx
        .env()
        .saga_service
        .clone()
        .ok_or_else(|| BuildError::MissingSagaService {
            route: ctx.route().to_string(),
            node: node.to_string(),
        })?;

    let endpoint_uri = |uri: &Option<String>| -> Result<Option<String>, BuildError> {
        match uri {
            Some(uri) => {
                let endpoint = ctx.endpoint(node, uri)?;
                Ok(Some(endpoint.uri().to_string()))
            }
            None => Ok(None),
        }
    };
    let compensation = endpoint_uri(&definition.compensation)?;
    let completion = endpoint_uri(&definition.completion)?;

    let mut options = BTreeMap::new();
    for (name, expression) in &definition.options {
        options.insert(name.clone(), ctx.expression(node, expression)?);
    }
    let step = Arc::new(SagaStep {
        compensation,
        completion,
        options,
        timeout: ctx.duration(node, &definition.timeout)?,
    });
    let key = format!("{}/{}", ctx.route(), node);
    service.register_step(&key, step.clone()).map_err(|err| BuildError::InvalidConfiguration {
        route: ctx.route().to_string(),
        node: node.to_string(),
        reason: err.to_string(),
    })?;

    let output = ctx.chain(&definition.outputs)?;
    Ok(Arc::new(SagaProcessor::new(
        ctx.route().clone(),
        node.to_string(),
        service,
        step,
        definition.propagation,
        definition.completion_mode.unwrap_or_default(),
        output,
    )))
}
