//! Multicast, split, recipient list, dynamic router, routing slip and enrich.

use super::RouteContext;
use crate::definition::{
    DynamicRouterDefinition, EnrichDefinition, FanOutOptions, MulticastDefinition, Param,
    RecipientListDefinition, RoutingSlipDefinition, SplitDefinition,
};
use crate::error::BuildError;
use crate::processor::dynamic_router::DynamicRouterProcessor;
use crate::processor::enrich::{EnrichProcessor, EnrichSettings};
use crate::processor::fanout::{FanOut, FanOutSettings};
use crate::processor::multicast::MulticastProcessor;
use crate::processor::recipient_list::{EvaluateRecipients, RecipientListProcessor};
use crate::processor::routing_slip::{HopDelivery, RoutingSlipProcessor};
use crate::processor::splitter::{SplitterProcessor, DEFAULT_DELIMITER};
use crate::processor::SharedProcessor;
use std::sync::Arc;

fn fan_out(ctx: &mut RouteContext<'_>, node: &str, options: &FanOutOptions) -> Result<FanOut, BuildError> {
    let parallel = ctx.flag(node, &options.parallel_processing, false)?;
    let timeout = ctx.duration(node, &options.timeout)?.filter(|timeout| !timeout.is_zero());
    if timeout.is_some() && !parallel {
        return Err(ctx.invalid(node, "timeout requires parallel_processing"));
    }
    if !parallel && (options.executor.executor_ref.is_some() || options.executor.has_sizing()) {
        tracing::debug!(
            target: "courier::reifier",
            event = "executor_ignored",
            route = %ctx.route(),
            node = %node,
            reason = "parallel_processing is off",
        );
    }
    let pool = if parallel {
        ctx.executor(node, &options.executor, true)?
    } else {
        None
    };

    Ok(FanOut::new(FanOutSettings {
        route: ctx.route().clone(),
        node: node.to_string(),
        strategy: ctx.strategy(node, &options.aggregation_strategy, &options.aggregation_strategy_ref)?,
        pool,
        parallel_aggregate: ctx.flag(node, &options.parallel_aggregate, false)?,
        streaming: ctx.flag(node, &options.streaming, false)?,
        stop_on_exception: ctx.flag(node, &options.stop_on_exception, false)?,
        stop_on_aggregate_exception: ctx.flag(node, &options.stop_on_aggregate_exception, false)?,
        share_unit_of_work: ctx.flag(node, &options.share_unit_of_work, false)?,
        timeout,
        on_prepare: ctx.processor_ref(node, &options.on_prepare_ref)?,
    }))
}

fn delimiter(ctx: &RouteContext<'_>, node: &str, delimiter: &Option<String>) -> Result<String, BuildError> {
    match delimiter {
        Some(delimiter) => ctx.text(node, delimiter),
        None => Ok(DEFAULT_DELIMITER.to_string()),
    }
}

fn hop_delivery(
    ctx: &RouteContext<'_>,
    node: &str,
    ignore_invalid_endpoints: bool,
    cache_size: &Option<Param<usize>>,
) -> Result<HopDelivery, BuildError> {
    Ok(HopDelivery {
        route: ctx.route().clone(),
        node: node.to_string(),
        cache: ctx.endpoint_cache(node, cache_size)?,
        ignore_invalid_endpoints,
        handler: ctx.error_handler().cloned(),
    })
}

pub(super) fn multicast(
    ctx: &mut RouteContext<'_>,
    node: &str,
    definition: &MulticastDefinition,
) -> Result<SharedProcessor, BuildError> {
    let fanout = fan_out(ctx, node, &definition.options)?;
    let mut outputs = Vec::with_capacity(definition.outputs.len());
    for output in definition.outputs.iter().filter(|output| !output.is_registration()) {
        outputs.push(ctx.node(output)?);
    }
    Ok(Arc::new(MulticastProcessor::new(fanout, outputs)))
}

pub(super) fn split(
    ctx: &mut RouteContext<'_>,
    node: &str,
    definition: &SplitDefinition,
) -> Result<SharedProcessor, BuildError> {
    let expression = ctx.expression(node, &definition.expression)?;
    let delimiter = definition
        .delimiter
        .as_deref()
        .map(|delimiter| ctx.text(node, delimiter))
        .transpose()?;
    let fanout = fan_out(ctx, node, &definition.options)?;
    let output = ctx.chain(&definition.outputs)?;
    Ok(Arc::new(SplitterProcessor::new(expression, delimiter, fanout, output)))
}

pub(super) fn recipient_list(
    ctx: &mut RouteContext<'_>,
    node: &str,
    definition: &RecipientListDefinition,
) -> Result<SharedProcessor, BuildError> {
    let expression = ctx.expression(node, &definition.expression)?;
    // only evaluation runs under the error handler, each recipient's sub
    // exchange is governed by the fan-out failure policy
    let evaluation = ctx.wrap_with_error_handler(Arc::new(EvaluateRecipients::new(expression)));
    let delimiter = delimiter(ctx, node, &definition.delimiter)?;
    let ignore_invalid_endpoints = ctx.flag(node, &definition.ignore_invalid_endpoints, false)?;
    let cache = ctx.endpoint_cache(node, &definition.cache_size)?;
    let fanout = fan_out(ctx, node, &definition.options)?;
    Ok(Arc::new(RecipientListProcessor::new(
        evaluation,
        delimiter,
        ignore_invalid_endpoints,
        cache,
        fanout,
    )))
}

pub(super) fn dynamic_router(
    ctx: &mut RouteContext<'_>,
    node: &str,
    definition: &DynamicRouterDefinition,
) -> Result<SharedProcessor, BuildError> {
    let expression = ctx.expression(node, &definition.expression)?;
    let delimiter = delimiter(ctx, node, &definition.delimiter)?;
    let max_hops = match &definition.max_hops {
        Some(_) => {
            let hops = ctx.param(node, &definition.max_hops, 0usize)?;
            Some(u32::try_from(hops).unwrap_or(u32::MAX))
        }
        None => None,
    };
    let ignore = ctx.flag(node, &definition.ignore_invalid_endpoints, false)?;
    let delivery = hop_delivery(ctx, node, ignore, &definition.cache_size)?;
    Ok(Arc::new(DynamicRouterProcessor::new(expression, delimiter, max_hops, delivery)))
}

pub(super) fn routing_slip(
    ctx: &mut RouteContext<'_>,
    node: &str,
    definition: &RoutingSlipDefinition,
) -> Result<SharedProcessor, BuildError> {
    let expression = ctx.expression(node, &definition.expression)?;
    let delimiter = delimiter(ctx, node, &definition.delimiter)?;
    let ignore = ctx.flag(node, &definition.ignore_invalid_endpoints, false)?;
    let delivery = hop_delivery(ctx, node, ignore, &definition.cache_size)?;
    Ok(Arc::new(RoutingSlipProcessor::new(expression, delimiter, delivery)))
}

pub(super) fn enrich(
    ctx: &mut RouteContext<'_>,
    node: &str,
    definition: &EnrichDefinition,
) -> Result<SharedProcessor, BuildError> {
    let settings = EnrichSettings {
        aggregate_on_exception: ctx.flag(node, &definition.aggregate_on_exception, false)?,
        ignore_invalid_endpoint: ctx.flag(node, &definition.ignore_invalid_endpoint, false)?,
        share_unit_of_work: ctx.flag(node, &definition.share_unit_of_work, false)?,
    };
    Ok(Arc::new(EnrichProcessor::new(
        ctx.route().clone(),
        node.to_string(),
        ctx.expression(node, &definition.expression)?,
        ctx.strategy(node, &definition.aggregation_strategy, &definition.aggregation_strategy_ref)?,
        ctx.endpoint_cache(node, &definition.cache_size)?,
        settings,
    )))
}
