//! Shared execution core for multicast, split and recipient list.
//!
//! Sequential fan-out runs branches in declaration order and aggregates in
//! that order. Parallel fan-out submits one task per branch to the node's
//! pool; results are aggregated in declaration order once all branches are
//! done, or in completion order when `streaming` is set.

use crate::aggregation::SharedAggregationStrategy;
use crate::endpoint::{send_to, SharedEndpoint};
use crate::exchange::{Exchange, ExchangeError};
use crate::metrics::metrics;
use crate::pool::PoolHandle;
use crate::processor::{take_failure, SharedProcessor};
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub struct FanOutSettings {
    pub route: Arc<str>,
    pub node: String,
    pub strategy: SharedAggregationStrategy,
    /// Present when parallel processing is enabled.
    pub pool: Option<PoolHandle>,
    /// Accepted for compatibility. The fold always runs on the calling task,
    /// so this never reorders or overlaps strategy calls.
    pub parallel_aggregate: bool,
    pub streaming: bool,
    pub stop_on_exception: bool,
    pub stop_on_aggregate_exception: bool,
    pub share_unit_of_work: bool,
    pub timeout: Option<Duration>,
    pub on_prepare: Option<SharedProcessor>,
}

#[derive(Clone)]
pub enum BranchTarget {
    Processor(SharedProcessor),
    Endpoint(SharedEndpoint),
}

impl BranchTarget {
    async fn run(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        match self {
            BranchTarget::Processor(processor) => processor.process(exchange).await,
            BranchTarget::Endpoint(endpoint) => send_to(endpoint, exchange).await,
        }
    }
}

pub struct Branch {
    pub exchange: Exchange,
    pub target: BranchTarget,
}

pub struct FanOut {
    settings: FanOutSettings,
}

/// Accumulator state threaded through one fan-out run.
struct Aggregation<'a> {
    settings: &'a FanOutSettings,
    result: Option<Exchange>,
    aggregate_error: Option<ExchangeError>,
    branch_failure: Option<ExchangeError>,
}

impl<'a> Aggregation<'a> {
    fn new(settings: &'a FanOutSettings) -> Self {
        Self {
            settings,
            result: None,
            aggregate_error: None,
            branch_failure: None,
        }
    }

    /// Folds one finished branch. `Err` means the fan-out must stop now.
    fn fold(&mut self, original: &mut Exchange, mut branch: Exchange) -> Result<(), ExchangeError> {
        let failure = branch.exception().cloned();
        if self.settings.share_unit_of_work {
            branch.handover_synchronizations(original);
        } else {
            branch.done();
        }
        if let Some(err) = &failure {
            if self.branch_failure.is_none() {
                self.branch_failure = Some(err.clone());
            }
        }

        match self.settings.strategy.aggregate(self.result.take(), branch) {
            Ok(aggregated) => self.result = Some(aggregated),
            Err(err) => {
                tracing::warn!(
                    target: "courier::fanout",
                    event = "aggregation_failed",
                    route = %self.settings.route,
                    node = %self.settings.node,
                    error = %err,
                );
                if self.settings.stop_on_aggregate_exception {
                    return Err(err);
                }
                if self.aggregate_error.is_none() {
                    self.aggregate_error = Some(err);
                }
            }
        }

        match failure {
            Some(err) if self.settings.stop_on_exception => Err(err),
            _ => Ok(()),
        }
    }

    fn finish(self, original: &mut Exchange, stopped: Option<ExchangeError>) -> Result<(), ExchangeError> {
        if let Some(result) = &self.result {
            original.copy_results_from(result);
        }
        if let Some(err) = stopped {
            original.take_exception();
            return Err(err);
        }
        if let Some(err) = self.aggregate_error {
            original.take_exception();
            return Err(err);
        }
        if self.settings.share_unit_of_work {
            if let Some(err) = self.branch_failure {
                original.take_exception();
                return Err(err);
            }
        }
        take_failure(original)
    }
}

impl FanOut {
    pub fn new(settings: FanOutSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FanOutSettings {
        &self.settings
    }

    pub async fn run(&self, original: &mut Exchange, branches: Vec<Branch>) -> Result<(), ExchangeError> {
        if branches.is_empty() {
            return Ok(());
        }
        match &self.settings.pool {
            Some(pool) => self.run_parallel(pool, original, branches).await,
            None => self.run_sequential(original, branches).await,
        }
    }

    async fn prepare(&self, exchange: &mut Exchange) {
        if let Some(on_prepare) = &self.settings.on_prepare {
            if let Err(err) = on_prepare.process(exchange).await {
                exchange.set_exception(err);
            }
        }
    }

    async fn run_sequential(&self, original: &mut Exchange, branches: Vec<Branch>) -> Result<(), ExchangeError> {
        let mut aggregation = Aggregation::new(&self.settings);
        let mut stopped = None;
        for mut branch in branches {
            self.prepare(&mut branch.exchange).await;
            if !branch.exchange.is_failed() {
                if let Err(err) = branch.target.run(&mut branch.exchange).await {
                    branch.exchange.set_exception(err);
                }
            }
            if let Err(err) = aggregation.fold(original, branch.exchange) {
                stopped = Some(err);
                break;
            }
        }
        aggregation.finish(original, stopped)
    }

    async fn run_parallel(
        &self,
        pool: &PoolHandle,
        original: &mut Exchange,
        branches: Vec<Branch>,
    ) -> Result<(), ExchangeError> {
        let total = branches.len();
        let on_prepare = self.settings.on_prepare.clone();
        let mut tasks = FuturesUnordered::new();
        for (index, branch) in branches.into_iter().enumerate() {
            let Branch {
                exchange: mut sub,
                target,
            } = branch;
            let fallback = sub.copy();
            let on_prepare = on_prepare.clone();
            let task = pool.pool().submit(async move {
                if let Some(on_prepare) = on_prepare {
                    if let Err(err) = on_prepare.process(&mut sub).await {
                        sub.set_exception(err);
                    }
                }
                if !sub.is_failed() {
                    if let Err(err) = target.run(&mut sub).await {
                        sub.set_exception(err);
                    }
                }
                sub
            })?;
            tasks.push(task.map(move |outcome| {
                let exchange = outcome.unwrap_or_else(|err| {
                    let mut failed = fallback;
                    failed.set_exception(err);
                    failed
                });
                (index, exchange)
            }));
        }

        let in_order = !self.settings.streaming;
        let deadline = self.settings.timeout.map(|timeout| Instant::now() + timeout);
        let mut aggregation = Aggregation::new(&self.settings);
        let mut completed: Vec<Option<Exchange>> = (0..total).map(|_| None).collect();
        let mut done = vec![false; total];
        let mut next_in_order = 0;
        let mut stopped = None;

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, tasks.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.on_timeout(&aggregation, &done, total);
                        break;
                    }
                },
                None => tasks.next().await,
            };
            let Some((index, exchange)) = next else {
                break;
            };
            done[index] = true;

            let outcome = if in_order {
                completed[index] = Some(exchange);
                let mut outcome = Ok(());
                while next_in_order < total {
                    let Some(ready) = completed[next_in_order].take() else {
                        break;
                    };
                    next_in_order += 1;
                    outcome = aggregation.fold(original, ready);
                    if outcome.is_err() {
                        break;
                    }
                }
                outcome
            } else {
                aggregation.fold(original, exchange)
            };

            if let Err(err) = outcome {
                stopped = Some(err);
                break;
            }
        }
        // aborts branches still running
        drop(tasks);

        if stopped.is_none() && in_order {
            // after a timeout, fold whatever completed behind the first gap
            for slot in completed.iter_mut().skip(next_in_order) {
                if let Some(ready) = slot.take() {
                    if let Err(err) = aggregation.fold(original, ready) {
                        stopped = Some(err);
                        break;
                    }
                }
            }
        }

        aggregation.finish(original, stopped)
    }

    fn on_timeout(&self, aggregation: &Aggregation<'_>, done: &[bool], total: usize) {
        let timeout = self.settings.timeout.unwrap_or_default();
        let pending = done.iter().filter(|finished| !**finished).count();
        metrics().record_fanout_timeout(&self.settings.route);
        tracing::warn!(
            target: "courier::fanout",
            event = "fanout_timeout",
            route = %self.settings.route,
            node = %self.settings.node,
            timeout_ms = timeout.as_millis() as u64,
            pending,
            total,
        );
        for (index, finished) in done.iter().enumerate() {
            if !finished {
                self.settings
                    .strategy
                    .timeout(aggregation.result.as_ref(), index, total, timeout);
            }
        }
    }
}
