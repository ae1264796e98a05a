use crate::exchange::{Exchange, ExchangeError};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Folds completed branch exchanges into one result.
///
/// `aggregate` is called exactly once per completed branch; the first call
/// receives `None` as the accumulator.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, ExchangeError>;

    /// Called when a parallel fan-out times out before branch `index` of `total` completed.
    fn timeout(&self, _old: Option<&Exchange>, _index: usize, _total: usize, _timeout: Duration) {}
}

pub type SharedAggregationStrategy = Arc<dyn AggregationStrategy>;

impl std::fmt::Debug for dyn AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AggregationStrategy")
    }
}

/// Keeps the most recent branch result, carrying an earlier failure forward.
#[derive(Debug, Default, Clone, Copy)]
pub struct UseLatestAggregationStrategy;

impl AggregationStrategy for UseLatestAggregationStrategy {
    fn aggregate(&self, old: Option<Exchange>, mut new: Exchange) -> Result<Exchange, ExchangeError> {
        if let Some(old) = old {
            propagate_failure(&old, &mut new);
        }
        Ok(new)
    }
}

/// Collects branch bodies into a JSON array in aggregation order.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupedBodyAggregationStrategy;

impl AggregationStrategy for GroupedBodyAggregationStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, ExchangeError> {
        match old {
            None => {
                let mut first = new;
                let body = first.body().clone();
                first.set_body(JsonValue::Array(vec![body]));
                Ok(first)
            }
            Some(mut acc) => {
                match acc.body_mut() {
                    JsonValue::Array(items) => items.push(new.body().clone()),
                    other => {
                        let previous = std::mem::take(other);
                        *other = JsonValue::Array(vec![previous, new.body().clone()]);
                    }
                }
                if let Some(err) = new.exception() {
                    if acc.exception().is_none() {
                        acc.set_exception(err.clone());
                    }
                }
                Ok(acc)
            }
        }
    }
}

struct FnAggregationStrategy<F> {
    f: F,
}

impl<F> AggregationStrategy for FnAggregationStrategy<F>
where
    F: Fn(Option<Exchange>, Exchange) -> Result<Exchange, ExchangeError> + Send + Sync,
{
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, ExchangeError> {
        (self.f)(old, new)
    }
}

pub fn aggregation_fn<F>(f: F) -> SharedAggregationStrategy
where
    F: Fn(Option<Exchange>, Exchange) -> Result<Exchange, ExchangeError> + Send + Sync + 'static,
{
    Arc::new(FnAggregationStrategy { f })
}

fn propagate_failure(old: &Exchange, new: &mut Exchange) {
    if new.exception().is_none() {
        if let Some(err) = old.exception() {
            new.set_exception(err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn use_latest_keeps_newest_and_carries_failure() {
        let strategy = UseLatestAggregationStrategy;
        let mut first = Exchange::new(json!("a"));
        first.set_exception(ExchangeError::raised("Boom", "first"));
        let second = Exchange::new(json!("b"));

        let acc = strategy.aggregate(None, first).unwrap();
        let acc = strategy.aggregate(Some(acc), second).unwrap();
        assert_eq!(acc.body(), &json!("b"));
        assert_eq!(acc.exception().map(|e| e.kind()), Some("Boom"));
    }

    #[test]
    fn grouped_body_preserves_call_order() {
        let strategy = GroupedBodyAggregationStrategy;
        let mut acc = None;
        for body in ["x", "y", "z"] {
            acc = Some(strategy.aggregate(acc, Exchange::new(json!(body))).unwrap());
        }
        assert_eq!(acc.unwrap().body(), &json!(["x", "y", "z"]));
    }
}
