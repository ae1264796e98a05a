#[path = "common/mod.rs"]
mod common;

use async_trait::async_trait;
use common::start_engine;
use courier::aggregation::GroupedBodyAggregationStrategy;
use courier::{CourierEngine, Exchange, ExchangeError, Processor, SharedAggregationStrategy, SharedProcessor};
use proptest::prelude::*;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

/// Sleeps for the number of milliseconds carried in the body.
struct SleepForBody;

#[async_trait]
impl Processor for SleepForBody {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let millis = exchange.body().as_u64().unwrap_or_default();
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(())
    }
}

fn split_engine(streaming: bool) -> CourierEngine {
    let routes = format!(
        r#"
routes:
  - id: split
    from: direct:split
    outputs:
      - type: split
        expression: .body
        parallel_processing: true
        streaming: {streaming}
        pool_size: 8
        aggregation_strategy_ref: grouped
        outputs:
          - type: process
            ref: sleep
"#
    );
    start_engine(
        CourierEngine::builder()
            .bind("grouped", Arc::new(GroupedBodyAggregationStrategy) as SharedAggregationStrategy)
            .bind("sleep", Arc::new(SleepForBody) as SharedProcessor),
        &[],
        &routes,
    )
}

fn sorted(mut values: Vec<u64>) -> Vec<u64> {
    values.sort_unstable();
    values
}

fn as_numbers(body: &JsonValue) -> Vec<u64> {
    body.as_array()
        .map(|items| items.iter().filter_map(JsonValue::as_u64).collect())
        .unwrap_or_default()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn parallel_split_aggregates_in_input_order(delays in prop::collection::vec(0u64..15, 1..8)) {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let body = runtime.block_on(async {
            let engine = split_engine(false);
            engine.request("direct:split", json!(delays.clone())).await.expect("split")
        });
        prop_assert_eq!(as_numbers(&body), delays);
    }

    #[test]
    fn streaming_split_aggregates_every_item(delays in prop::collection::vec(0u64..15, 1..8)) {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let body = runtime.block_on(async {
            let engine = split_engine(true);
            engine.request("direct:split", json!(delays.clone())).await.expect("split")
        });
        prop_assert_eq!(sorted(as_numbers(&body)), sorted(delays));
    }
}
