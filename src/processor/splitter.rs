use super::fanout::{Branch, BranchTarget, FanOut};
use super::{Processor, SharedProcessor};
use crate::exchange::{Exchange, ExchangeError, SPLIT_COMPLETE, SPLIT_INDEX, SPLIT_SIZE};
use crate::expression::SharedExpression;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

pub const DEFAULT_DELIMITER: &str = ",";

/// Splits the evaluated value into items and runs the child once per item.
pub struct SplitterProcessor {
    expression: SharedExpression,
    delimiter: String,
    fanout: FanOut,
    output: SharedProcessor,
}

impl SplitterProcessor {
    pub fn new(
        expression: SharedExpression,
        delimiter: Option<String>,
        fanout: FanOut,
        output: SharedProcessor,
    ) -> Self {
        Self {
            expression,
            delimiter: delimiter.unwrap_or_else(|| DEFAULT_DELIMITER.to_string()),
            fanout,
            output,
        }
    }
}

/// Arrays yield their elements, strings are split on `delimiter` (unless it
/// is `false`), `null` yields nothing and any other value is a single item.
pub fn split_items(value: JsonValue, delimiter: &str) -> Vec<JsonValue> {
    match value {
        JsonValue::Null => Vec::new(),
        JsonValue::Array(items) => items,
        JsonValue::String(text) if delimiter != "false" => text
            .split(delimiter)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| JsonValue::String(item.to_string()))
            .collect(),
        other => vec![other],
    }
}

#[async_trait]
impl Processor for SplitterProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let value = self.expression.evaluate(exchange)?;
        let items = split_items(value, &self.delimiter);
        let total = items.len();
        let branches = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let mut sub = exchange.copy();
                sub.set_body(item);
                sub.set_property(SPLIT_INDEX, index);
                sub.set_property(SPLIT_SIZE, total);
                sub.set_property(SPLIT_COMPLETE, index + 1 == total);
                Branch {
                    exchange: sub,
                    target: BranchTarget::Processor(self.output.clone()),
                }
            })
            .collect();
        self.fanout.run(exchange, branches).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_items_by_shape() {
        assert_eq!(split_items(json!([1, 2]), ","), vec![json!(1), json!(2)]);
        assert_eq!(
            split_items(json!("a, b,,c"), ","),
            vec![json!("a"), json!("b"), json!("c")]
        );
        assert_eq!(split_items(json!("a|b"), "false"), vec![json!("a|b")]);
        assert!(split_items(JsonValue::Null, ",").is_empty());
        assert_eq!(split_items(json!({"k": 1}), ","), vec![json!({"k": 1})]);
    }
}
