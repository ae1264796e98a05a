use super::{Processor, SharedProcessor};
use crate::exchange::{Exchange, ExchangeError, FILTER_MATCHED};
use crate::expression::SharedPredicate;
use async_trait::async_trait;

/// First matching `when` branch wins; `otherwise` runs when none match.
pub struct ChoiceProcessor {
    whens: Vec<(SharedPredicate, SharedProcessor)>,
    otherwise: Option<SharedProcessor>,
}

impl ChoiceProcessor {
    pub fn new(whens: Vec<(SharedPredicate, SharedProcessor)>, otherwise: Option<SharedProcessor>) -> Self {
        Self { whens, otherwise }
    }
}

#[async_trait]
impl Processor for ChoiceProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        for (predicate, output) in &self.whens {
            if predicate.matches(exchange)? {
                return output.process(exchange).await;
            }
        }
        match &self.otherwise {
            Some(otherwise) => otherwise.process(exchange).await,
            None => Ok(()),
        }
    }
}

pub struct FilterProcessor {
    predicate: SharedPredicate,
    output: SharedProcessor,
}

impl FilterProcessor {
    pub fn new(predicate: SharedPredicate, output: SharedProcessor) -> Self {
        Self { predicate, output }
    }
}

#[async_trait]
impl Processor for FilterProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let matched = self.predicate.matches(exchange)?;
        exchange.set_property(FILTER_MATCHED, matched);
        if matched {
            self.output.process(exchange).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::predicate_fn;
    use crate::processor::processor_fn;
    use serde_json::json;

    fn set_body(value: &'static str) -> SharedProcessor {
        processor_fn(move |exchange| {
            exchange.set_body(json!(value));
            Ok(())
        })
    }

    #[tokio::test]
    async fn first_matching_branch_wins() {
        let choice = ChoiceProcessor::new(
            vec![
                (predicate_fn(|ex| ex.header("n").is_some()), set_body("first")),
                (predicate_fn(|_| true), set_body("second")),
            ],
            Some(set_body("otherwise")),
        );
        let mut exchange = Exchange::new(json!(null)).with_header("n", 1);
        choice.process(&mut exchange).await.expect("choice");
        assert_eq!(exchange.body(), &json!("first"));

        let mut exchange = Exchange::new(json!(null));
        choice.process(&mut exchange).await.expect("choice");
        assert_eq!(exchange.body(), &json!("second"));
    }

    #[tokio::test]
    async fn filter_records_outcome() {
        let filter = FilterProcessor::new(predicate_fn(|_| false), set_body("kept"));
        let mut exchange = Exchange::new(json!("original"));
        filter.process(&mut exchange).await.expect("filter");
        assert_eq!(exchange.body(), &json!("original"));
        assert_eq!(exchange.property(FILTER_MATCHED), Some(&json!(false)));
    }
}
