use super::param::{DurationParam, Param};
use crate::aggregation::SharedAggregationStrategy;
use crate::expression::{SharedExpression, SharedPredicate};
use crate::pool::RejectedPolicy;
use crate::processor::SharedProcessor;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// An expression in a named language (`jq` when given as bare text), or a
/// programmatic instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExpressionDefinition {
    Text(String),
    Language {
        language: String,
        expression: String,
    },
    /// Non-string YAML scalars (`true`, `3`) act as constants.
    Constant(JsonValue),
    #[serde(skip_deserializing)]
    Expression(SharedExpression),
    #[serde(skip_deserializing)]
    Predicate(SharedPredicate),
}

impl ExpressionDefinition {
    pub fn jq(text: impl Into<String>) -> Self {
        ExpressionDefinition::Text(text.into())
    }

    pub fn language(language: impl Into<String>, expression: impl Into<String>) -> Self {
        ExpressionDefinition::Language {
            language: language.into(),
            expression: expression.into(),
        }
    }
}

impl From<&str> for ExpressionDefinition {
    fn from(value: &str) -> Self {
        ExpressionDefinition::Text(value.to_string())
    }
}

impl From<SharedExpression> for ExpressionDefinition {
    fn from(value: SharedExpression) -> Self {
        ExpressionDefinition::Expression(value)
    }
}

impl From<SharedPredicate> for ExpressionDefinition {
    fn from(value: SharedPredicate) -> Self {
        ExpressionDefinition::Predicate(value)
    }
}

/// One node of a route's definition tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorDefinition {
    To {
        uri: String,
    },
    Process {
        #[serde(rename = "ref")]
        reference: String,
    },
    #[serde(skip_deserializing)]
    Instance {
        processor: SharedProcessor,
    },
    SetBody {
        expression: ExpressionDefinition,
    },
    SetHeader {
        name: String,
        expression: ExpressionDefinition,
    },
    SetProperty {
        name: String,
        expression: ExpressionDefinition,
    },
    RemoveHeader {
        name: String,
    },
    Log(LogDefinition),
    ThrowException {
        kind: String,
        #[serde(default)]
        message: String,
    },
    Stop,
    Pipeline {
        outputs: Vec<ProcessorDefinition>,
    },
    Choice(ChoiceDefinition),
    Filter {
        predicate: ExpressionDefinition,
        #[serde(default)]
        outputs: Vec<ProcessorDefinition>,
    },
    Multicast(MulticastDefinition),
    Split(SplitDefinition),
    RecipientList(RecipientListDefinition),
    DynamicRouter(DynamicRouterDefinition),
    RoutingSlip(RoutingSlipDefinition),
    Enrich(EnrichDefinition),
    IdempotentConsumer(IdempotentConsumerDefinition),
    Throttle(ThrottleDefinition),
    Threads(ThreadsDefinition),
    OnException(OnExceptionDefinition),
    OnCompletion(OnCompletionDefinition),
    Saga(SagaDefinition),
    InterceptSendToEndpoint(InterceptSendToEndpointDefinition),
}

impl ProcessorDefinition {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessorDefinition::To { .. } => "to",
            ProcessorDefinition::Process { .. } | ProcessorDefinition::Instance { .. } => {
                "process"
            }
            ProcessorDefinition::SetBody { .. } => "set_body",
            ProcessorDefinition::SetHeader { .. } => "set_header",
            ProcessorDefinition::SetProperty { .. } => "set_property",
            ProcessorDefinition::RemoveHeader { .. } => "remove_header",
            ProcessorDefinition::Log(_) => "log",
            ProcessorDefinition::ThrowException { .. } => "throw_exception",
            ProcessorDefinition::Stop => "stop",
            ProcessorDefinition::Pipeline { .. } => "pipeline",
            ProcessorDefinition::Choice(_) => "choice",
            ProcessorDefinition::Filter { .. } => "filter",
            ProcessorDefinition::Multicast(_) => "multicast",
            ProcessorDefinition::Split(_) => "split",
            ProcessorDefinition::RecipientList(_) => "recipient_list",
            ProcessorDefinition::DynamicRouter(_) => "dynamic_router",
            ProcessorDefinition::RoutingSlip(_) => "routing_slip",
            ProcessorDefinition::Enrich(_) => "enrich",
            ProcessorDefinition::IdempotentConsumer(_) => "idempotent_consumer",
            ProcessorDefinition::Throttle(_) => "throttle",
            ProcessorDefinition::Threads(_) => "threads",
            ProcessorDefinition::OnException(_) => "on_exception",
            ProcessorDefinition::OnCompletion(_) => "on_completion",
            ProcessorDefinition::Saga(_) => "saga",
            ProcessorDefinition::InterceptSendToEndpoint(_) => "intercept_send_to_endpoint",
        }
    }

    /// Nodes that register themselves on the route instead of producing a
    /// processor in the pipeline.
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            ProcessorDefinition::OnException(_)
                | ProcessorDefinition::OnCompletion(_)
                | ProcessorDefinition::InterceptSendToEndpoint(_)
        )
    }

    pub fn to(uri: impl Into<String>) -> Self {
        ProcessorDefinition::To { uri: uri.into() }
    }

    pub fn process(processor: SharedProcessor) -> Self {
        ProcessorDefinition::Instance { processor }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogDefinition {
    pub message: String,
    #[serde(default)]
    pub logging_level: LoggingLevel,
    #[serde(default)]
    pub log_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhenDefinition {
    pub predicate: ExpressionDefinition,
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChoiceDefinition {
    #[serde(default)]
    pub when: Vec<WhenDefinition>,
    #[serde(default)]
    pub otherwise: Option<Vec<ProcessorDefinition>>,
}

/// Thread pool settings shared by parallel nodes: either a reference or
/// discrete sizing, never both.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorOptions {
    #[serde(default)]
    pub executor_ref: Option<String>,
    #[serde(default)]
    pub pool_size: Option<Param<usize>>,
    #[serde(default)]
    pub max_pool_size: Option<Param<usize>>,
    #[serde(default)]
    pub max_queue_size: Option<Param<usize>>,
    #[serde(default)]
    pub rejected_policy: Option<RejectedPolicy>,
}

impl ExecutorOptions {
    pub fn has_sizing(&self) -> bool {
        self.pool_size.is_some()
            || self.max_pool_size.is_some()
            || self.max_queue_size.is_some()
            || self.rejected_policy.is_some()
    }
}

/// Options common to the fan-out family.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FanOutOptions {
    #[serde(default)]
    pub aggregation_strategy_ref: Option<String>,
    #[serde(skip)]
    pub aggregation_strategy: Option<SharedAggregationStrategy>,
    #[serde(default)]
    pub parallel_processing: Option<Param<bool>>,
    /// Accepted, but aggregation stays serialised in declaration order
    /// unless `streaming` is set.
    #[serde(default)]
    pub parallel_aggregate: Option<Param<bool>>,
    #[serde(default)]
    pub streaming: Option<Param<bool>>,
    #[serde(default)]
    pub stop_on_exception: Option<Param<bool>>,
    #[serde(default)]
    pub stop_on_aggregate_exception: Option<Param<bool>>,
    #[serde(default)]
    pub share_unit_of_work: Option<Param<bool>>,
    #[serde(default)]
    pub timeout: Option<DurationParam>,
    #[serde(default)]
    pub on_prepare_ref: Option<String>,
    #[serde(flatten)]
    pub executor: ExecutorOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MulticastDefinition {
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
    #[serde(flatten)]
    pub options: FanOutOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SplitDefinition {
    pub expression: ExpressionDefinition,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
    #[serde(flatten)]
    pub options: FanOutOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipientListDefinition {
    pub expression: ExpressionDefinition,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub ignore_invalid_endpoints: Option<Param<bool>>,
    #[serde(default)]
    pub cache_size: Option<Param<usize>>,
    #[serde(flatten)]
    pub options: FanOutOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamicRouterDefinition {
    pub expression: ExpressionDefinition,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub ignore_invalid_endpoints: Option<Param<bool>>,
    #[serde(default)]
    pub cache_size: Option<Param<usize>>,
    #[serde(default)]
    pub max_hops: Option<Param<usize>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingSlipDefinition {
    pub expression: ExpressionDefinition,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub ignore_invalid_endpoints: Option<Param<bool>>,
    #[serde(default)]
    pub cache_size: Option<Param<usize>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichDefinition {
    pub expression: ExpressionDefinition,
    #[serde(default)]
    pub aggregation_strategy_ref: Option<String>,
    #[serde(skip)]
    pub aggregation_strategy: Option<SharedAggregationStrategy>,
    #[serde(default)]
    pub aggregate_on_exception: Option<Param<bool>>,
    #[serde(default)]
    pub ignore_invalid_endpoint: Option<Param<bool>>,
    #[serde(default)]
    pub share_unit_of_work: Option<Param<bool>>,
    #[serde(default)]
    pub cache_size: Option<Param<usize>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotentConsumerDefinition {
    pub expression: ExpressionDefinition,
    pub repository_ref: String,
    #[serde(default)]
    pub eager: Option<Param<bool>>,
    #[serde(default)]
    pub completion_eager: Option<Param<bool>>,
    #[serde(default)]
    pub skip_duplicate: Option<Param<bool>>,
    #[serde(default)]
    pub remove_on_failure: Option<Param<bool>>,
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThrottleDefinition {
    /// Maximum requests per period; mandatory.
    #[serde(default)]
    pub expression: Option<ExpressionDefinition>,
    #[serde(default)]
    pub time_period: Option<DurationParam>,
    #[serde(default)]
    pub async_delayed: Option<Param<bool>>,
    #[serde(default)]
    pub caller_runs_when_rejected: Option<Param<bool>>,
    #[serde(default)]
    pub reject_execution: Option<Param<bool>>,
    #[serde(default)]
    pub executor_ref: Option<String>,
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadsDefinition {
    #[serde(flatten)]
    pub executor: ExecutorOptions,
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OnExceptionDefinition {
    /// Failure kinds this clause selects; empty selects every failure.
    #[serde(default)]
    pub exceptions: Vec<String>,
    #[serde(default)]
    pub on_when: Option<ExpressionDefinition>,
    #[serde(default)]
    pub handled: Option<ExpressionDefinition>,
    #[serde(default)]
    pub continued: Option<ExpressionDefinition>,
    #[serde(default)]
    pub retry_while: Option<ExpressionDefinition>,
    #[serde(default)]
    pub maximum_redeliveries: Option<Param<i32>>,
    #[serde(default)]
    pub redelivery_delay: Option<DurationParam>,
    #[serde(default)]
    pub on_redelivery_ref: Option<String>,
    #[serde(default)]
    pub use_original_message: Option<Param<bool>>,
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnCompletionMode {
    #[default]
    AfterConsumer,
    BeforeConsumer,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OnCompletionDefinition {
    #[serde(default)]
    pub mode: OnCompletionMode,
    #[serde(default)]
    pub on_complete_only: Option<Param<bool>>,
    #[serde(default)]
    pub on_failure_only: Option<Param<bool>>,
    #[serde(default)]
    pub on_when: Option<ExpressionDefinition>,
    #[serde(default)]
    pub parallel_processing: Option<Param<bool>>,
    #[serde(default)]
    pub executor_ref: Option<String>,
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaPropagation {
    #[default]
    Required,
    RequiresNew,
    Mandatory,
    Supports,
    NotSupported,
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaCompletionMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SagaDefinition {
    #[serde(default)]
    pub propagation: SagaPropagation,
    #[serde(default)]
    pub completion_mode: Option<SagaCompletionMode>,
    #[serde(default)]
    pub timeout: Option<DurationParam>,
    #[serde(default)]
    pub compensation: Option<String>,
    #[serde(default)]
    pub completion: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, ExpressionDefinition>,
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterceptSendToEndpointDefinition {
    pub uri: String,
    #[serde(default)]
    pub when: Option<ExpressionDefinition>,
    #[serde(default)]
    pub skip_send_to_original_endpoint: Option<Param<bool>>,
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
}
