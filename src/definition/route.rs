use super::param::{DurationParam, Param};
use super::processors::{InterceptSendToEndpointDefinition, OnExceptionDefinition, ProcessorDefinition};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownRoute {
    #[default]
    Default,
    Defer,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedeliveryPolicyDefinition {
    #[serde(default)]
    pub maximum_redeliveries: Option<Param<i32>>,
    #[serde(default)]
    pub redelivery_delay: Option<DurationParam>,
    #[serde(default)]
    pub maximum_redelivery_delay: Option<DurationParam>,
    #[serde(default)]
    pub use_exponential_backoff: Option<Param<bool>>,
    #[serde(default)]
    pub backoff_multiplier: Option<Param<f64>>,
    #[serde(default)]
    pub use_collision_avoidance: Option<Param<bool>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorHandlerDefinition {
    Default {
        #[serde(default)]
        redelivery_policy: RedeliveryPolicyDefinition,
        #[serde(default)]
        on_redelivery_ref: Option<String>,
    },
    DeadLetterChannel {
        dead_letter_uri: String,
        #[serde(default)]
        redelivery_policy: RedeliveryPolicyDefinition,
        #[serde(default)]
        on_redelivery_ref: Option<String>,
        #[serde(default)]
        use_original_message: Option<Param<bool>>,
    },
    None,
}

impl Default for ErrorHandlerDefinition {
    fn default() -> Self {
        ErrorHandlerDefinition::Default {
            redelivery_policy: RedeliveryPolicyDefinition::default(),
            on_redelivery_ref: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteDefinition {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub auto_startup: Option<Param<bool>>,
    #[serde(default)]
    pub startup_order: Option<i32>,
    #[serde(default)]
    pub shutdown_route: ShutdownRoute,
    #[serde(default)]
    pub trace: Option<Param<bool>>,
    #[serde(default)]
    pub message_history: Option<Param<bool>>,
    #[serde(default)]
    pub log_mask: Option<Param<bool>>,
    #[serde(default)]
    pub stream_caching: Option<Param<bool>>,
    #[serde(default)]
    pub handle_fault: Option<Param<bool>>,
    #[serde(default)]
    pub delayer: Option<DurationParam>,
    #[serde(default)]
    pub route_policy_refs: Vec<String>,
    #[serde(default)]
    pub error_handler: Option<ErrorHandlerDefinition>,
    #[serde(default)]
    pub outputs: Vec<ProcessorDefinition>,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            description: None,
            auto_startup: None,
            startup_order: None,
            shutdown_route: ShutdownRoute::Default,
            trace: None,
            message_history: None,
            log_mask: None,
            stream_caching: None,
            handle_fault: None,
            delayer: None,
            route_policy_refs: Vec::new(),
            error_handler: None,
            outputs: Vec::new(),
        }
    }

    pub fn output(mut self, output: ProcessorDefinition) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn error_handler(mut self, error_handler: ErrorHandlerDefinition) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    /// Route-scoped exception clauses declared among the outputs.
    pub fn on_exceptions(&self) -> impl Iterator<Item = &OnExceptionDefinition> {
        self.outputs.iter().filter_map(|output| match output {
            ProcessorDefinition::OnException(clause) => Some(clause),
            _ => None,
        })
    }

    pub fn intercepts(&self) -> impl Iterator<Item = &InterceptSendToEndpointDefinition> {
        self.outputs.iter().filter_map(|output| match output {
            ProcessorDefinition::InterceptSendToEndpoint(intercept) => Some(intercept),
            _ => None,
        })
    }
}
