//! Serde-native definition tree consumed by reification.

pub mod param;
pub mod processors;
pub mod route;

pub use param::{DurationParam, Param};
pub use processors::*;
pub use route::{ErrorHandlerDefinition, RedeliveryPolicyDefinition, RouteDefinition, ShutdownRoute};

use crate::error::Result;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

/// A set of routes plus the context-scoped clauses that apply to all of them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutesDefinition {
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
    /// Applied to every route after the route's own clauses.
    #[serde(default)]
    pub on_exception: Vec<OnExceptionDefinition>,
    #[serde(default)]
    pub intercept_send_to_endpoint: Vec<InterceptSendToEndpointDefinition>,
    #[serde(default)]
    pub error_handler: Option<ErrorHandlerDefinition>,
}

impl RoutesDefinition {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_yaml::from_reader(reader)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn route(mut self, route: RouteDefinition) -> Self {
        self.routes.push(route);
        self
    }

    /// Whether this builder only adds clauses and carries no routes of its own.
    pub fn is_clause_only(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_definitions_deserialize() {
        let routes = RoutesDefinition::from_yaml_str(
            r#"
routes:
  - id: orders
    from: direct:orders
    outputs:
      - type: multicast
        parallel_processing: true
        timeout: 250ms
        pool_size: 4
        outputs:
          - type: to
            uri: direct:a
          - type: set_header
            name: region
            expression: { language: constant, expression: eu }
      - type: stop
on_exception:
  - exceptions: [Timeout]
    handled: "true"
"#,
        )
        .expect("valid yaml");

        let route = &routes.routes[0];
        assert_eq!(route.id, "orders");
        let ProcessorDefinition::Multicast(multicast) = &route.outputs[0] else {
            panic!("expected multicast, got {:?}", route.outputs[0]);
        };
        assert_eq!(multicast.outputs.len(), 2);
        assert_eq!(multicast.options.parallel_processing, Some(Param::Value(true)));
        assert_eq!(
            multicast.options.timeout,
            Some(DurationParam::Text("250ms".into()))
        );
        assert_eq!(multicast.options.executor.pool_size, Some(Param::Value(4)));
        assert_eq!(route.outputs[1].kind(), "stop");
        assert_eq!(routes.on_exception[0].exceptions, vec!["Timeout".to_string()]);
    }
}
