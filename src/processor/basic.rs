use super::Processor;
use crate::definition::LoggingLevel;
use crate::endpoint::{send_to, SharedEndpoint};
use crate::exchange::{json_to_text, Exchange, ExchangeError};
use crate::expression::SharedExpression;
use async_trait::async_trait;

/// Sends to an endpoint resolved when the route was built.
pub struct SendProcessor {
    endpoint: SharedEndpoint,
}

impl SendProcessor {
    pub fn new(endpoint: SharedEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Processor for SendProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        send_to(&self.endpoint, exchange).await
    }
}

pub struct SetBodyProcessor {
    expression: SharedExpression,
}

impl SetBodyProcessor {
    pub fn new(expression: SharedExpression) -> Self {
        Self { expression }
    }
}

#[async_trait]
impl Processor for SetBodyProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let body = self.expression.evaluate(exchange)?;
        exchange.set_body(body);
        Ok(())
    }
}

pub struct SetHeaderProcessor {
    name: String,
    expression: SharedExpression,
}

impl SetHeaderProcessor {
    pub fn new(name: String, expression: SharedExpression) -> Self {
        Self { name, expression }
    }
}

#[async_trait]
impl Processor for SetHeaderProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let value = self.expression.evaluate(exchange)?;
        exchange.set_header(self.name.clone(), value);
        Ok(())
    }
}

pub struct SetPropertyProcessor {
    name: String,
    expression: SharedExpression,
}

impl SetPropertyProcessor {
    pub fn new(name: String, expression: SharedExpression) -> Self {
        Self { name, expression }
    }
}

#[async_trait]
impl Processor for SetPropertyProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let value = self.expression.evaluate(exchange)?;
        exchange.set_property(self.name.clone(), value);
        Ok(())
    }
}

pub struct RemoveHeaderProcessor {
    name: String,
}

impl RemoveHeaderProcessor {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

#[async_trait]
impl Processor for RemoveHeaderProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        exchange.remove_header(&self.name);
        Ok(())
    }
}

pub struct ThrowExceptionProcessor {
    kind: String,
    message: String,
}

impl ThrowExceptionProcessor {
    pub fn new(kind: String, message: String) -> Self {
        Self { kind, message }
    }
}

#[async_trait]
impl Processor for ThrowExceptionProcessor {
    async fn process(&self, _exchange: &mut Exchange) -> Result<(), ExchangeError> {
        Err(ExchangeError::raised(self.kind.clone(), self.message.clone()))
    }
}

/// Ends routing of the current exchange without failing it.
pub struct StopProcessor;

#[async_trait]
impl Processor for StopProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        exchange.set_route_stop(true);
        Ok(())
    }
}

pub struct LogProcessor {
    route: String,
    log_name: String,
    message: String,
    level: LoggingLevel,
}

impl LogProcessor {
    pub fn new(route: String, log_name: Option<String>, message: String, level: LoggingLevel) -> Self {
        let log_name = log_name.unwrap_or_else(|| route.clone());
        Self {
            route,
            log_name,
            message,
            level,
        }
    }
}

/// Replaces `${body}`, `${id}`, `${header.NAME}` and `${property.NAME}` in
/// `template`. Unknown placeholders are left untouched.
pub fn interpolate(template: &str, exchange: &Exchange) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = &after[..end];
        let value = match key {
            "body" => Some(json_to_text(exchange.body()).unwrap_or_default()),
            "id" => Some(exchange.id().to_string()),
            _ => key
                .strip_prefix("header.")
                .map(|name| exchange.header(name))
                .or_else(|| key.strip_prefix("property.").map(|name| exchange.property(name)))
                .map(|found| found.and_then(json_to_text).unwrap_or_default()),
        };
        match value {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[async_trait]
impl Processor for LogProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let message = interpolate(&self.message, exchange);
        let log_name = self.log_name.as_str();
        let route = self.route.as_str();
        match self.level {
            LoggingLevel::Trace => tracing::trace!(target: "courier::log", log_name, route, "{message}"),
            LoggingLevel::Debug => tracing::debug!(target: "courier::log", log_name, route, "{message}"),
            LoggingLevel::Info => tracing::info!(target: "courier::log", log_name, route, "{message}"),
            LoggingLevel::Warn => tracing::warn!(target: "courier::log", log_name, route, "{message}"),
            LoggingLevel::Error => tracing::error!(target: "courier::log", log_name, route, "{message}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interpolates_known_placeholders() {
        let mut exchange = Exchange::new(json!("hello")).with_header("user", "ada");
        exchange.set_property("step", 3);
        let text = interpolate(
            "${body} from ${header.user} at ${property.step} ${unknown} ${header.missing}|",
            &exchange,
        );
        assert_eq!(text, "hello from ada at 3 ${unknown} |");
        assert_eq!(interpolate("tail ${body", &exchange), "tail ${body");
    }

    #[tokio::test]
    async fn throw_exception_raises_kind() {
        let thrower = ThrowExceptionProcessor::new("TimeoutError".into(), "too slow".into());
        let mut exchange = Exchange::new(json!(null));
        let err = thrower.process(&mut exchange).await.unwrap_err();
        assert_eq!(err.kind(), "TimeoutError");
        assert!(!exchange.is_failed());
    }
}
