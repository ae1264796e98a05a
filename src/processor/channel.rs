//! Per-node wrapper applying the route's trace, history, delay and fault flags.

use super::{Processor, SharedProcessor};
use crate::exchange::{json_to_text, Exchange, ExchangeError, MESSAGE_HISTORY};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

/// Property a processor sets to flag its reply as a fault.
pub const FAULT: &str = "fault";
const MASK: &str = "xxxxx";

#[derive(Debug, Clone, Default)]
pub struct ChannelFlags {
    pub trace: bool,
    pub message_history: bool,
    pub log_mask: bool,
    pub handle_fault: bool,
    pub delayer: Option<Duration>,
}

impl ChannelFlags {
    /// No flag set; the node can run unwrapped.
    pub fn is_passthrough(&self) -> bool {
        !(self.trace || self.message_history || self.handle_fault) && self.delayer.is_none()
    }
}

pub struct Channel {
    route: Arc<str>,
    node: String,
    inner: SharedProcessor,
    flags: ChannelFlags,
}

impl Channel {
    pub fn new(route: Arc<str>, node: String, inner: SharedProcessor, flags: ChannelFlags) -> Self {
        Self {
            route,
            node,
            inner,
            flags,
        }
    }

    fn trace(&self, exchange: &Exchange) {
        if self.flags.log_mask {
            tracing::debug!(
                target: "courier::trace",
                route = %self.route,
                node = %self.node,
                exchange_id = %exchange.id(),
                body = MASK,
                headers = MASK,
            );
        } else {
            tracing::debug!(
                target: "courier::trace",
                route = %self.route,
                node = %self.node,
                exchange_id = %exchange.id(),
                body = %exchange.body(),
                headers = ?exchange.headers(),
            );
        }
    }

    fn record_history(&self, exchange: &mut Exchange) {
        let entry = json!({ "route": &*self.route, "node": &self.node });
        let mut history = match exchange.remove_property(MESSAGE_HISTORY) {
            Some(JsonValue::Array(entries)) => entries,
            _ => Vec::new(),
        };
        history.push(entry);
        exchange.set_property(MESSAGE_HISTORY, JsonValue::Array(history));
    }
}

#[async_trait]
impl Processor for Channel {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        if let Some(delay) = self.flags.delayer {
            tokio::time::sleep(delay).await;
        }
        if self.flags.trace {
            self.trace(exchange);
        }
        if self.flags.message_history {
            self.record_history(exchange);
        }

        self.inner.process(exchange).await?;

        if self.flags.handle_fault {
            if let Some(fault) = exchange.remove_property(FAULT) {
                let message = json_to_text(&fault).unwrap_or_default();
                return Err(ExchangeError::raised("Fault", message));
            }
        }
        Ok(())
    }
}
