#![allow(dead_code)]

use async_trait::async_trait;
use courier::{CourierEngine, CourierEngineBuilder, Endpoint, Exchange, ExchangeError, RoutesDefinition};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Endpoint that records what it receives and optionally delays, replies or fails.
pub struct MockEndpoint {
    uri: String,
    delay: Option<Duration>,
    reply: Option<JsonValue>,
    failures_left: Mutex<u32>,
    received: Mutex<Vec<Exchange>>,
}

impl MockEndpoint {
    fn build(uri: &str, delay: Option<Duration>, reply: Option<JsonValue>, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.to_string(),
            delay,
            reply,
            failures_left: Mutex::new(failures),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn new(uri: &str) -> Arc<Self> {
        Self::build(uri, None, None, 0)
    }

    pub fn delayed(uri: &str, delay: Duration) -> Arc<Self> {
        Self::build(uri, Some(delay), None, 0)
    }

    pub fn replying(uri: &str, reply: JsonValue) -> Arc<Self> {
        Self::build(uri, None, Some(reply), 0)
    }

    /// Fails the first `times` sends with an `IoError`.
    pub fn failing(uri: &str, times: u32) -> Arc<Self> {
        Self::build(uri, None, None, times)
    }

    pub fn count(&self) -> usize {
        self.received.lock().expect("mock lock").len()
    }

    pub fn bodies(&self) -> Vec<JsonValue> {
        self.received
            .lock()
            .expect("mock lock")
            .iter()
            .map(|exchange| exchange.body().clone())
            .collect()
    }

    pub fn received(&self) -> Vec<Exchange> {
        self.received.lock().expect("mock lock").clone()
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.received.lock().expect("mock lock").push(exchange.clone());
        {
            let mut failures_left = self.failures_left.lock().expect("mock lock");
            if *failures_left > 0 {
                *failures_left -= 1;
                return Err(ExchangeError::raised(
                    "IoError",
                    format!("{} unavailable", self.uri),
                ));
            }
        }
        if let Some(reply) = &self.reply {
            exchange.set_body(reply.clone());
        }
        Ok(())
    }
}

pub fn routes(yaml: &str) -> RoutesDefinition {
    RoutesDefinition::from_yaml_str(yaml).expect("routes yaml should parse")
}

/// Registers `mocks` on `builder`, adds the routes of `yaml` and starts the engine.
pub fn start_engine(builder: CourierEngineBuilder, mocks: &[&Arc<MockEndpoint>], yaml: &str) -> CourierEngine {
    let builder = mocks
        .iter()
        .fold(builder, |builder, mock| builder.endpoint((*mock).clone()));
    let engine = builder.build().expect("engine build");
    engine.add_routes(routes(yaml)).expect("routes should build");
    engine.start().expect("engine start");
    engine
}

pub fn engine(mocks: &[&Arc<MockEndpoint>], yaml: &str) -> CourierEngine {
    start_engine(CourierEngine::builder(), mocks, yaml)
}
