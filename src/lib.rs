#![allow(clippy::result_large_err)]

//! Route compilation and concurrent execution engine.
//!
//! Route definitions (YAML or built in code) are reified into processor
//! trees and run by a [`CourierEngine`].

pub mod aggregation;
pub mod config;
pub mod definition;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod errorhandler;
pub mod exchange;
pub mod expression;
pub mod idempotent;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod processor;
pub mod registry;
pub mod reifier;
pub mod retry;
pub mod route;
pub mod saga;
pub mod telemetry;

pub use aggregation::{AggregationStrategy, SharedAggregationStrategy};
pub use config::EngineConfig;
pub use definition::{ProcessorDefinition, RouteDefinition, RoutesDefinition};
pub use endpoint::{Component, Endpoint, SharedEndpoint};
pub use engine::{CourierEngine, CourierEngineBuilder};
pub use error::{BuildError, Error, Result};
pub use exchange::{Exchange, ExchangeError};
pub use processor::{processor_fn, Processor, SharedProcessor};
pub use route::{RoutePolicy, RouteStatus};
