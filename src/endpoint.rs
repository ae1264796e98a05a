//! Endpoints, the components that create them and the bounded resolution cache.

use crate::exchange::{Exchange, ExchangeError, INTERCEPTED_ENDPOINT, TO_ENDPOINT};
use crate::expression::SharedPredicate;
use crate::processor::{take_failure, SharedProcessor};
use async_trait::async_trait;
use quick_cache::sync::Cache;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[async_trait]
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    async fn send(&self, exchange: &mut Exchange) -> Result<(), ExchangeError>;
}

pub type SharedEndpoint = Arc<dyn Endpoint>;

/// Creates endpoints for one URI scheme.
pub trait Component: Send + Sync {
    fn create_endpoint(&self, uri: &str, remaining: &str) -> Result<SharedEndpoint, String>;
}

/// Failure kind raised when a `direct:` URI has no started consumer.
pub const DIRECT_CONSUMER_NOT_AVAILABLE: &str = "DirectConsumerNotAvailable";

/// Splits `scheme:rest`; `None` when the URI has no scheme.
pub fn split_uri(uri: &str) -> Option<(&str, &str)> {
    let (scheme, remaining) = uri.split_once(':')?;
    if scheme.is_empty() {
        return None;
    }
    Some((scheme, remaining))
}

/// Processors consuming `direct:` URIs, maintained by the route lifecycle.
#[derive(Default)]
pub struct DirectConsumers {
    consumers: RwLock<HashMap<String, SharedProcessor>>,
}

impl DirectConsumers {
    pub fn register(&self, uri: &str, processor: SharedProcessor) {
        self.consumers
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(uri.to_string(), processor);
    }

    pub fn unregister(&self, uri: &str) {
        self.consumers
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .remove(uri);
    }

    fn get(&self, uri: &str) -> Option<SharedProcessor> {
        self.consumers
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(uri)
            .cloned()
    }
}

pub struct DirectComponent {
    consumers: Arc<DirectConsumers>,
}

impl DirectComponent {
    pub fn new(consumers: Arc<DirectConsumers>) -> Self {
        Self { consumers }
    }
}

impl Component for DirectComponent {
    fn create_endpoint(&self, uri: &str, remaining: &str) -> Result<SharedEndpoint, String> {
        if remaining.trim().is_empty() {
            return Err("direct endpoint requires a name".to_string());
        }
        Ok(Arc::new(DirectEndpoint {
            uri: uri.to_string(),
            consumers: self.consumers.clone(),
        }))
    }
}

/// Synchronous hand-off into the started route consuming this URI.
struct DirectEndpoint {
    uri: String,
    consumers: Arc<DirectConsumers>,
}

#[async_trait]
impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let consumer = self.consumers.get(&self.uri).ok_or_else(|| {
            ExchangeError::raised(
                DIRECT_CONSUMER_NOT_AVAILABLE,
                format!("no consumer available on endpoint `{}`", self.uri),
            )
        })?;
        let result = consumer.process(exchange).await;
        // stop and handled failures end the consuming route only
        exchange.set_route_stop(false);
        result?;
        take_failure(exchange)
    }
}

pub struct LogComponent;

impl Component for LogComponent {
    fn create_endpoint(&self, uri: &str, remaining: &str) -> Result<SharedEndpoint, String> {
        let category = remaining.split('?').next().unwrap_or_default().trim();
        if category.is_empty() {
            return Err("log endpoint requires a category".to_string());
        }
        Ok(Arc::new(LogEndpoint {
            uri: uri.to_string(),
            category: category.to_string(),
            show_headers: remaining.contains("show_headers=true"),
        }))
    }
}

struct LogEndpoint {
    uri: String,
    category: String,
    show_headers: bool,
}

#[async_trait]
impl Endpoint for LogEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        if self.show_headers {
            tracing::info!(
                target: "courier::log",
                category = %self.category,
                exchange_id = %exchange.id(),
                body = %exchange.body(),
                headers = ?exchange.headers(),
            );
        } else {
            tracing::info!(
                target: "courier::log",
                category = %self.category,
                exchange_id = %exchange.id(),
                body = %exchange.body(),
            );
        }
        Ok(())
    }
}

/// Interception installed by `intercept_send_to_endpoint`.
pub struct SendInterceptor {
    pub pattern: String,
    pub when: Option<SharedPredicate>,
    pub skip_send_to_original_endpoint: bool,
    pub processor: SharedProcessor,
}

impl SendInterceptor {
    /// Exact match, or prefix match when the pattern ends with `*`.
    pub fn matches_uri(&self, uri: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => uri.starts_with(prefix),
            None => uri == self.pattern,
        }
    }
}

struct InterceptedEndpoint {
    original: SharedEndpoint,
    interceptor: Arc<SendInterceptor>,
}

#[async_trait]
impl Endpoint for InterceptedEndpoint {
    fn uri(&self) -> &str {
        self.original.uri()
    }

    async fn send(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
        let applies = match &self.interceptor.when {
            Some(when) => when.matches(exchange)?,
            None => true,
        };
        if !applies {
            return self.original.send(exchange).await;
        }

        exchange.set_property(
            INTERCEPTED_ENDPOINT,
            JsonValue::String(self.original.uri().to_string()),
        );
        self.interceptor.processor.process(exchange).await?;
        if self.interceptor.skip_send_to_original_endpoint || exchange.is_route_stop() {
            return Ok(());
        }
        self.original.send(exchange).await
    }
}

/// Components by scheme, explicitly registered endpoints and interceptors.
#[derive(Default)]
pub struct EndpointRegistry {
    components: RwLock<HashMap<String, Arc<dyn Component>>>,
    endpoints: RwLock<HashMap<String, SharedEndpoint>>,
    interceptors: RwLock<Vec<Arc<SendInterceptor>>>,
}

impl EndpointRegistry {
    pub fn add_component(&self, scheme: impl Into<String>, component: Arc<dyn Component>) {
        self.components
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(scheme.into(), component);
    }

    pub fn add_endpoint(&self, endpoint: SharedEndpoint) {
        self.endpoints
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .insert(endpoint.uri().to_string(), endpoint);
    }

    /// Applies to every endpoint resolved from now on.
    pub fn add_interceptor(&self, interceptor: Arc<SendInterceptor>) {
        self.interceptors
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .push(interceptor);
    }

    pub fn remove_interceptor(&self, interceptor: &Arc<SendInterceptor>) {
        self.interceptors
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .retain(|registered| !Arc::ptr_eq(registered, interceptor));
    }

    pub fn resolve(&self, uri: &str) -> Result<SharedEndpoint, ExchangeError> {
        let uri = uri.trim();
        let registered = self
            .endpoints
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(uri)
            .cloned();

        let endpoint = match registered {
            Some(endpoint) => endpoint,
            None => self.create(uri)?,
        };
        Ok(self.decorate(endpoint))
    }

    fn create(&self, uri: &str) -> Result<SharedEndpoint, ExchangeError> {
        let no_such = || ExchangeError::NoSuchEndpoint {
            uri: uri.to_string(),
        };
        let (scheme, remaining) = split_uri(uri).ok_or_else(no_such)?;
        let component = self
            .components
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(scheme)
            .cloned()
            .ok_or_else(no_such)?;
        component.create_endpoint(uri, remaining).map_err(|reason| {
            tracing::debug!(
                target: "courier::endpoint",
                event = "endpoint_rejected",
                uri = %uri,
                reason = %reason,
            );
            no_such()
        })
    }

    fn decorate(&self, endpoint: SharedEndpoint) -> SharedEndpoint {
        let interceptors = self
            .interceptors
            .read()
            .unwrap_or_else(|err| err.into_inner());
        let uri = endpoint.uri().to_string();
        interceptors
            .iter()
            .filter(|interceptor| interceptor.matches_uri(&uri))
            .fold(endpoint, |original, interceptor| {
                Arc::new(InterceptedEndpoint {
                    original,
                    interceptor: interceptor.clone(),
                }) as SharedEndpoint
            })
    }
}

/// Bounded memo of URI to endpoint resolutions for dynamic destinations.
pub struct EndpointCache {
    registry: Arc<EndpointRegistry>,
    cache: Cache<String, SharedEndpoint>,
    capacity: usize,
}

impl EndpointCache {
    pub fn new(registry: Arc<EndpointRegistry>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            registry,
            cache: Cache::new(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.len() == 0
    }

    pub fn resolve(&self, uri: &str) -> Result<SharedEndpoint, ExchangeError> {
        let key = uri.trim();
        if let Some(endpoint) = self.cache.get(key) {
            return Ok(endpoint);
        }
        let endpoint = self.registry.resolve(key)?;
        self.cache.insert(key.to_string(), endpoint.clone());
        Ok(endpoint)
    }
}

/// Sends to `endpoint`, recording it as the last destination.
pub async fn send_to(endpoint: &SharedEndpoint, exchange: &mut Exchange) -> Result<(), ExchangeError> {
    exchange.set_property(TO_ENDPOINT, JsonValue::String(endpoint.uri().to_string()));
    endpoint.send(exchange).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor_fn;
    use serde_json::json;

    fn interceptor(pattern: &str, skip: bool) -> Arc<SendInterceptor> {
        Arc::new(SendInterceptor {
            pattern: pattern.to_string(),
            when: None,
            skip_send_to_original_endpoint: skip,
            processor: processor_fn(|exchange| {
                exchange.set_header("intercepted", true);
                Ok(())
            }),
        })
    }

    #[test]
    fn wildcard_patterns_match_prefixes() {
        assert!(interceptor("direct:*", false).matches_uri("direct:orders"));
        assert!(interceptor("direct:orders", false).matches_uri("direct:orders"));
        assert!(!interceptor("direct:orders", false).matches_uri("direct:orders2"));
    }

    #[tokio::test]
    async fn unknown_scheme_is_no_such_endpoint() {
        let registry = EndpointRegistry::default();
        let err = registry.resolve("mock:a").err().expect("no component");
        assert_eq!(err.kind(), "NoSuchEndpoint");
    }

    #[tokio::test]
    async fn direct_without_consumer_fails_at_send() {
        let consumers = Arc::new(DirectConsumers::default());
        let registry = EndpointRegistry::default();
        registry.add_component("direct", Arc::new(DirectComponent::new(consumers.clone())));

        let endpoint = registry.resolve("direct:a").expect("resolvable");
        let mut exchange = Exchange::new(json!(1));
        let err = endpoint.send(&mut exchange).await.unwrap_err();
        assert_eq!(err.kind(), "DirectConsumerNotAvailable");

        consumers.register("direct:a", processor_fn(|exchange| {
            exchange.set_body(json!(2));
            Ok(())
        }));
        endpoint.send(&mut exchange).await.expect("consumer present");
        assert_eq!(exchange.body(), &json!(2));
    }

    #[tokio::test]
    async fn only_matching_interceptors_decorate_an_endpoint() {
        let tagging = |pattern: &str, header: &'static str| {
            Arc::new(SendInterceptor {
                pattern: pattern.to_string(),
                when: None,
                skip_send_to_original_endpoint: false,
                processor: processor_fn(move |exchange| {
                    exchange.set_header(header, true);
                    Ok(())
                }),
            })
        };
        let consumers = Arc::new(DirectConsumers::default());
        consumers.register("direct:orders", processor_fn(|exchange| {
            exchange.set_header("delivered", true);
            Ok(())
        }));
        let registry = EndpointRegistry::default();
        registry.add_component("direct", Arc::new(DirectComponent::new(consumers)));
        registry.add_interceptor(tagging("direct:*", "any_direct"));
        registry.add_interceptor(tagging("direct:orders", "orders"));
        registry.add_interceptor(tagging("direct:billing", "billing"));

        let endpoint = registry.resolve("direct:orders").expect("resolvable");
        assert_eq!(endpoint.uri(), "direct:orders");
        let mut exchange = Exchange::new(json!(1));
        send_to(&endpoint, &mut exchange).await.expect("sent");

        assert_eq!(exchange.header("any_direct"), Some(&json!(true)));
        assert_eq!(exchange.header("orders"), Some(&json!(true)));
        assert_eq!(exchange.header("billing"), None);
        assert_eq!(exchange.header("delivered"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn interceptor_can_skip_original() {
        let consumers = Arc::new(DirectConsumers::default());
        consumers.register("direct:a", processor_fn(|exchange| {
            exchange.set_header("delivered", true);
            Ok(())
        }));
        let registry = EndpointRegistry::default();
        registry.add_component("direct", Arc::new(DirectComponent::new(consumers)));
        registry.add_interceptor(interceptor("direct:*", true));

        let cache = EndpointCache::new(Arc::new(registry), 4);
        let endpoint = cache.resolve("direct:a").expect("resolvable");
        let mut exchange = Exchange::new(json!(1));
        send_to(&endpoint, &mut exchange).await.expect("sent");

        assert_eq!(exchange.header("intercepted"), Some(&json!(true)));
        assert_eq!(exchange.header("delivered"), None);
        assert_eq!(exchange.property(INTERCEPTED_ENDPOINT), Some(&json!("direct:a")));
        assert_eq!(cache.len(), 1);
    }
}
