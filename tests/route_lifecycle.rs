#[path = "common/mod.rs"]
mod common;

use common::{engine, routes, start_engine, MockEndpoint};
use courier::route::SharedRoutePolicy;
use courier::{BuildError, CourierEngine, Error, ExchangeError, RoutePolicy, RouteStatus};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct LifecycleRecorder {
    events: Mutex<Vec<String>>,
}

impl LifecycleRecorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().expect("recorder lock").clone()
    }
}

impl RoutePolicy for LifecycleRecorder {
    fn on_start(&self, route: &str) {
        self.events.lock().expect("recorder lock").push(format!("start:{route}"));
    }

    fn on_stop(&self, route: &str) {
        self.events.lock().expect("recorder lock").push(format!("stop:{route}"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn route_without_auto_startup_waits_for_start_route() {
    let engine = engine(
        &[],
        r#"
routes:
  - id: lazy
    from: direct:lazy
    auto_startup: false
    outputs:
      - type: set_body
        expression: '"started"'
"#,
    );

    assert_eq!(engine.route_status("lazy"), Some(RouteStatus::Stopped));
    let err = engine.request("direct:lazy", json!("x")).await.expect_err("not started");
    assert_eq!(
        err,
        ExchangeError::RouteNotStarted {
            route: "lazy".to_string()
        }
    );

    engine.start_route("lazy").expect("start lazy");
    assert_eq!(engine.route_status("lazy"), Some(RouteStatus::Started));
    assert_eq!(
        engine.request("direct:lazy", json!("x")).await.expect("started"),
        json!("started")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_route_rejects_and_restarts() {
    let out = MockEndpoint::new("mock:out");
    let engine = engine(
        &[&out],
        r#"
routes:
  - id: orders
    from: direct:orders
    outputs:
      - type: to
        uri: mock:out
"#,
    );

    engine.request("direct:orders", json!(1)).await.expect("running");
    engine.stop_route("orders").await.expect("stop");
    assert_eq!(engine.route_status("orders"), Some(RouteStatus::Stopped));
    let err = engine.request("direct:orders", json!(2)).await.expect_err("stopped");
    assert_eq!(err.kind(), "RouteNotStarted");

    engine.start_route("orders").expect("restart");
    engine.request("direct:orders", json!(3)).await.expect("restarted");
    assert_eq!(out.bodies(), vec![json!(1), json!(3)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn routes_start_by_order_and_stop_in_reverse() {
    let recorder = Arc::new(LifecycleRecorder::default());
    let engine = start_engine(
        CourierEngine::builder().bind("recorder", recorder.clone() as SharedRoutePolicy),
        &[],
        r#"
routes:
  - id: a
    from: direct:a
    startup_order: 20
    shutdown_route: defer
    route_policy_refs: [recorder]
    outputs:
      - type: to
        uri: log:a
  - id: b
    from: direct:b
    startup_order: 10
    route_policy_refs: [recorder]
    outputs:
      - type: to
        uri: log:b
  - id: c
    from: direct:c
    route_policy_refs: [recorder]
    outputs:
      - type: to
        uri: log:c
"#,
    );

    engine.stop().await.expect("engine stop");
    assert_eq!(
        recorder.events(),
        vec!["start:b", "start:a", "start:c", "stop:c", "stop:b", "stop:a"]
    );
    for route in ["a", "b", "c"] {
        assert_eq!(engine.route_status(route), Some(RouteStatus::Stopped));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn extreme_startup_orders_stop_in_reverse() {
    let recorder = Arc::new(LifecycleRecorder::default());
    let engine = start_engine(
        CourierEngine::builder().bind("recorder", recorder.clone() as SharedRoutePolicy),
        &[],
        r#"
routes:
  - id: first
    from: direct:first
    startup_order: -2147483648
    route_policy_refs: [recorder]
    outputs:
      - type: to
        uri: log:first
  - id: last
    from: direct:last
    startup_order: 2147483647
    route_policy_refs: [recorder]
    outputs:
      - type: to
        uri: log:last
"#,
    );

    engine.stop().await.expect("engine stop");
    assert_eq!(
        recorder.events(),
        vec!["start:first", "start:last", "stop:last", "stop:first"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_route_ids_are_rejected() {
    let engine = engine(
        &[],
        r#"
routes:
  - id: orders
    from: direct:orders
    outputs:
      - type: to
        uri: log:orders
"#,
    );

    let err = engine
        .add_routes(routes(
            r#"
routes:
  - id: orders
    from: direct:other
    outputs:
      - type: to
        uri: log:other
"#,
        ))
        .expect_err("duplicate id");
    assert!(matches!(err, Error::Build(BuildError::DuplicateRoute { .. })));
    assert_eq!(engine.route_ids(), vec!["orders".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn routes_added_to_a_running_engine_start_immediately() {
    let engine = engine(&[], "routes: []");
    engine
        .add_routes(routes(
            r#"
routes:
  - id: late
    from: direct:late
    outputs:
      - type: set_body
        expression: '"late"'
"#,
        ))
        .expect("add late route");

    assert_eq!(engine.route_status("late"), Some(RouteStatus::Started));
    assert_eq!(
        engine.request("direct:late", json!("x")).await.expect("late route"),
        json!("late")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn two_started_routes_cannot_share_a_consumer() {
    let engine = engine(
        &[],
        r#"
routes:
  - id: first
    from: direct:shared
    outputs:
      - type: to
        uri: log:first
"#,
    );

    let err = engine
        .add_routes(routes(
            r#"
routes:
  - id: second
    from: direct:shared
    outputs:
      - type: to
        uri: log:second
"#,
        ))
        .expect_err("endpoint already consumed");
    assert!(err.to_string().contains("already consumed"), "{err}");
    assert_eq!(engine.route_status("second"), Some(RouteStatus::Stopped));
}

#[tokio::test(flavor = "multi_thread")]
async fn advice_adds_exception_clauses_to_a_running_route() {
    let flaky = MockEndpoint::failing("mock:flaky", 1);
    let engine = engine(
        &[&flaky],
        r#"
routes:
  - id: orders
    from: direct:orders
    outputs:
      - type: to
        uri: mock:flaky
"#,
    );

    engine
        .advice_with(
            "orders",
            routes(
                r#"
on_exception:
  - exceptions: [IoError]
    handled: "true"
    outputs:
      - type: set_body
        expression: '"advised"'
"#,
            ),
        )
        .await
        .expect("advice applies");

    assert_eq!(engine.route_status("orders"), Some(RouteStatus::Started));
    let body = engine.request("direct:orders", json!("x")).await.expect("handled");
    assert_eq!(body, json!("advised"));
}

#[tokio::test(flavor = "multi_thread")]
async fn advice_keeps_a_stopped_route_stopped() {
    let engine = engine(
        &[],
        r#"
routes:
  - id: idle
    from: direct:idle
    auto_startup: false
    outputs:
      - type: to
        uri: log:idle
"#,
    );

    engine
        .advice_with(
            "idle",
            routes(
                r#"
on_exception:
  - handled: "true"
"#,
            ),
        )
        .await
        .expect("advice applies");
    assert_eq!(engine.route_status("idle"), Some(RouteStatus::Stopped));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_advice_is_rejected() {
    let engine = engine(
        &[],
        r#"
routes:
  - id: orders
    from: direct:orders
    outputs:
      - type: to
        uri: log:orders
"#,
    );

    let with_routes = engine
        .advice_with(
            "orders",
            routes(
                r#"
routes:
  - id: extra
    from: direct:extra
    outputs:
      - type: stop
"#,
            ),
        )
        .await
        .expect_err("advice may not add routes");
    assert!(matches!(with_routes, Error::Build(BuildError::Advice { .. })));

    let broken = engine
        .advice_with(
            "orders",
            routes(
                r#"
on_exception:
  - exceptions: [IoError]
    handled: { language: nope, expression: x }
"#,
            ),
        )
        .await
        .expect_err("unknown language");
    assert!(matches!(broken, Error::Build(BuildError::UnknownLanguage { .. })));
    assert_eq!(engine.route_status("orders"), Some(RouteStatus::Started));

    let unknown = engine
        .advice_with("missing", routes("on_exception: []"))
        .await
        .expect_err("unknown route");
    assert!(matches!(unknown, Error::Build(BuildError::UnknownRoute { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_pools_outlive_the_routes_that_use_them() {
    use courier::config::ThreadPoolProfile;
    use courier::pool::ThreadPool;

    let out = MockEndpoint::new("mock:out");
    let shared = ThreadPool::new("shared", ThreadPoolProfile::default());
    let engine = start_engine(
        CourierEngine::builder().pool("shared", shared.clone()),
        &[&out],
        r#"
routes:
  - id: fan
    from: direct:fan
    outputs:
      - type: multicast
        parallel_processing: true
        executor_ref: shared
        outputs:
          - type: to
            uri: mock:out
          - type: to
            uri: mock:out
"#,
    );

    engine.request("direct:fan", json!(1)).await.expect("parallel multicast");
    engine.stop_route("fan").await.expect("stop");
    assert!(!shared.is_shutdown(), "referenced pools are not owned by the route");

    engine.start_route("fan").expect("restart");
    engine.request("direct:fan", json!(2)).await.expect("pool still usable");
    assert_eq!(out.count(), 4);

    engine.stop().await.expect("engine stop");
    assert!(!shared.is_shutdown());
}
