#[path = "common/mod.rs"]
mod common;

use common::{engine, MockEndpoint};
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn redelivery_retries_the_failing_node() {
    let flaky = MockEndpoint::failing("mock:flaky", 2);
    let engine = engine(
        &[&flaky],
        r#"
routes:
  - id: retried
    from: direct:retried
    error_handler:
      type: default
      redelivery_policy:
        maximum_redeliveries: 3
        redelivery_delay: 0
    outputs:
      - type: to
        uri: mock:flaky
"#,
    );

    engine.request("direct:retried", json!("x")).await.expect("third attempt succeeds");
    assert_eq!(flaky.count(), 3);
    let last = flaky.received().pop().expect("three deliveries");
    assert_eq!(last.header("redelivered"), Some(&json!(true)));
    assert_eq!(last.header("redelivery_counter"), Some(&json!(2)));
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_redeliveries_surface_the_failure() {
    let flaky = MockEndpoint::failing("mock:flaky", 10);
    let engine = engine(
        &[&flaky],
        r#"
routes:
  - id: retried
    from: direct:retried
    error_handler:
      type: default
      redelivery_policy:
        maximum_redeliveries: 2
        redelivery_delay: 1ms
    outputs:
      - type: to
        uri: mock:flaky
"#,
    );

    let err = engine.request("direct:retried", json!("x")).await.expect_err("exhausted");
    assert_eq!(err.kind(), "IoError");
    assert_eq!(flaky.count(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_letter_channel_takes_the_failed_exchange() {
    let flaky = MockEndpoint::failing("mock:flaky", 10);
    let dead = MockEndpoint::new("mock:dead");
    let after = MockEndpoint::new("mock:after");
    let engine = engine(
        &[&flaky, &dead, &after],
        r#"
routes:
  - id: dlc
    from: direct:dlc
    error_handler:
      type: dead_letter_channel
      dead_letter_uri: mock:dead
    outputs:
      - type: to
        uri: mock:flaky
      - type: to
        uri: mock:after
"#,
    );

    let body = engine.request("direct:dlc", json!("order")).await.expect("dead lettered");
    assert_eq!(body, json!("order"));
    assert_eq!(dead.count(), 1);
    assert_eq!(after.count(), 0);

    let dead_lettered = &dead.received()[0];
    assert_eq!(
        dead_lettered.property("failure_endpoint"),
        Some(&json!("mock:dead"))
    );
    assert_eq!(
        dead_lettered
            .property("exception_caught")
            .and_then(|caught| caught.get("kind")),
        Some(&json!("IoError"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn context_clause_can_continue_the_route() {
    let flaky = MockEndpoint::failing("mock:flaky", 1);
    let after = MockEndpoint::new("mock:after");
    let engine = engine(
        &[&flaky, &after],
        r#"
on_exception:
  - exceptions: [IoError]
    continued: "true"
routes:
  - id: continued
    from: direct:continued
    outputs:
      - type: to
        uri: mock:flaky
      - type: to
        uri: mock:after
"#,
    );

    engine.request("direct:continued", json!("x")).await.expect("continued");
    assert_eq!(flaky.count(), 1);
    assert_eq!(after.count(), 1);
    assert_eq!(after.received()[0].property("exception_caught"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn route_clause_outranks_context_clause() {
    let flaky = MockEndpoint::failing("mock:flaky", 1);
    let engine = engine(
        &[&flaky],
        r#"
on_exception:
  - exceptions: [IoError]
    handled: "true"
    outputs:
      - type: set_body
        expression: '"context"'
routes:
  - id: scoped
    from: direct:scoped
    outputs:
      - type: on_exception
        exceptions: [IoError]
        handled: "true"
        outputs:
          - type: set_body
            expression: '"route"'
      - type: to
        uri: mock:flaky
"#,
    );

    let body = engine.request("direct:scoped", json!("x")).await.expect("handled");
    assert_eq!(body, json!("route"));
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_while_bounds_redeliveries() {
    let flaky = MockEndpoint::failing("mock:flaky", 10);
    let engine = engine(
        &[&flaky],
        r#"
routes:
  - id: retry_while
    from: direct:retry_while
    outputs:
      - type: on_exception
        exceptions: [IoError]
        retry_while: .headers.redelivery_counter != 2
        redelivery_delay: 0
      - type: to
        uri: mock:flaky
"#,
    );

    let err = engine.request("direct:retry_while", json!("x")).await.expect_err("gives up");
    assert_eq!(err.kind(), "IoError");
    assert_eq!(flaky.count(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn on_completion_hooks_filter_by_outcome() {
    let done = MockEndpoint::new("mock:done");
    let failed = MockEndpoint::new("mock:failed");
    let engine = engine(
        &[&done, &failed],
        r#"
routes:
  - id: ok
    from: direct:ok
    outputs:
      - type: on_completion
        on_complete_only: true
        outputs:
          - type: to
            uri: mock:done
      - type: on_completion
        on_failure_only: true
        outputs:
          - type: to
            uri: mock:failed
      - type: set_body
        expression: '"processed"'
  - id: broken
    from: direct:broken
    outputs:
      - type: on_completion
        on_failure_only: true
        outputs:
          - type: to
            uri: mock:failed
      - type: throw_exception
        kind: Invalid
        message: rejected order
"#,
    );

    engine.request("direct:ok", json!("x")).await.expect("ok route");
    assert_eq!(done.bodies(), vec![json!("processed")]);
    assert_eq!(failed.count(), 0);

    let err = engine.request("direct:broken", json!("y")).await.expect_err("broken route");
    assert_eq!(err.kind(), "Invalid");
    assert_eq!(failed.count(), 1);
    assert_eq!(
        failed.received()[0]
            .property("exception_caught")
            .and_then(|caught| caught.get("kind")),
        Some(&json!("Invalid"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn before_consumer_hook_shapes_the_reply() {
    let engine = engine(
        &[],
        r#"
routes:
  - id: reply
    from: direct:reply
    outputs:
      - type: on_completion
        mode: before_consumer
        outputs:
          - type: set_header
            name: completed
            expression: true
      - type: set_body
        expression: .headers
"#,
    );

    let exchange = engine
        .send("direct:reply", courier::Exchange::new(json!("x")))
        .await;
    assert!(exchange.exception().is_none());
    assert_eq!(exchange.header("completed"), Some(&json!(true)));
    assert_eq!(exchange.body(), &json!({}));
}

#[tokio::test(flavor = "multi_thread")]
async fn slip_and_router_expression_failures_reach_exception_clauses() {
    let target = MockEndpoint::new("mock:target");
    let engine = engine(
        &[&target],
        r#"
on_exception:
  - exceptions: [ExpressionError]
    handled: "true"
    outputs:
      - type: set_body
        expression: '"recovered"'
routes:
  - id: slip
    from: direct:slip
    outputs:
      - type: routing_slip
        expression: .body.route
      - type: to
        uri: mock:target
  - id: router
    from: direct:router
    outputs:
      - type: dynamic_router
        expression: .body.route
      - type: to
        uri: mock:target
"#,
    );

    let slip = engine.request("direct:slip", json!("plain-string")).await.expect("handled");
    assert_eq!(slip, json!("recovered"));
    let router = engine.request("direct:router", json!("plain-string")).await.expect("handled");
    assert_eq!(router, json!("recovered"));
    assert_eq!(target.count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn original_message_is_the_route_input_not_the_failing_node_input() {
    let flaky = MockEndpoint::failing("mock:flaky", 10);
    let dead = MockEndpoint::new("mock:dead");
    let engine = engine(
        &[&flaky, &dead],
        r#"
routes:
  - id: orders
    from: direct:orders
    error_handler:
      type: dead_letter_channel
      dead_letter_uri: mock:dead
      use_original_message: true
    outputs:
      - type: set_body
        expression: '"enriched"'
      - type: set_header
        name: stage
        expression: '"enriched"'
      - type: to
        uri: mock:flaky
"#,
    );

    engine.request("direct:orders", json!({"id": 7})).await.expect("dead lettered");
    assert_eq!(flaky.bodies(), vec![json!("enriched")]);
    let dead_lettered = &dead.received()[0];
    assert_eq!(dead_lettered.body(), &json!({"id": 7}));
    assert_eq!(dead_lettered.header("stage"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn original_message_spans_direct_sub_routes() {
    let flaky = MockEndpoint::failing("mock:flaky", 10);
    let engine = engine(
        &[&flaky],
        r#"
on_exception:
  - exceptions: [IoError]
    handled: "true"
    use_original_message: true
routes:
  - id: entry
    from: direct:entry
    outputs:
      - type: to
        uri: direct:inner
  - id: inner
    from: direct:inner
    outputs:
      - type: set_body
        expression: '"rewritten"'
      - type: to
        uri: mock:flaky
"#,
    );

    let reply = engine.request("direct:entry", json!("input")).await.expect("handled");
    assert_eq!(reply, json!("input"));
}
