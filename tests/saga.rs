#[path = "common/mod.rs"]
mod common;

use common::{start_engine, MockEndpoint};
use courier::{CourierEngine, Error};
use serde_json::json;
use std::sync::Arc;

fn saga_engine(mocks: &[&Arc<MockEndpoint>], yaml: &str) -> CourierEngine {
    start_engine(CourierEngine::builder().in_memory_saga_service(), mocks, yaml)
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_saga_runs_completion_actions() {
    let work = MockEndpoint::new("mock:work");
    let undo = MockEndpoint::new("mock:undo");
    let done = MockEndpoint::new("mock:done");
    let engine = saga_engine(
        &[&work, &undo, &done],
        r#"
routes:
  - id: booking
    from: direct:booking
    outputs:
      - type: saga
        compensation: mock:undo
        completion: mock:done
        options:
          order: .body.order
        outputs:
          - type: to
            uri: mock:work
"#,
    );

    engine.request("direct:booking", json!({"order": 7})).await.expect("saga completes");
    assert_eq!(work.count(), 1);
    assert_eq!(undo.count(), 0);
    assert_eq!(done.count(), 1);

    let completion = &done.received()[0];
    assert_eq!(completion.header("order"), Some(&json!(7)));
    assert_eq!(
        completion.header("saga_id"),
        work.received()[0].header("saga_id")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_saga_compensates_every_step_in_reverse() {
    let undo_flight = MockEndpoint::new("mock:undo-flight");
    let undo_hotel = MockEndpoint::new("mock:undo-hotel");
    let done = MockEndpoint::new("mock:done");
    let engine = saga_engine(
        &[&undo_flight, &undo_hotel, &done],
        r#"
routes:
  - id: trip
    from: direct:trip
    outputs:
      - type: saga
        compensation: mock:undo-flight
        completion: mock:done
        outputs:
          - type: to
            uri: direct:hotel
          - type: throw_exception
            kind: PaymentDeclined
            message: card declined
  - id: hotel
    from: direct:hotel
    outputs:
      - type: saga
        propagation: mandatory
        compensation: mock:undo-hotel
        outputs:
          - type: set_header
            name: hotel
            expression: '"booked"'
"#,
    );

    let err = engine.request("direct:trip", json!("trip")).await.expect_err("payment fails");
    assert_eq!(err.kind(), "PaymentDeclined");
    assert_eq!(undo_flight.count(), 1);
    assert_eq!(undo_hotel.count(), 1);
    assert_eq!(done.count(), 0);
    assert_eq!(
        undo_flight.received()[0].header("saga_id"),
        undo_hotel.received()[0].header("saga_id")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn mandatory_propagation_requires_an_active_saga() {
    let engine = saga_engine(
        &[],
        r#"
routes:
  - id: orphan
    from: direct:orphan
    outputs:
      - type: saga
        propagation: mandatory
        outputs:
          - type: to
            uri: log:orphan
"#,
    );

    let err = engine.request("direct:orphan", json!("x")).await.expect_err("no saga");
    assert_eq!(err.kind(), "SagaError");
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_saga_completes_through_the_saga_endpoint() {
    let done = MockEndpoint::new("mock:done");
    let engine = saga_engine(
        &[&done],
        r#"
routes:
  - id: manual
    from: direct:manual
    outputs:
      - type: saga
        completion_mode: manual
        completion: mock:done
        outputs:
          - type: to
            uri: log:step
      - type: choice
        when:
          - predicate: .body == "finish"
            outputs:
              - type: to
                uri: saga:complete
"#,
    );

    engine.request("direct:manual", json!("wait")).await.expect("left open");
    assert_eq!(done.count(), 0);

    engine.request("direct:manual", json!("finish")).await.expect("completed");
    assert_eq!(done.count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn saga_without_service_fails_to_build() {
    let engine = CourierEngine::builder().build().expect("engine");
    let err = engine
        .add_routes(common::routes(
            r#"
routes:
  - id: booking
    from: direct:booking
    outputs:
      - type: saga
        outputs:
          - type: to
            uri: log:booking
"#,
        ))
        .expect_err("no saga service");
    assert!(matches!(
        err,
        Error::Build(courier::BuildError::MissingSagaService { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn saga_steps_register_once_per_node_across_restarts() {
    use courier::endpoint::EndpointRegistry;
    use courier::saga::InMemorySagaService;

    let undo = MockEndpoint::new("mock:undo");
    let service = Arc::new(InMemorySagaService::new(Arc::new(EndpointRegistry::default())));
    let engine = start_engine(
        CourierEngine::builder().saga_service(service.clone()),
        &[&undo],
        r#"
routes:
  - id: trip
    from: direct:trip
    outputs:
      - type: saga
        compensation: mock:undo
        outputs:
          - type: saga
            propagation: mandatory
            compensation: mock:undo
            outputs:
              - type: log
                message: booked
"#,
    );
    assert_eq!(service.registered_steps(), 2);

    for _ in 0..2 {
        engine.stop_route("trip").await.expect("stopped");
        engine.start_route("trip").expect("restarted");
    }
    assert_eq!(service.registered_steps(), 2);

    engine.request("direct:trip", json!("go")).await.expect("saga completes");
    assert_eq!(service.active_sagas(), 0);
}
