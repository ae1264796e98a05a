use courier::{CourierEngine, RoutesDefinition};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::path::PathBuf;

fn load_engine() -> CourierEngine {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/order-routes.yaml");
    let routes = RoutesDefinition::from_path(path).expect("fixture routes");
    let engine = CourierEngine::builder().build().expect("engine build");
    engine.add_routes(routes).expect("routes build");
    engine.start().expect("engine start");
    engine
}

fn bench_order_route(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let engine = load_engine();
    let order = json!({
        "priority": "high",
        "lines": [
            {"sku": "a-1", "qty": 2},
            {"sku": "b-7", "qty": 40},
            {"sku": "c-3", "qty": 5}
        ]
    });

    c.bench_function("order_route_split_multicast", |b| {
        b.iter(|| {
            let reply = runtime
                .block_on(engine.request("direct:orders", order.clone()))
                .expect("order benchmark success");
            assert_eq!(reply["accepted"], json!(true));
        });
    });

    c.bench_function("order_route_rejected", |b| {
        b.iter(|| {
            let reply = runtime
                .block_on(engine.request("direct:orders", json!({"priority": "low"})))
                .expect("rejection benchmark success");
            assert_eq!(reply["rejected"], json!(true));
        });
    });
}

criterion_group!(benches, bench_order_route);
criterion_main!(benches);
