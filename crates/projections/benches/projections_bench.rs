use std::sync::Arc;

use async_trait::async_trait;
use criterion::{Criterion, criterion_group, criterion_main};
use event_store::{Event, EventStore, InMemoryEventStore, Version};
use projections::{
    EventBus, InMemoryCheckpointStore, InMemoryEventBus, Projection, ProjectionEngine,
    ProjectionError,
};

struct NoopProjection;

#[async_trait]
impl Projection<i64> for NoopProjection {
    fn name(&self) -> &str {
        "noop"
    }

    fn event_types(&self) -> Vec<String> {
        vec!["OrderCreated".to_string()]
    }

    async fn handle(&self, _event: &Event<i64>) -> Result<(), ProjectionError> {
        Ok(())
    }

    async fn rebuild(&self, _events: &[Event<i64>]) -> Result<(), ProjectionError> {
        Ok(())
    }
}

fn make_event(aggregate_id: i64, version: u64) -> Event<i64> {
    Event::builder()
        .aggregate_id(aggregate_id)
        .aggregate_type("Order")
        .event_type("OrderCreated")
        .version(Version::new(version))
        .payload_json(serde_json::json!({"order_id": aggregate_id}))
        .build()
}

fn bench_online_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    // The engine must stay alive while the bus delivers to its handlers.
    let (_engine, bus, event) = rt.block_on(async {
        let store = Arc::new(InMemoryEventStore::<i64>::new());
        let bus = Arc::new(InMemoryEventBus::<i64>::new());
        let engine = ProjectionEngine::builder(store, bus.clone()).build();
        engine.register(Arc::new(NoopProjection)).await.unwrap();
        engine.start("noop").await.unwrap();
        (engine, bus, make_event(1, 1))
    });

    c.bench_function("projections/online_dispatch", |b| {
        b.iter(|| {
            rt.block_on(async {
                bus.publish(&event).await.unwrap();
            });
        });
    });
}

fn bench_replay_1000_events(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("projections/replay_1000_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = Arc::new(InMemoryEventStore::<i64>::new());
                let events: Vec<Event<i64>> = (1..=1000).map(|v| make_event(1, v)).collect();
                store
                    .append_events(&1, events, Version::initial())
                    .await
                    .unwrap();

                let bus = Arc::new(InMemoryEventBus::<i64>::new());
                let engine = ProjectionEngine::builder(store, bus)
                    .checkpoint_store(Arc::new(InMemoryCheckpointStore::new()))
                    .build();
                engine.register(Arc::new(NoopProjection)).await.unwrap();
                engine.resume_from_checkpoint("noop").await.unwrap();
            });
        });
    });
}

fn bench_rebuild_1000_events(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let (engine, events) = rt.block_on(async {
        let store = Arc::new(InMemoryEventStore::<i64>::new());
        let bus = Arc::new(InMemoryEventBus::<i64>::new());
        let engine = ProjectionEngine::builder(store, bus)
            .checkpoint_store(Arc::new(InMemoryCheckpointStore::new()))
            .build();
        engine.register(Arc::new(NoopProjection)).await.unwrap();
        let events: Vec<Event<i64>> = (1..=1000).map(|v| make_event(1, v)).collect();
        (engine, events)
    });

    c.bench_function("projections/rebuild_1000_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine.rebuild("noop", &events).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_online_dispatch,
    bench_replay_1000_events,
    bench_rebuild_1000_events
);
criterion_main!(benches);
