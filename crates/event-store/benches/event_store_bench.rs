use criterion::{Criterion, criterion_group, criterion_main};
use event_store::{Event, EventStore, InMemoryEventStore, StreamOptions, Version};

fn make_event(aggregate_id: i64, version: u64) -> Event<i64> {
    Event::builder()
        .aggregate_id(aggregate_id)
        .aggregate_type("Order")
        .event_type("OrderCreated")
        .version(Version::new(version))
        .payload_json(serde_json::json!({
            "type": "OrderCreated",
            "data": {
                "order_id": aggregate_id,
                "customer_id": 1
            }
        }))
        .build()
}

fn bench_append_single_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_single_event", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                store
                    .append_events(&1, vec![make_event(1, 1)], Version::initial())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_append_batch_10(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_batch_10", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let events: Vec<Event<i64>> = (1..=10).map(|v| make_event(1, v)).collect();
                store
                    .append_events(&1, events, Version::initial())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_load_events_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();

    // Pre-populate with 100 events
    rt.block_on(async {
        let events: Vec<Event<i64>> = (1..=100).map(|v| make_event(1, v)).collect();
        store
            .append_events(&1, events, Version::initial())
            .await
            .unwrap();
    });

    c.bench_function("event_store/load_events_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let events = store.load_events(&1, Version::initial()).await.unwrap();
                assert_eq!(events.len(), 100);
            });
        });
    });
}

fn bench_stream_with_cursor(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();

    rt.block_on(async {
        for aggregate_id in 1..=20i64 {
            let events: Vec<Event<i64>> =
                (1..=50).map(|v| make_event(aggregate_id, v)).collect();
            store
                .append_events(&aggregate_id, events, Version::initial())
                .await
                .unwrap();
        }
    });

    c.bench_function("event_store/stream_with_cursor_page_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let page = store
                    .stream_with_cursor(StreamOptions::new().limit(100))
                    .await
                    .unwrap();
                assert_eq!(page.events.len(), 100);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_append_single_event,
    bench_append_batch_10,
    bench_load_events_100,
    bench_stream_with_cursor
);
criterion_main!(benches);
