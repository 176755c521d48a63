//! PostgreSQL integration tests
//!
//! These tests run serially with a single shared PostgreSQL container.
//! The container is automatically cleaned up when the test process exits.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration
//! ```

use event_store::{
    AggregateEventStore, AggregateInspector, AggregateStreamRequest, Event, EventId,
    EventStore, EventStoreError, PostgresEventStore, StreamOptions, TypedEventStore, Version,
};
use serial_test::serial;
use sqlx::PgPool;
use std::sync::{Arc, OnceLock};
use testcontainers::{ContainerAsync, ImageExt, core::IntoContainerPort, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Container and connection string - initialized once, lives for entire test run
struct TestContainer {
    #[allow(dead_code)] // Container must stay alive for connection to work
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global container - OnceCell ensures single async initialization
static TEST_CONTAINER: OnceCell<Arc<TestContainer>> = OnceCell::const_new();

/// Store container ID for cleanup at exit
static CONTAINER_ID: OnceLock<String> = OnceLock::new();

/// Cleanup function that runs when the test process exits
#[ctor::dtor]
fn cleanup_container() {
    if let Some(container_id) = CONTAINER_ID.get() {
        // Use docker CLI to remove the container since we can't use async here
        let _ = std::process::Command::new("docker")
            .args(["rm", "-f", container_id])
            .output();
    }
}

/// Get the shared container (async, initializes on first call)
async fn get_container() -> Arc<TestContainer> {
    TEST_CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default()
                .with_tag("18-alpine")
                .start()
                .await
                .expect("Failed to start PostgreSQL container");

            // Store container ID for cleanup at exit
            let container_id = container.id().to_string();
            let _ = CONTAINER_ID.set(container_id);

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432.tcp()).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            // Run migrations
            let pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_events_table.sql"
            ))
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;

            Arc::new(TestContainer {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with cleared tables
async fn get_test_store() -> PostgresEventStore {
    let container = get_container().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(&container.connection_string)
        .await
        .unwrap();

    // Clear tables for test isolation
    sqlx::query("TRUNCATE TABLE events")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStore::new(pool)
}

fn create_test_event(aggregate_id: i64, version: u64, event_type: &str) -> Event<i64> {
    Event::builder()
        .aggregate_id(aggregate_id)
        .aggregate_type("Order")
        .event_type(event_type)
        .version(Version::new(version))
        .payload_json(serde_json::json!({"test": true}))
        .build()
}

#[tokio::test]
#[serial]
async fn append_and_load_three_events() {
    let store = get_test_store().await;

    let events = vec![
        create_test_event(1, 1, "OrderCreated"),
        create_test_event(1, 2, "ItemAdded"),
        create_test_event(1, 3, "OrderSubmitted"),
    ];

    let version = store
        .append_events(&1, events, Version::initial())
        .await
        .unwrap();
    assert_eq!(version, Version::new(3));

    let loaded = store.load_events(&1, Version::initial()).await.unwrap();
    let versions: Vec<u64> = loaded.iter().map(|e| e.version.as_u64()).collect();
    assert_eq!(versions, [1, 2, 3]);

    assert_eq!(
        store.aggregate_version(&1).await.unwrap(),
        Some(Version::new(3))
    );
}

#[tokio::test]
#[serial]
async fn concurrency_conflict_reports_expected_and_actual() {
    let store = get_test_store().await;

    store
        .append_events(
            &1,
            vec![
                create_test_event(1, 1, "OrderCreated"),
                create_test_event(1, 2, "ItemAdded"),
                create_test_event(1, 3, "OrderSubmitted"),
            ],
            Version::initial(),
        )
        .await
        .unwrap();

    let result = store
        .append_events(&1, vec![create_test_event(1, 1, "Other")], Version::initial())
        .await;

    match result {
        Err(EventStoreError::ConcurrencyConflict {
            aggregate_id,
            expected,
            actual,
        }) => {
            assert_eq!(aggregate_id, "1");
            assert_eq!(expected, Version::initial());
            assert_eq!(actual, Version::new(3));
        }
        other => panic!("expected concurrency conflict, got {other:?}"),
    }

    // The conflicting event was not persisted.
    let loaded = store.load_events(&1, Version::initial()).await.unwrap();
    assert_eq!(loaded.len(), 3);
}

#[tokio::test]
#[serial]
async fn identical_batch_retry_is_a_noop() {
    let store = get_test_store().await;

    let events = vec![
        create_test_event(1, 1, "OrderCreated"),
        create_test_event(1, 2, "ItemAdded"),
        create_test_event(1, 3, "OrderSubmitted"),
    ];

    store
        .append_events(&1, events.clone(), Version::initial())
        .await
        .unwrap();
    store
        .append_events(&1, events, Version::initial())
        .await
        .unwrap();

    let loaded = store.load_events(&1, Version::initial()).await.unwrap();
    assert_eq!(loaded.len(), 3);
}

#[tokio::test]
#[serial]
async fn conflicting_duplicate_is_rejected() {
    let store = get_test_store().await;

    let event = create_test_event(1, 1, "OrderCreated");
    store
        .append_events(&1, vec![event.clone()], Version::initial())
        .await
        .unwrap();

    // Same id, different slot.
    let mut reused = create_test_event(1, 2, "ItemAdded");
    reused.event_id = event.event_id.clone();
    let result = store
        .append_events(&1, vec![reused], Version::first())
        .await;

    assert!(matches!(
        result,
        Err(EventStoreError::EventAlreadyExists { .. })
    ));
}

#[tokio::test]
#[serial]
async fn cursor_stream_pages_deterministically() {
    let store = get_test_store().await;
    let ts = chrono::Utc::now();

    // Six events across two aggregates at one timestamp, ids e1 < ... < e6.
    for (aggregate_id, version, id) in [
        (1i64, 1u64, "e1"),
        (2, 1, "e2"),
        (1, 2, "e3"),
        (2, 2, "e4"),
        (1, 3, "e5"),
        (2, 3, "e6"),
    ] {
        let event = Event::builder()
            .event_id(EventId::new(id))
            .aggregate_id(aggregate_id)
            .aggregate_type("Order")
            .event_type("OrderEvent")
            .version(Version::new(version))
            .timestamp(ts)
            .payload_json(serde_json::json!({}))
            .build();
        store
            .append_events(&aggregate_id, vec![event], Version::new(version - 1))
            .await
            .unwrap();
    }

    let page = store
        .stream_with_cursor(StreamOptions::new().after(EventId::new("e3")).limit(2))
        .await
        .unwrap();
    let ids: Vec<&str> = page.events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, ["e4", "e5"]);
    assert_eq!(page.next_cursor, Some(EventId::new("e5")));
    assert!(page.has_more);

    let page = store
        .stream_with_cursor(StreamOptions::new().after(EventId::new("e5")).limit(2))
        .await
        .unwrap();
    let ids: Vec<&str> = page.events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, ["e6"]);
    assert!(!page.has_more);
}

#[tokio::test]
#[serial]
async fn unknown_cursor_fails() {
    let store = get_test_store().await;
    store
        .append_events(&1, vec![create_test_event(1, 1, "OrderCreated")], Version::initial())
        .await
        .unwrap();

    let result = store
        .stream_with_cursor(StreamOptions::new().after(EventId::new("missing")))
        .await;

    assert!(matches!(result, Err(EventStoreError::UnknownCursor(_))));
}

#[tokio::test]
#[serial]
async fn cursor_stream_filters_by_event_type() {
    let store = get_test_store().await;

    store
        .append_events(
            &1,
            vec![
                create_test_event(1, 1, "OrderCreated"),
                create_test_event(1, 2, "ItemAdded"),
                create_test_event(1, 3, "OrderCreated"),
            ],
            Version::initial(),
        )
        .await
        .unwrap();

    let page = store
        .stream_with_cursor(StreamOptions::new().event_type("OrderCreated"))
        .await
        .unwrap();

    assert_eq!(page.events.len(), 2);
    assert!(page.events.iter().all(|e| e.event_type == "OrderCreated"));
}

#[tokio::test]
#[serial]
async fn stream_events_orders_globally() {
    use futures_util::StreamExt;

    let store = get_test_store().await;
    store
        .append_events(&1, vec![create_test_event(1, 1, "Event1")], Version::initial())
        .await
        .unwrap();
    store
        .append_events(&2, vec![create_test_event(2, 1, "Event2")], Version::initial())
        .await
        .unwrap();

    let stream = store
        .stream_events(chrono::Utc::now() - chrono::Duration::minutes(5))
        .await
        .unwrap();
    let events: Vec<_> = stream.collect().await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.is_ok()));
}

#[tokio::test]
#[serial]
async fn load_events_by_type() {
    let store = get_test_store().await;

    store
        .append_events(&1, vec![create_test_event(1, 1, "OrderCreated")], Version::initial())
        .await
        .unwrap();
    store
        .append_events(&2, vec![create_test_event(2, 1, "OrderShipped")], Version::initial())
        .await
        .unwrap();
    store
        .append_events(&1, vec![create_test_event(1, 2, "OrderCreated")], Version::first())
        .await
        .unwrap();

    let created = store.load_events_by_type("OrderCreated").await.unwrap();
    assert_eq!(created.len(), 2);

    let shipped = store.load_events_by_type("OrderShipped").await.unwrap();
    assert_eq!(shipped.len(), 1);
}

#[tokio::test]
#[serial]
async fn stream_aggregate_pages_by_version() {
    let store = get_test_store().await;

    let events: Vec<Event<i64>> = (1..=5)
        .map(|v| create_test_event(1, v, "OrderEvent"))
        .collect();
    store
        .append_events(&1, events, Version::initial())
        .await
        .unwrap();

    let slice = store
        .stream_aggregate(AggregateStreamRequest {
            aggregate_id: 1,
            aggregate_type: "Order".to_string(),
            after_version: Version::new(2),
            limit: 2,
        })
        .await
        .unwrap();

    assert_eq!(slice.events.len(), 2);
    assert_eq!(slice.events[0].version, Version::new(3));
    assert_eq!(slice.next_version, Version::new(4));
    assert!(slice.has_more);

    let result = store
        .stream_aggregate(AggregateStreamRequest {
            aggregate_id: 99,
            aggregate_type: "Order".to_string(),
            after_version: Version::initial(),
            limit: 10,
        })
        .await;
    assert!(matches!(result, Err(EventStoreError::AggregateNotFound(_))));
}

#[tokio::test]
#[serial]
async fn has_aggregate_reflects_appends() {
    let store = get_test_store().await;

    assert!(!store.has_aggregate(&1).await.unwrap());

    store
        .append_events(&1, vec![create_test_event(1, 1, "OrderCreated")], Version::initial())
        .await
        .unwrap();
    assert!(store.has_aggregate(&1).await.unwrap());
}

#[tokio::test]
#[serial]
async fn metadata_and_schema_version_roundtrip() {
    let store = get_test_store().await;

    let event: Event<i64> = Event::builder()
        .aggregate_id(1)
        .aggregate_type("Order")
        .event_type("OrderCreated")
        .version(Version::first())
        .schema_version(2)
        .payload_json(serde_json::json!({"data": "test"}))
        .metadata("correlation_id", serde_json::json!("corr-123"))
        .metadata("tenant_id", serde_json::json!("tenant-7"))
        .build();

    store
        .append_events(&1, vec![event], Version::initial())
        .await
        .unwrap();

    let loaded = store.load_events(&1, Version::initial()).await.unwrap();
    assert_eq!(loaded.len(), 1);

    let retrieved = &loaded[0];
    assert_eq!(retrieved.schema_version, 2);
    assert!(retrieved.payload.is_json());
    assert_eq!(
        retrieved.metadata.get("correlation_id"),
        Some(&serde_json::json!("corr-123"))
    );
    assert_eq!(
        retrieved.metadata.get("tenant_id"),
        Some(&serde_json::json!("tenant-7"))
    );
}
