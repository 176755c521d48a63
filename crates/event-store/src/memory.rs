use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use common::AggregateId;

use crate::error::{EventStoreError, Result};
use crate::event::{Event, Version};
use crate::filter::filter_stream;
use crate::store::{
    AggregateEventStore, AggregateInspector, AggregateSlice, AggregateStreamRequest, CursorPage,
    EventStore, EventStream, StreamOptions, TypedEventStore, validate_events_for_append,
};

/// Per-aggregate summary kept alongside the stream for O(1) version lookup.
#[derive(Debug, Clone)]
struct AggregateSummary {
    aggregate_type: String,
    version: Version,
}

struct MemoryState<ID> {
    /// Version-ordered streams keyed `aggregate_type:aggregate_id`.
    streams: HashMap<String, Vec<Event<ID>>>,
    /// Aggregate index: current version and stream key per aggregate id.
    aggregates: HashMap<ID, AggregateSummary>,
}

/// In-memory event store implementation.
///
/// Mirrors the durable backend's contract for tests and embedded use:
/// optimistic concurrency, idempotent retries, and cursor streaming through
/// the canonical filter.
#[derive(Clone)]
pub struct InMemoryEventStore<ID> {
    state: Arc<RwLock<MemoryState<ID>>>,
}

impl<ID: AggregateId> InMemoryEventStore<ID> {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState {
                streams: HashMap::new(),
                aggregates: HashMap::new(),
            })),
        }
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        let state = self.state.read().await;
        state.streams.values().map(Vec::len).sum()
    }

    /// Clears all events.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.streams.clear();
        state.aggregates.clear();
    }

    fn stream_key(aggregate_type: &str, aggregate_id: &ID) -> String {
        format!("{aggregate_type}:{aggregate_id}")
    }

    async fn collect_all(&self) -> Vec<Event<ID>> {
        let state = self.state.read().await;
        state.streams.values().flatten().cloned().collect()
    }
}

impl<ID: AggregateId> Default for InMemoryEventStore<ID> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<ID: AggregateId> EventStore<ID> for InMemoryEventStore<ID> {
    async fn append_events(
        &self,
        aggregate_id: &ID,
        events: Vec<Event<ID>>,
        expected_version: Version,
    ) -> Result<Version> {
        // Validation runs before the write lock is taken.
        validate_events_for_append(aggregate_id, &events, expected_version)?;
        let aggregate_type = events[0].aggregate_type.clone();
        let key = Self::stream_key(&aggregate_type, aggregate_id);

        let mut state = self.state.write().await;

        let current = match state.aggregates.get(aggregate_id) {
            Some(summary) if summary.aggregate_type != aggregate_type => {
                return Err(EventStoreError::InvalidEvent {
                    event_id: events[0].event_id.to_string(),
                    event_type: events[0].event_type.clone(),
                    reason: format!(
                        "aggregate {} already exists with type {}",
                        aggregate_id, summary.aggregate_type
                    ),
                });
            }
            Some(summary) => summary.version,
            None => Version::initial(),
        };

        if current != expected_version {
            // An exact replay of an already-committed batch is a no-op.
            let stream = state.streams.get(&key);
            let replayed = stream.is_some_and(|stream| {
                events.iter().all(|e| {
                    stream
                        .get(e.version.as_u64() as usize - 1)
                        .is_some_and(|stored| stored.event_id == e.event_id)
                })
            });
            if replayed {
                return Ok(current);
            }
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_version,
                actual: current,
            });
        }

        let stream = state.streams.entry(key).or_default();
        for event in &events {
            if let Some(existing) = stream.iter().find(|e| e.event_id == event.event_id) {
                return Err(EventStoreError::EventAlreadyExists {
                    event_id: event.event_id.to_string(),
                    aggregate_id: aggregate_id.to_string(),
                    version: existing.version,
                });
            }
        }

        let appended = events.len() as u64;
        let last_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(expected_version);
        stream.extend(events);
        state.aggregates.insert(
            aggregate_id.clone(),
            AggregateSummary {
                aggregate_type,
                version: last_version,
            },
        );

        metrics::counter!("events_saved").increment(appended);
        Ok(last_version)
    }

    async fn load_events(
        &self,
        aggregate_id: &ID,
        after_version: Version,
    ) -> Result<Vec<Event<ID>>> {
        let state = self.state.read().await;
        let Some(summary) = state.aggregates.get(aggregate_id) else {
            return Ok(Vec::new());
        };

        let key = Self::stream_key(&summary.aggregate_type, aggregate_id);
        let events: Vec<Event<ID>> = state
            .streams
            .get(&key)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.version > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        metrics::counter!("events_loaded").increment(events.len() as u64);
        Ok(events)
    }

    async fn stream_events(&self, from_time: DateTime<Utc>) -> Result<EventStream<ID>> {
        use futures_util::stream;

        let mut events = self.collect_all().await;
        events.retain(|e| e.timestamp >= from_time);
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });

        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn stream_with_cursor(&self, options: StreamOptions) -> Result<CursorPage<ID>> {
        let events = self.collect_all().await;
        Ok(filter_stream(events, &options))
    }
}

#[async_trait]
impl<ID: AggregateId> AggregateInspector<ID> for InMemoryEventStore<ID> {
    async fn aggregate_version(&self, aggregate_id: &ID) -> Result<Option<Version>> {
        let state = self.state.read().await;
        Ok(state.aggregates.get(aggregate_id).map(|s| s.version))
    }
}

#[async_trait]
impl<ID: AggregateId> TypedEventStore<ID> for InMemoryEventStore<ID> {
    async fn load_events_by_type(&self, event_type: &str) -> Result<Vec<Event<ID>>> {
        let mut events = self.collect_all().await;
        events.retain(|e| e.event_type == event_type);
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        Ok(events)
    }
}

#[async_trait]
impl<ID: AggregateId> AggregateEventStore<ID> for InMemoryEventStore<ID> {
    async fn stream_aggregate(
        &self,
        request: AggregateStreamRequest<ID>,
    ) -> Result<AggregateSlice<ID>> {
        let state = self.state.read().await;
        let key = Self::stream_key(&request.aggregate_type, &request.aggregate_id);
        let stream = state
            .streams
            .get(&key)
            .ok_or_else(|| EventStoreError::AggregateNotFound(request.aggregate_id.to_string()))?;

        let mut events: Vec<Event<ID>> = stream
            .iter()
            .filter(|e| e.version > request.after_version)
            .cloned()
            .collect();
        let has_more = events.len() > request.limit;
        events.truncate(request.limit);

        let next_version = events.last().map(|e| e.version).unwrap_or(request.after_version);
        Ok(AggregateSlice {
            events,
            next_version,
            has_more,
        })
    }
}
