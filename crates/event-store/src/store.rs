use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;

use common::AggregateId;

use crate::error::{EventStoreError, Result};
use crate::event::{Event, EventId, Version};

/// Default page size for cursor streaming.
pub const DEFAULT_STREAM_LIMIT: usize = 1000;

/// Upper bound on the page size a caller may request.
pub const MAX_STREAM_LIMIT: usize = 10_000;

/// Options for streaming events with a cursor.
///
/// The cursor is the id of the last event of the previous page; the stream
/// resumes strictly after it in `(timestamp, event_id)` order. The in-memory
/// backend degrades to an id-only comparison when the cursor id is unknown;
/// the durable backend rejects it with [`EventStoreError::UnknownCursor`].
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Resume strictly after this event id.
    pub after: Option<EventId>,

    /// Maximum number of events per page. Defaults to
    /// [`DEFAULT_STREAM_LIMIT`], capped at [`MAX_STREAM_LIMIT`].
    pub limit: Option<usize>,

    /// Restrict to these event types (any of them). Empty means all.
    pub event_types: Vec<String>,

    /// Restrict to these aggregate types (any of them). Empty means all.
    pub aggregate_types: Vec<String>,

    /// Restrict to events at or after this timestamp.
    pub from_time: Option<DateTime<Utc>>,

    /// Restrict to events at or before this timestamp.
    pub to_time: Option<DateTime<Utc>>,
}

impl StreamOptions {
    /// Creates empty options: all events, default page size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes strictly after the given event id.
    pub fn after(mut self, cursor: EventId) -> Self {
        self.after = Some(cursor);
        self
    }

    /// Sets the page size.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Restricts to a single event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.push(event_type.into());
        self
    }

    /// Restricts to the given event types.
    pub fn event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = event_types;
        self
    }

    /// Restricts to the given aggregate types.
    pub fn aggregate_types(mut self, aggregate_types: Vec<String>) -> Self {
        self.aggregate_types = aggregate_types;
        self
    }

    /// Restricts to events at or after this timestamp.
    pub fn from_time(mut self, from: DateTime<Utc>) -> Self {
        self.from_time = Some(from);
        self
    }

    /// Restricts to events at or before this timestamp.
    pub fn to_time(mut self, to: DateTime<Utc>) -> Self {
        self.to_time = Some(to);
        self
    }

    /// The effective page size after defaulting and capping.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_STREAM_LIMIT)
            .clamp(1, MAX_STREAM_LIMIT)
    }
}

/// One page of a cursor stream.
#[derive(Debug, Clone)]
pub struct CursorPage<ID> {
    /// The events of this page, ordered by `(timestamp, event_id)`.
    pub events: Vec<Event<ID>>,

    /// Cursor to pass as `after` for the next page. None on an empty page.
    pub next_cursor: Option<EventId>,

    /// Whether more events exist beyond this page.
    pub has_more: bool,
}

impl<ID> CursorPage<ID> {
    /// An empty page with no continuation.
    pub fn empty() -> Self {
        Self {
            events: Vec::new(),
            next_cursor: None,
            has_more: false,
        }
    }
}

/// Request for one page of a single aggregate's stream.
#[derive(Debug, Clone)]
pub struct AggregateStreamRequest<ID> {
    pub aggregate_id: ID,
    pub aggregate_type: String,
    /// Resume strictly after this version.
    pub after_version: Version,
    /// Maximum number of events to return.
    pub limit: usize,
}

/// One page of a single aggregate's stream.
#[derive(Debug, Clone)]
pub struct AggregateSlice<ID> {
    /// Events ordered by version ascending.
    pub events: Vec<Event<ID>>,

    /// The version to pass as `after_version` for the next page.
    pub next_version: Version,

    /// Whether more events exist beyond this slice.
    pub has_more: bool,
}

/// A stream of events.
pub type EventStream<ID> = Pin<Box<dyn Stream<Item = Result<Event<ID>>> + Send>>;

/// Core trait for event store implementations.
///
/// An event store persists events append-only, guarded by per-aggregate
/// optimistic locking. All implementations must be thread-safe.
#[async_trait]
pub trait EventStore<ID: AggregateId>: Send + Sync {
    /// Appends a batch of events to an aggregate's stream.
    ///
    /// `expected_version` is the last committed version of the aggregate
    /// (0 for a new aggregate); the batch must carry versions
    /// `expected_version + 1 ..= expected_version + n` and a single aggregate
    /// type. The operation is atomic: either every event persists or none do.
    /// A retry of an identical, already-committed batch succeeds as a no-op.
    ///
    /// Returns the new current version of the aggregate.
    async fn append_events(
        &self,
        aggregate_id: &ID,
        events: Vec<Event<ID>>,
        expected_version: Version,
    ) -> Result<Version>;

    /// Loads an aggregate's events with `version > after_version`, ordered
    /// strictly by version ascending with no gaps.
    async fn load_events(&self, aggregate_id: &ID, after_version: Version)
    -> Result<Vec<Event<ID>>>;

    /// Streams all events with `timestamp >= from_time`, ordered by
    /// `(timestamp, event_id)`.
    async fn stream_events(&self, from_time: DateTime<Utc>) -> Result<EventStream<ID>>;

    /// Returns one page of the global stream according to `options`.
    async fn stream_with_cursor(&self, options: StreamOptions) -> Result<CursorPage<ID>>;
}

/// Version and existence queries on aggregates.
#[async_trait]
pub trait AggregateInspector<ID: AggregateId>: EventStore<ID> {
    /// Whether the aggregate has any events.
    async fn has_aggregate(&self, aggregate_id: &ID) -> Result<bool> {
        Ok(self.aggregate_version(aggregate_id).await?.is_some())
    }

    /// The current version of the aggregate, or None if it has no events.
    async fn aggregate_version(&self, aggregate_id: &ID) -> Result<Option<Version>>;
}

/// Event-type keyed access, for backends with a type index.
#[async_trait]
pub trait TypedEventStore<ID: AggregateId>: EventStore<ID> {
    /// Loads all events of one type, ordered by `(timestamp, event_id)`.
    async fn load_events_by_type(&self, event_type: &str) -> Result<Vec<Event<ID>>>;
}

/// Paged access to a single aggregate's stream.
#[async_trait]
pub trait AggregateEventStore<ID: AggregateId>: EventStore<ID> {
    /// Returns one version-ordered slice of the aggregate's stream.
    async fn stream_aggregate(
        &self,
        request: AggregateStreamRequest<ID>,
    ) -> Result<AggregateSlice<ID>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt<ID: AggregateId>: EventStore<ID> {
    /// Appends a single event.
    async fn append_event(
        &self,
        aggregate_id: &ID,
        event: Event<ID>,
        expected_version: Version,
    ) -> Result<Version> {
        self.append_events(aggregate_id, vec![event], expected_version)
            .await
    }
}

// Blanket implementation for all EventStore implementations
impl<ID: AggregateId, T: EventStore<ID> + ?Sized> EventStoreExt<ID> for T {}

/// Validates a batch against the append contract.
///
/// Checks each event structurally, pins the batch to `aggregate_id` and a
/// single aggregate type, and requires versions
/// `expected_version + 1 ..= expected_version + n`.
pub fn validate_events_for_append<ID: AggregateId>(
    aggregate_id: &ID,
    events: &[Event<ID>],
    expected_version: Version,
) -> Result<()> {
    let first = events.first().ok_or_else(|| EventStoreError::InvalidEvent {
        event_id: String::new(),
        event_type: String::new(),
        reason: "cannot append an empty event batch".to_string(),
    })?;

    let mut next_version = expected_version;
    for event in events {
        event.validate()?;

        let invalid = |reason: String| EventStoreError::InvalidEvent {
            event_id: event.event_id.to_string(),
            event_type: event.event_type.clone(),
            reason,
        };

        if &event.aggregate_id != aggregate_id {
            return Err(invalid(format!(
                "event targets aggregate {}, batch targets {}",
                event.aggregate_id, aggregate_id
            )));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(invalid(
                "all events in a batch must share one aggregate type".to_string(),
            ));
        }

        next_version = next_version.next();
        if event.version != next_version {
            return Err(invalid(format!(
                "event versions must be sequential: expected {}, got {}",
                next_version, event.version
            )));
        }
    }

    Ok(())
}
