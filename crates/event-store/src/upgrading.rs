//! Store decorator that upgrades payloads lazily on load.
//!
//! Events hydrate from a backend as untyped JSON at the schema version they
//! were written with. This wrapper runs the payload upgrader over every
//! loaded or streamed event, so consumers always observe typed payloads at
//! the registry's current schema version. Event types the registry does not
//! know pass through untouched.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use common::AggregateId;

use crate::error::{EventStoreError, Result};
use crate::event::{Event, Version};
use crate::store::{
    AggregateInspector, CursorPage, EventStore, EventStream, StreamOptions, TypedEventStore,
};
use crate::upgrade::PayloadUpgrader;

/// Wraps an event store so every load runs through the payload upgrader.
pub struct UpgradingEventStore<ID: AggregateId, S> {
    inner: S,
    upgrader: Arc<PayloadUpgrader>,
    _id: PhantomData<fn() -> ID>,
}

impl<ID: AggregateId, S: EventStore<ID>> UpgradingEventStore<ID, S> {
    /// Creates the decorator around `inner`.
    pub fn new(inner: S, upgrader: Arc<PayloadUpgrader>) -> Self {
        Self {
            inner,
            upgrader,
            _id: PhantomData,
        }
    }

    /// Returns a reference to the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn upgrade_all(&self, events: Vec<Event<ID>>) -> Result<Vec<Event<ID>>> {
        events
            .into_iter()
            .map(|event| upgrade_one(&self.upgrader, event))
            .collect()
    }
}

fn upgrade_one<ID: AggregateId>(
    upgrader: &PayloadUpgrader,
    event: Event<ID>,
) -> Result<Event<ID>> {
    if !upgrader.registry().contains(&event.event_type) {
        return Ok(event);
    }

    let event_id = event.event_id.to_string();
    let event_type = event.event_type.clone();
    upgrader
        .upgrade(event)
        .map_err(|e| EventStoreError::InvalidEvent {
            event_id,
            event_type,
            reason: e.to_string(),
        })
}

#[async_trait]
impl<ID: AggregateId, S: EventStore<ID>> EventStore<ID> for UpgradingEventStore<ID, S> {
    async fn append_events(
        &self,
        aggregate_id: &ID,
        events: Vec<Event<ID>>,
        expected_version: Version,
    ) -> Result<Version> {
        self.inner
            .append_events(aggregate_id, events, expected_version)
            .await
    }

    async fn load_events(
        &self,
        aggregate_id: &ID,
        after_version: Version,
    ) -> Result<Vec<Event<ID>>> {
        let events = self.inner.load_events(aggregate_id, after_version).await?;
        self.upgrade_all(events)
    }

    async fn stream_events(&self, from_time: DateTime<Utc>) -> Result<EventStream<ID>> {
        use futures_util::StreamExt;

        let upgrader = Arc::clone(&self.upgrader);
        let stream = self
            .inner
            .stream_events(from_time)
            .await?
            .map(move |result| result.and_then(|event| upgrade_one(&upgrader, event)));

        Ok(Box::pin(stream))
    }

    async fn stream_with_cursor(&self, options: StreamOptions) -> Result<CursorPage<ID>> {
        let page = self.inner.stream_with_cursor(options).await?;
        Ok(CursorPage {
            events: self.upgrade_all(page.events)?,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }
}

#[async_trait]
impl<ID: AggregateId, S: AggregateInspector<ID>> AggregateInspector<ID>
    for UpgradingEventStore<ID, S>
{
    async fn aggregate_version(&self, aggregate_id: &ID) -> Result<Option<Version>> {
        self.inner.aggregate_version(aggregate_id).await
    }
}

#[async_trait]
impl<ID: AggregateId, S: TypedEventStore<ID>> TypedEventStore<ID> for UpgradingEventStore<ID, S> {
    async fn load_events_by_type(&self, event_type: &str) -> Result<Vec<Event<ID>>> {
        let events = self.inner.load_events_by_type(event_type).await?;
        self.upgrade_all(events)
    }
}
