//! Append-only event store with per-aggregate optimistic concurrency.
//!
//! The crate provides:
//! - [`Event`], the immutable event record with validation and a builder
//! - [`EventRegistry`] and [`PayloadUpgrader`] for typed payload
//!   reinstantiation and schema-version upgrades, applied lazily on load by
//!   the [`UpgradingEventStore`] decorator
//! - [`EventStore`], the store contract, implemented by
//!   [`InMemoryEventStore`] and [`PostgresEventStore`]
//! - [`filter_stream`], the canonical cursor filter for backends without
//!   native cursoring
//! - [`CachingEventStore`], a read-through aggregate cache with TTL and LRU
//!   eviction

pub mod cache;
pub mod error;
pub mod event;
pub mod filter;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod store;
pub mod upgrade;
pub mod upgrading;

pub use common::AggregateId;

pub use cache::{CacheConfig, CacheStats, CachingEventStore};
pub use error::{EventStoreError, RegistryError, Result, UpgradeError};
pub use event::{Event, EventBuilder, EventId, EventPayload, Metadata, TypedPayload, Version};
pub use filter::filter_stream;
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use registry::EventRegistry;
pub use store::{
    AggregateEventStore, AggregateInspector, AggregateSlice, AggregateStreamRequest, CursorPage,
    DEFAULT_STREAM_LIMIT, EventStore, EventStoreExt, EventStream, MAX_STREAM_LIMIT, StreamOptions,
    TypedEventStore, validate_events_for_append,
};
pub use upgrade::PayloadUpgrader;
pub use upgrading::UpgradingEventStore;
