//! Projection engine for the event-sourcing core.
//!
//! This crate provides the read-model side of the system:
//! - [`Projection`] trait for folding events into read models
//! - [`ProjectionEngine`] for registration, online dispatch, checkpointed
//!   replay, and rebuild
//! - [`CheckpointStore`] with in-memory and PostgreSQL backends
//! - [`EventBus`]/[`EventHandler`] interfaces plus an in-memory bus
//! - [`TenantProjection`] decorator for per-tenant filtering

pub mod bus;
pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod postgres;
pub mod projection;
pub mod tenant;

pub use bus::{EventBus, EventHandler, InMemoryEventBus};
pub use checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
pub use engine::{DeadLetterFn, EngineBuilder, EngineConfig, ProjectionEngine};
pub use error::{BusError, CheckpointError, ProjectionError, Result};
pub use postgres::PostgresCheckpointStore;
pub use projection::{Projection, ProjectionState, ProjectionStatus};
pub use tenant::TenantProjection;
