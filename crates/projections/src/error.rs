//! Projection, checkpoint, and event-bus error types.

use thiserror::Error;

/// Errors raised by the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// No checkpoint exists for the projection.
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// The checkpoint failed validation.
    #[error("Invalid checkpoint for '{name}': {reason}")]
    Invalid { name: String, reason: String },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised by an event bus implementation.
#[derive(Debug, Error)]
pub enum BusError {
    /// Subscribing a handler failed.
    #[error("Subscribe failed for '{event_type}': {reason}")]
    Subscribe { event_type: String, reason: String },

    /// The handler was not subscribed to the event type.
    #[error("No subscription for '{event_type}' by handler '{handler_name}'")]
    NotSubscribed {
        event_type: String,
        handler_name: String,
    },

    /// A subscribed handler rejected the event.
    #[error("Handler '{handler_name}' failed: {message}")]
    Handler {
        handler_name: String,
        message: String,
    },

    /// The bus transport failed to deliver.
    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Errors that can occur during projection processing.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// A user projection handler failed.
    #[error("Projection handler error: {0}")]
    Handler(String),

    /// The projection name is already registered with the engine.
    #[error("Projection already registered: {0}")]
    AlreadyRegistered(String),

    /// The projection is not registered with the engine.
    #[error("Projection not registered: {0}")]
    NotRegistered(String),

    /// Projection names must be non-empty.
    #[error("Projection name must not be empty")]
    InvalidProjectionName,

    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// An error occurred in the checkpoint store.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// An error occurred on the event bus.
    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    /// Failed to deserialize an event payload.
    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl ProjectionError {
    /// Convenience constructor for user handler failures.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
