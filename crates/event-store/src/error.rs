use thiserror::Error;

use crate::event::Version;

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// A concurrency conflict occurred when appending events.
    /// The expected version did not match the actual version.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: Version,
        actual: Version,
    },

    /// An event failed structural validation or violated the append contract.
    #[error("Invalid event {event_id} ({event_type}): {reason}")]
    InvalidEvent {
        event_id: String,
        event_type: String,
        reason: String,
    },

    /// A non-idempotent duplicate insert: an event already occupies the
    /// target version slot (or reuses the id) with different content.
    #[error("Event {event_id} already exists for aggregate {aggregate_id} at version {version}")]
    EventAlreadyExists {
        event_id: String,
        aggregate_id: String,
        version: Version,
    },

    /// The aggregate was not found in the event store.
    #[error("Aggregate not found: {0}")]
    AggregateNotFound(String),

    /// A cursor stream was resumed from an id the store does not know.
    #[error("Unknown stream cursor: {0}")]
    UnknownCursor(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;

/// Errors raised by the event registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An event type name was registered twice.
    #[error("Event type already registered: {0}")]
    DuplicateType(String),

    /// The event type name is not registered.
    #[error("Unknown event type: {0}")]
    UnknownType(String),

    /// The stored payload could not be deserialized into the registered type.
    #[error("Payload deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),
}

/// Errors raised while upgrading a stored payload to the current schema.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// No upgrader covers the step from this schema version.
    #[error("No upgrader registered for {event_type} from schema version {from_version}")]
    MissingUpgrader {
        event_type: String,
        from_version: u32,
    },

    /// A registered upgrade step failed.
    #[error("Upgrade of {event_type} from schema version {from_version} failed: {reason}")]
    Transform {
        event_type: String,
        from_version: u32,
        reason: String,
    },

    /// The registry rejected the upgraded payload.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
