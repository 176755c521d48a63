use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::AggregateId;

use crate::error::EventStoreError;

/// Unique identifier for an event.
///
/// Event ids are canonical UUIDv7 strings: lexicographic order matches
/// creation order, which makes them usable as stream cursors with a
/// deterministic tie-break at equal timestamps. Callers that need a stronger
/// global order can supply their own monotonically-sortable ids through the
/// builder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generates a new sortable event id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Creates an event id from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (and therefore invalid).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.0
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Version number of an aggregate, used for optimistic concurrency control.
///
/// Versions start at 1 for the first event and increment by 1 for each
/// subsequent event on an aggregate; 0 denotes an aggregate with no events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for a new aggregate.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) for the first event.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Additional metadata carried with an event (tenant id, correlation id, ...).
pub type Metadata = HashMap<String, serde_json::Value>;

/// Object-safe view of a typed event payload.
///
/// Implemented for every serializable type via the blanket impl below, so
/// registry consumers can downcast to the concrete payload they registered.
pub trait TypedPayload: fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// Serializes the payload back to its JSON representation.
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<T> TypedPayload for T
where
    T: Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// An event payload, either untyped JSON as hydrated from storage or a typed
/// value reinstantiated through the event registry.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Raw JSON, the shape every payload takes when loaded from a backend.
    Json(serde_json::Value),
    /// A registered payload type produced by the registry or upgrader.
    Typed(Arc<dyn TypedPayload>),
}

impl EventPayload {
    /// Creates a payload from a serializable value without registering it.
    pub fn from_typed<T>(payload: T) -> Self
    where
        T: Serialize + fmt::Debug + Send + Sync + 'static,
    {
        Self::Typed(Arc::new(payload))
    }

    /// Returns the JSON representation of the payload.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Json(value) => Ok(value.clone()),
            Self::Typed(payload) => payload.to_json(),
        }
    }

    /// Downcasts a typed payload to a concrete type.
    ///
    /// Returns `None` for `Json` payloads or a type mismatch.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Self::Json(_) => None,
            Self::Typed(payload) => payload.as_any().downcast_ref::<T>(),
        }
    }

    /// Whether the payload is still the untyped storage representation.
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json(_))
    }
}

impl Serialize for EventPayload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Json(value) => value.serialize(serializer),
            Self::Typed(payload) => payload
                .to_json()
                .map_err(serde::ser::Error::custom)?
                .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for EventPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self::Json(serde_json::Value::deserialize(deserializer)?))
    }
}

impl From<serde_json::Value> for EventPayload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// An immutable record of something that happened to an aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "ID: Serialize",
    deserialize = "ID: serde::de::DeserializeOwned"
))]
pub struct Event<ID> {
    /// Unique, sortable identifier for this event.
    pub event_id: EventId,

    /// The registered event type name (e.g. "OrderCreated").
    pub event_type: String,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// The aggregate this event belongs to.
    pub aggregate_id: ID,

    /// The type of aggregate (e.g. "Order").
    pub aggregate_type: String,

    /// The version of the aggregate after this event, 1-based.
    pub version: Version,

    /// The schema version of the payload shape.
    pub schema_version: u32,

    /// The event payload.
    pub payload: EventPayload,

    /// Additional metadata about the event.
    pub metadata: Metadata,
}

impl<ID: AggregateId> Event<ID> {
    /// Creates a new event builder.
    pub fn builder() -> EventBuilder<ID> {
        EventBuilder::default()
    }

    /// Checks the structural invariants of the event.
    pub fn validate(&self) -> Result<(), EventStoreError> {
        let invalid = |reason: &str| EventStoreError::InvalidEvent {
            event_id: self.event_id.to_string(),
            event_type: self.event_type.clone(),
            reason: reason.to_string(),
        };

        if self.event_id.is_empty() {
            return Err(invalid("event id must not be empty"));
        }
        if self.event_type.is_empty() {
            return Err(invalid("event type must not be empty"));
        }
        if !self.aggregate_id.is_valid() {
            return Err(invalid("aggregate id is not valid"));
        }
        if self.aggregate_type.is_empty() {
            return Err(invalid("aggregate type must not be empty"));
        }
        if self.version < Version::first() {
            return Err(invalid("version must be at least 1"));
        }
        if self.schema_version < 1 {
            return Err(invalid("schema version must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for constructing events.
#[derive(Debug)]
pub struct EventBuilder<ID> {
    event_id: Option<EventId>,
    event_type: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    aggregate_id: Option<ID>,
    aggregate_type: Option<String>,
    version: Option<Version>,
    schema_version: u32,
    payload: Option<EventPayload>,
    metadata: Metadata,
}

impl<ID> Default for EventBuilder<ID> {
    fn default() -> Self {
        Self {
            event_id: None,
            event_type: None,
            timestamp: None,
            aggregate_id: None,
            aggregate_type: None,
            version: None,
            schema_version: 1,
            payload: None,
            metadata: Metadata::new(),
        }
    }
}

impl<ID: AggregateId> EventBuilder<ID> {
    /// Sets the event id. If not set, a new sortable id is generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the timestamp. If not set, the current time is used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the aggregate id.
    pub fn aggregate_id(mut self, id: ID) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    /// Sets the aggregate type.
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Sets the version.
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the payload schema version. Defaults to 1.
    pub fn schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T>(mut self, payload: T) -> Self
    where
        T: Serialize + fmt::Debug + Send + Sync + 'static,
    {
        self.payload = Some(EventPayload::from_typed(payload));
        self
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_json(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(EventPayload::Json(payload));
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the event.
    ///
    /// # Panics
    ///
    /// Panics if required fields (event_type, aggregate_id, aggregate_type,
    /// version, payload) are not set.
    pub fn build(self) -> Event<ID> {
        Event {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type.expect("event_type is required"),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            aggregate_id: self.aggregate_id.expect("aggregate_id is required"),
            aggregate_type: self.aggregate_type.expect("aggregate_type is required"),
            version: self.version.expect("version is required"),
            schema_version: self.schema_version,
            payload: self.payload.expect("payload is required"),
            metadata: self.metadata,
        }
    }

    /// Tries to build the event, returning None if required fields are missing.
    pub fn try_build(self) -> Option<Event<ID>> {
        Some(Event {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            aggregate_id: self.aggregate_id?,
            aggregate_type: self.aggregate_type?,
            version: self.version?,
            schema_version: self.schema_version,
            payload: self.payload?,
            metadata: self.metadata,
        })
    }
}
