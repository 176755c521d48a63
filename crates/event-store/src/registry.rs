//! Event type registry: factory and schema-version lookup by type name.
//!
//! Payloads load from storage as untyped JSON; the registry is the table of
//! constructors that turns them back into the concrete types callers
//! registered, without any runtime reflection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::RegistryError;
use crate::event::TypedPayload;

type PayloadFactory =
    Box<dyn Fn(serde_json::Value) -> Result<Arc<dyn TypedPayload>, serde_json::Error> + Send + Sync>;

struct RegistryEntry {
    schema_version: u32,
    factory: PayloadFactory,
}

/// Registry of event payload types keyed by event-type name.
///
/// Uses a `std::sync::RwLock` internally; no lock is ever held across an
/// await point.
#[derive(Default)]
pub struct EventRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl EventRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a payload type under an event-type name.
    ///
    /// `schema_version` is the current shape of the payload; it defaults to 1
    /// via [`EventRegistry::register_latest`]. Registering the same name
    /// twice fails.
    pub fn register<T>(
        &self,
        event_type: impl Into<String>,
        schema_version: u32,
    ) -> Result<(), RegistryError>
    where
        T: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let mut entries = self.entries.write().expect("registry lock poisoned");

        if entries.contains_key(&event_type) {
            return Err(RegistryError::DuplicateType(event_type));
        }

        entries.insert(
            event_type,
            RegistryEntry {
                schema_version,
                factory: Box::new(|value| {
                    let payload: T = serde_json::from_value(value)?;
                    Ok(Arc::new(payload) as Arc<dyn TypedPayload>)
                }),
            },
        );
        Ok(())
    }

    /// Registers a payload type at schema version 1.
    pub fn register_latest<T>(&self, event_type: impl Into<String>) -> Result<(), RegistryError>
    where
        T: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        self.register::<T>(event_type, 1)
    }

    /// Deserializes a payload from raw bytes.
    pub fn deserialize_from_slice(
        &self,
        event_type: &str,
        bytes: &[u8],
    ) -> Result<Arc<dyn TypedPayload>, RegistryError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        self.deserialize_from_value(event_type, value)
    }

    /// Deserializes a payload from a JSON value (typically a map hydrated
    /// from storage).
    pub fn deserialize_from_value(
        &self,
        event_type: &str,
        value: serde_json::Value,
    ) -> Result<Arc<dyn TypedPayload>, RegistryError> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let entry = entries
            .get(event_type)
            .ok_or_else(|| RegistryError::UnknownType(event_type.to_string()))?;
        Ok((entry.factory)(value)?)
    }

    /// The current schema version for an event type.
    pub fn latest_schema_version(&self, event_type: &str) -> Result<u32, RegistryError> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries
            .get(event_type)
            .map(|e| e.schema_version)
            .ok_or_else(|| RegistryError::UnknownType(event_type.to_string()))
    }

    /// Whether an event type is registered.
    pub fn contains(&self, event_type: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order_id: i64,
        total_cents: i64,
    }

    #[test]
    fn register_and_deserialize() {
        let registry = EventRegistry::new();
        registry.register_latest::<OrderPlaced>("OrderPlaced").unwrap();

        let payload = registry
            .deserialize_from_value(
                "OrderPlaced",
                serde_json::json!({"order_id": 7, "total_cents": 1200}),
            )
            .unwrap();

        let placed = payload.as_any().downcast_ref::<OrderPlaced>().unwrap();
        assert_eq!(placed.order_id, 7);
        assert_eq!(placed.total_cents, 1200);
    }

    #[test]
    fn deserialize_from_slice() {
        let registry = EventRegistry::new();
        registry.register_latest::<OrderPlaced>("OrderPlaced").unwrap();

        let payload = registry
            .deserialize_from_slice("OrderPlaced", br#"{"order_id": 1, "total_cents": 5}"#)
            .unwrap();
        assert!(payload.as_any().downcast_ref::<OrderPlaced>().is_some());
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = EventRegistry::new();
        registry.register_latest::<OrderPlaced>("OrderPlaced").unwrap();

        let result = registry.register::<OrderPlaced>("OrderPlaced", 2);
        assert!(matches!(result, Err(RegistryError::DuplicateType(_))));
    }

    #[test]
    fn unknown_type_fails() {
        let registry = EventRegistry::new();
        let result = registry.deserialize_from_value("Nope", serde_json::json!({}));
        assert!(matches!(result, Err(RegistryError::UnknownType(_))));
        assert!(matches!(
            registry.latest_schema_version("Nope"),
            Err(RegistryError::UnknownType(_))
        ));
    }

    #[test]
    fn latest_schema_version_lookup() {
        let registry = EventRegistry::new();
        registry.register::<OrderPlaced>("OrderPlaced", 3).unwrap();
        assert_eq!(registry.latest_schema_version("OrderPlaced").unwrap(), 3);
    }

    #[test]
    fn mismatched_payload_shape_fails() {
        let registry = EventRegistry::new();
        registry.register_latest::<OrderPlaced>("OrderPlaced").unwrap();

        let result =
            registry.deserialize_from_value("OrderPlaced", serde_json::json!({"bogus": true}));
        assert!(matches!(result, Err(RegistryError::Deserialization(_))));
    }
}
