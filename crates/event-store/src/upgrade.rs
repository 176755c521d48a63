//! Payload schema upgrades.
//!
//! Events hydrate from storage with the schema version they were written at.
//! The upgrader chains single-step transforms over the raw JSON until the
//! payload reaches the registry's current version, then reinstantiates it as
//! the registered type.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use common::AggregateId;

use crate::error::UpgradeError;
use crate::event::{Event, EventPayload};
use crate::registry::EventRegistry;

type UpgradeFn =
    Box<dyn Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync>;

/// Upgrades stored payloads to the current schema version.
pub struct PayloadUpgrader {
    registry: Arc<EventRegistry>,
    chains: RwLock<HashMap<String, BTreeMap<u32, UpgradeFn>>>,
}

impl PayloadUpgrader {
    /// Creates an upgrader bound to a registry.
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self {
            registry,
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// The registry this upgrader resolves payload types against.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Registers the transform that takes `event_type` payloads from
    /// `from_version` to `from_version + 1`.
    ///
    /// The transform returns a plain error message; the upgrader wraps it
    /// with the event type and version it failed at.
    pub fn add_step<F>(&self, event_type: impl Into<String>, from_version: u32, step: F)
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        let mut chains = self.chains.write().expect("upgrader lock poisoned");
        chains
            .entry(event_type.into())
            .or_default()
            .insert(from_version, Box::new(step));
    }

    /// Upgrades an event's payload to the registry's current schema version.
    ///
    /// Typed payloads already at the latest version pass through unchanged,
    /// so the operation is idempotent. Untyped payloads walk the upgrade
    /// chain in strict ascending order; a missing step fails the upgrade.
    pub fn upgrade<ID: AggregateId>(&self, event: Event<ID>) -> Result<Event<ID>, UpgradeError> {
        let latest = self.registry.latest_schema_version(&event.event_type)?;

        if !event.payload.is_json() && event.schema_version == latest {
            return Ok(event);
        }

        let mut value = match event.payload.to_json() {
            Ok(value) => value,
            Err(e) => {
                return Err(UpgradeError::Transform {
                    event_type: event.event_type.clone(),
                    from_version: event.schema_version,
                    reason: e.to_string(),
                });
            }
        };

        let chains = self.chains.read().expect("upgrader lock poisoned");
        let chain = chains.get(&event.event_type);

        let mut version = event.schema_version;
        while version < latest {
            let step = chain.and_then(|c| c.get(&version)).ok_or_else(|| {
                UpgradeError::MissingUpgrader {
                    event_type: event.event_type.clone(),
                    from_version: version,
                }
            })?;

            value = step(value).map_err(|reason| UpgradeError::Transform {
                event_type: event.event_type.clone(),
                from_version: version,
                reason,
            })?;
            version += 1;
        }

        let payload = self
            .registry
            .deserialize_from_value(&event.event_type, value)?;

        Ok(Event {
            payload: EventPayload::Typed(payload),
            schema_version: latest,
            ..event
        })
    }
}
