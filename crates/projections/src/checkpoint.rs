//! Durable per-projection resume positions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use common::AggregateId;
use event_store::{Event, EventId};

use crate::error::CheckpointError;

/// Where a projection last left off in the global stream.
///
/// `position` is the number of events the projection has processed and never
/// regresses; `last_event_id`/`last_event_time` locate the resume point in
/// `(timestamp, id)` cursor order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub projection_name: String,
    pub position: u64,
    pub last_event_id: Option<EventId>,
    pub last_event_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// A zero checkpoint for a projection that has processed nothing.
    pub fn new(projection_name: impl Into<String>) -> Self {
        Self {
            projection_name: projection_name.into(),
            position: 0,
            last_event_id: None,
            last_event_time: None,
            updated_at: Utc::now(),
        }
    }

    /// Checks the structural invariants of the checkpoint.
    ///
    /// `position` is unsigned by construction, so only the name can be
    /// invalid.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.projection_name.is_empty() {
            return Err(CheckpointError::Invalid {
                name: self.projection_name.clone(),
                reason: "projection name must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Advances the checkpoint past a processed event.
    pub fn record<ID: AggregateId>(&mut self, event: &Event<ID>) {
        self.position += 1;
        self.last_event_id = Some(event.event_id.clone());
        self.last_event_time = Some(event.timestamp);
        self.updated_at = Utc::now();
    }
}

/// Store for per-projection checkpoints.
///
/// `save` has UPSERT semantics and is idempotent; `delete` of a missing
/// checkpoint is not an error.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint for a projection.
    async fn load(&self, projection_name: &str) -> Result<Checkpoint, CheckpointError>;

    /// Saves a checkpoint, replacing any previous one.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Saves several checkpoints; the durable backend does this in a single
    /// transaction.
    async fn save_batch(&self, checkpoints: &[Checkpoint]) -> Result<(), CheckpointError> {
        for checkpoint in checkpoints {
            self.save(checkpoint).await?;
        }
        Ok(())
    }

    /// Deletes the checkpoint for a projection, if present.
    async fn delete(&self, projection_name: &str) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint store.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty in-memory checkpoint store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored checkpoints.
    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    /// Whether no checkpoints are stored.
    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, projection_name: &str) -> Result<Checkpoint, CheckpointError> {
        self.checkpoints
            .read()
            .await
            .get(projection_name)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(projection_name.to_string()))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.validate()?;
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.projection_name.clone(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, projection_name: &str) -> Result<(), CheckpointError> {
        self.checkpoints.write().await.remove(projection_name);
        Ok(())
    }
}
