//! Projection engine: registration, online dispatch, checkpointed replay,
//! and rebuild.
//!
//! The engine owns one read-write lock over its registrations (projection
//! reference, live status, subscription records). User handlers always run
//! outside that lock; only status mutation and checkpoint materialization run
//! under it, and checkpoint saves happen after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use common::AggregateId;
use event_store::{Event, EventStore, StreamOptions};

use crate::bus::{EventBus, EventHandler};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::{BusError, CheckpointError, ProjectionError, Result};
use crate::projection::{Projection, ProjectionState, ProjectionStatus};

/// Engine tuning knobs.
///
/// Retries apply to the replay path only; online redelivery is the bus's
/// policy. `max_retries = 0` disables replay retries.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retries per event during replay, on top of the first attempt.
    pub max_retries: u32,

    /// Delay between replay attempts.
    pub retry_backoff: Duration,

    /// Page size used when walking the store during replay.
    pub replay_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            replay_batch_size: 1000,
        }
    }
}

/// Callback invoked with events whose online dispatch ultimately failed.
pub type DeadLetterFn<ID> = Arc<dyn Fn(&ProjectionError, &Event<ID>, &str) + Send + Sync>;

struct Registration<ID: AggregateId> {
    projection: Arc<dyn Projection<ID>>,
    status: ProjectionStatus,
    /// `(event_type, handler)` tuples in subscription order.
    subscriptions: Vec<(String, Arc<EngineHandler<ID>>)>,
}

struct EngineShared<ID: AggregateId> {
    store: Arc<dyn EventStore<ID>>,
    bus: Arc<dyn EventBus<ID>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    config: EngineConfig,
    dead_letter: Option<DeadLetterFn<ID>>,
    registrations: RwLock<HashMap<String, Registration<ID>>>,
}

/// Builder for a [`ProjectionEngine`].
pub struct EngineBuilder<ID: AggregateId> {
    store: Arc<dyn EventStore<ID>>,
    bus: Arc<dyn EventBus<ID>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    config: EngineConfig,
    dead_letter: Option<DeadLetterFn<ID>>,
}

impl<ID: AggregateId> EngineBuilder<ID> {
    /// Configures a checkpoint store for resumable processing.
    pub fn checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Overrides the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs a dead-letter callback for failed online dispatches.
    pub fn dead_letter(mut self, dead_letter: DeadLetterFn<ID>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> ProjectionEngine<ID> {
        ProjectionEngine {
            shared: Arc::new(EngineShared {
                store: self.store,
                bus: self.bus,
                checkpoints: self.checkpoints,
                config: self.config,
                dead_letter: self.dead_letter,
                registrations: RwLock::new(HashMap::new()),
            }),
        }
    }
}

/// Drives registered projections from the event stream.
pub struct ProjectionEngine<ID: AggregateId> {
    shared: Arc<EngineShared<ID>>,
}

impl<ID: AggregateId> Clone for ProjectionEngine<ID> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<ID: AggregateId> ProjectionEngine<ID> {
    /// Starts building an engine over a store and a bus.
    pub fn builder(
        store: Arc<dyn EventStore<ID>>,
        bus: Arc<dyn EventBus<ID>>,
    ) -> EngineBuilder<ID> {
        EngineBuilder {
            store,
            bus,
            checkpoints: None,
            config: EngineConfig::default(),
            dead_letter: None,
        }
    }

    /// Registers a projection and subscribes it to its declared event types.
    ///
    /// On subscription failure every already-subscribed type is unsubscribed
    /// (failures logged) and all engine state for the projection is removed
    /// before the error surfaces. The projection starts `Stopped`.
    #[tracing::instrument(skip(self, projection), fields(projection = projection.name()))]
    pub async fn register(&self, projection: Arc<dyn Projection<ID>>) -> Result<()> {
        let name = projection.name().to_string();
        if name.is_empty() {
            return Err(ProjectionError::InvalidProjectionName);
        }
        let event_types = projection.event_types();

        let handler = Arc::new(EngineHandler {
            shared: Arc::downgrade(&self.shared),
            projection_name: name.clone(),
            event_types: event_types.clone(),
        });

        {
            let mut registrations = self.shared.registrations.write().await;
            if registrations.contains_key(&name) {
                return Err(ProjectionError::AlreadyRegistered(name));
            }
            registrations.insert(
                name.clone(),
                Registration {
                    projection,
                    status: ProjectionStatus::new(&name),
                    subscriptions: Vec::new(),
                },
            );
        }

        let mut subscribed: Vec<(String, Arc<EngineHandler<ID>>)> = Vec::new();
        for event_type in &event_types {
            match self.shared.bus.subscribe(event_type, handler.clone()).await {
                Ok(()) => subscribed.push((event_type.clone(), handler.clone())),
                Err(e) => {
                    self.rollback_subscriptions(&name, &subscribed).await;
                    return Err(ProjectionError::Bus(e));
                }
            }
        }

        let mut registrations = self.shared.registrations.write().await;
        if let Some(registration) = registrations.get_mut(&name) {
            registration.subscriptions = subscribed;
        }
        tracing::info!("projection registered");
        Ok(())
    }

    async fn rollback_subscriptions(
        &self,
        name: &str,
        subscribed: &[(String, Arc<EngineHandler<ID>>)],
    ) {
        for (event_type, handler) in subscribed {
            if let Err(e) = self
                .shared
                .bus
                .unsubscribe(event_type, &handler.handler_name())
                .await
            {
                tracing::warn!(
                    projection = name,
                    event_type,
                    error = %e,
                    "failed to unsubscribe during registration rollback"
                );
            }
        }
        self.shared.registrations.write().await.remove(name);
    }

    /// Removes a projection: unsubscribes its handlers in subscription order
    /// and drops its status and handler records.
    ///
    /// Unsubscribe failures are logged and do not abort the removal.
    #[tracing::instrument(skip(self))]
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let registration = self
            .shared
            .registrations
            .write()
            .await
            .remove(name)
            .ok_or_else(|| ProjectionError::NotRegistered(name.to_string()))?;

        for (event_type, handler) in &registration.subscriptions {
            if let Err(e) = self
                .shared
                .bus
                .unsubscribe(event_type, &handler.handler_name())
                .await
            {
                tracing::warn!(
                    projection = name,
                    event_type,
                    error = %e,
                    "failed to unsubscribe during unregister"
                );
            }
        }
        tracing::info!("projection unregistered");
        Ok(())
    }

    /// Transitions the projection to `Running`. Idempotent.
    pub async fn start(&self, name: &str) -> Result<()> {
        self.set_state(name, ProjectionState::Running).await
    }

    /// Transitions the projection to `Stopped`. Idempotent. The bus
    /// subscriptions stay alive; deliveries no-op until restarted.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.set_state(name, ProjectionState::Stopped).await
    }

    async fn set_state(&self, name: &str, state: ProjectionState) -> Result<()> {
        let mut registrations = self.shared.registrations.write().await;
        let registration = registrations
            .get_mut(name)
            .ok_or_else(|| ProjectionError::NotRegistered(name.to_string()))?;
        registration.status.state = state;
        registration.status.updated_at = Utc::now();
        Ok(())
    }

    /// Returns a snapshot of a projection's status.
    pub async fn status(&self, name: &str) -> Option<ProjectionStatus> {
        self.shared
            .registrations
            .read()
            .await
            .get(name)
            .map(|r| r.status.clone())
    }

    /// Returns status snapshots for every registered projection.
    pub async fn statuses(&self) -> Vec<ProjectionStatus> {
        self.shared
            .registrations
            .read()
            .await
            .values()
            .map(|r| r.status.clone())
            .collect()
    }

    /// Replays missed history from the checkpoint, then starts the
    /// projection.
    ///
    /// The checkpoint seeds the in-memory status; the store is walked in
    /// pages of `replay_batch_size`, filtered to the projection's event types
    /// and resuming strictly after `(last_event_time, last_event_id)`. Each
    /// event is retried up to `max_retries` times with `retry_backoff`
    /// between attempts; an ultimate failure puts the projection in `Error`
    /// and aborts the replay with already-processed events still counted.
    #[tracing::instrument(skip(self))]
    pub async fn resume_from_checkpoint(&self, name: &str) -> Result<()> {
        let (projection, event_types) = {
            let registrations = self.shared.registrations.read().await;
            let registration = registrations
                .get(name)
                .ok_or_else(|| ProjectionError::NotRegistered(name.to_string()))?;
            (
                Arc::clone(&registration.projection),
                registration.projection.event_types(),
            )
        };

        let checkpoint = match &self.shared.checkpoints {
            Some(checkpoints) => match checkpoints.load(name).await {
                Ok(checkpoint) => checkpoint,
                Err(CheckpointError::NotFound(_)) => Checkpoint::new(name),
                Err(e) => return Err(e.into()),
            },
            None => Checkpoint::new(name),
        };

        {
            let mut registrations = self.shared.registrations.write().await;
            let registration = registrations
                .get_mut(name)
                .ok_or_else(|| ProjectionError::NotRegistered(name.to_string()))?;
            registration.status.processed_events = checkpoint.position;
            registration.status.last_event_id = checkpoint.last_event_id.clone();
            registration.status.last_event_time = checkpoint.last_event_time;
            registration.status.updated_at = Utc::now();
        }

        let mut cursor = checkpoint.last_event_id;
        let mut replayed: u64 = 0;
        loop {
            let mut options = StreamOptions::new()
                .limit(self.shared.config.replay_batch_size)
                .event_types(event_types.clone());
            if let Some(after) = cursor.clone() {
                options = options.after(after);
            }

            let page = self.shared.store.stream_with_cursor(options).await?;
            for event in &page.events {
                self.replay_event(name, &projection, event).await?;
                replayed += 1;
            }

            if let Some(next) = page.next_cursor {
                cursor = Some(next);
            }
            if !page.has_more {
                break;
            }
        }

        tracing::info!(replayed, "replay complete");
        self.start(name).await
    }

    async fn replay_event(
        &self,
        name: &str,
        projection: &Arc<dyn Projection<ID>>,
        event: &Event<ID>,
    ) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match projection.handle(event).await {
                Ok(()) => {
                    let checkpoint = self.record_success(name, event).await;
                    self.save_checkpoint(name, checkpoint).await;
                    return Ok(());
                }
                Err(e) if attempt < self.shared.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        projection = name,
                        attempt,
                        error = %e,
                        "replay handler failed, retrying"
                    );
                    if !self.shared.config.retry_backoff.is_zero() {
                        tokio::time::sleep(self.shared.config.retry_backoff).await;
                    }
                }
                Err(e) => {
                    let mut registrations = self.shared.registrations.write().await;
                    if let Some(registration) = registrations.get_mut(name) {
                        registration.status.failed_events += 1;
                        registration.status.last_error = Some(e.to_string());
                        registration.status.state = ProjectionState::Error;
                        registration.status.updated_at = Utc::now();
                    }
                    metrics::counter!("projection_errors").increment(1);
                    return Err(e);
                }
            }
        }
    }

    /// Rebuilds a projection from an explicit event slice.
    ///
    /// Deletes the checkpoint, runs the projection's `rebuild` once with the
    /// slice, records a fresh checkpoint at the last event, and leaves the
    /// projection `Stopped`. Any error transitions to `Error` and propagates.
    #[tracing::instrument(skip(self, events), fields(events = events.len()))]
    pub async fn rebuild(&self, name: &str, events: &[Event<ID>]) -> Result<()> {
        let projection = {
            let registrations = self.shared.registrations.read().await;
            let registration = registrations
                .get(name)
                .ok_or_else(|| ProjectionError::NotRegistered(name.to_string()))?;
            Arc::clone(&registration.projection)
        };

        if let Some(checkpoints) = &self.shared.checkpoints {
            checkpoints.delete(name).await?;
        }

        self.set_state(name, ProjectionState::Rebuilding).await?;

        if let Err(e) = projection.rebuild(events).await {
            self.record_failure(name, &e).await;
            return Err(e);
        }

        let checkpoint = {
            let mut registrations = self.shared.registrations.write().await;
            let registration = registrations
                .get_mut(name)
                .ok_or_else(|| ProjectionError::NotRegistered(name.to_string()))?;
            let now = Utc::now();
            registration.status.processed_events = events.len() as u64;
            registration.status.last_event_id = events.last().map(|e| e.event_id.clone());
            registration.status.last_event_time = events.last().map(|e| e.timestamp);
            registration.status.last_error = None;
            registration.status.updated_at = now;
            Checkpoint {
                projection_name: name.to_string(),
                position: registration.status.processed_events,
                last_event_id: registration.status.last_event_id.clone(),
                last_event_time: registration.status.last_event_time,
                updated_at: now,
            }
        };

        if let Some(checkpoints) = &self.shared.checkpoints {
            if let Err(e) = checkpoints.save(&checkpoint).await {
                let e = ProjectionError::from(e);
                self.record_failure(name, &e).await;
                return Err(e);
            }
        }

        self.set_state(name, ProjectionState::Stopped).await
    }

    async fn record_success(&self, name: &str, event: &Event<ID>) -> Option<Checkpoint> {
        let mut registrations = self.shared.registrations.write().await;
        let registration = registrations.get_mut(name)?;
        let now = Utc::now();
        registration.status.processed_events += 1;
        registration.status.last_event_id = Some(event.event_id.clone());
        registration.status.last_event_time = Some(event.timestamp);
        registration.status.last_error = None;
        registration.status.updated_at = now;

        metrics::counter!("projection_updates").increment(1);
        metrics::counter!("events_processed").increment(1);

        self.shared.checkpoints.as_ref().map(|_| Checkpoint {
            projection_name: name.to_string(),
            position: registration.status.processed_events,
            last_event_id: registration.status.last_event_id.clone(),
            last_event_time: registration.status.last_event_time,
            updated_at: now,
        })
    }

    async fn record_failure(&self, name: &str, error: &ProjectionError) {
        let mut registrations = self.shared.registrations.write().await;
        if let Some(registration) = registrations.get_mut(name) {
            registration.status.last_error = Some(error.to_string());
            registration.status.state = ProjectionState::Error;
            registration.status.updated_at = Utc::now();
        }
        metrics::counter!("projection_errors").increment(1);
    }

    async fn save_checkpoint(&self, name: &str, checkpoint: Option<Checkpoint>) {
        if let (Some(checkpoint), Some(checkpoints)) = (checkpoint, &self.shared.checkpoints)
            && let Err(e) = checkpoints.save(&checkpoint).await
        {
            // Checkpoint persistence is best-effort on the hot path; replay
            // covers the gap after a crash.
            tracing::warn!(projection = name, error = %e, "checkpoint save failed");
        }
    }
}

impl<ID: AggregateId> EngineShared<ID> {
    /// Online dispatch for one projection, exactly one status outcome per
    /// delivered event.
    async fn dispatch_online(
        &self,
        name: &str,
        event: &Event<ID>,
    ) -> std::result::Result<(), ProjectionError> {
        // Shared lock: running check and snapshots only.
        let projection = {
            let registrations = self.registrations.read().await;
            let Some(registration) = registrations.get(name) else {
                return Ok(());
            };
            if registration.status.state != ProjectionState::Running {
                return Ok(());
            }
            Arc::clone(&registration.projection)
        };

        // User code runs outside the lock.
        let outcome = projection.handle(event).await;

        // Exclusive lock: status mutation and checkpoint materialization.
        let checkpoint = {
            let mut registrations = self.registrations.write().await;
            let Some(registration) = registrations.get_mut(name) else {
                return Ok(());
            };
            let now = Utc::now();
            registration.status.updated_at = now;
            match &outcome {
                Ok(()) => {
                    registration.status.processed_events += 1;
                    registration.status.last_event_id = Some(event.event_id.clone());
                    registration.status.last_event_time = Some(event.timestamp);
                    registration.status.last_error = None;
                    metrics::counter!("projection_updates").increment(1);
                    metrics::counter!("events_processed").increment(1);
                    let lag = (now - event.timestamp).num_milliseconds().max(0) as f64;
                    metrics::histogram!("projection_lag").record(lag);
                    self.checkpoints.as_ref().map(|_| Checkpoint {
                        projection_name: name.to_string(),
                        position: registration.status.processed_events,
                        last_event_id: registration.status.last_event_id.clone(),
                        last_event_time: registration.status.last_event_time,
                        updated_at: now,
                    })
                }
                Err(e) => {
                    registration.status.failed_events += 1;
                    registration.status.last_error = Some(e.to_string());
                    metrics::counter!("projection_errors").increment(1);
                    None
                }
            }
        };

        if let (Some(checkpoint), Some(checkpoints)) = (checkpoint, &self.checkpoints)
            && let Err(e) = checkpoints.save(&checkpoint).await
        {
            tracing::warn!(projection = name, error = %e, "checkpoint save failed");
        }

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(dead_letter) = &self.dead_letter {
                    dead_letter(&e, event, name);
                }
                Err(e)
            }
        }
    }
}

/// Handler stub the engine subscribes on the bus, one per projection.
struct EngineHandler<ID: AggregateId> {
    shared: Weak<EngineShared<ID>>,
    projection_name: String,
    event_types: Vec<String>,
}

#[async_trait]
impl<ID: AggregateId> EventHandler<ID> for EngineHandler<ID> {
    fn handler_name(&self) -> String {
        format!("projection:{}", self.projection_name)
    }

    fn event_types(&self) -> Vec<String> {
        self.event_types.clone()
    }

    async fn handle_event(&self, event: &Event<ID>) -> std::result::Result<(), BusError> {
        // The engine may be gone while the bus still holds the handler.
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };

        shared
            .dispatch_online(&self.projection_name, event)
            .await
            .map_err(|e| BusError::Handler {
                handler_name: self.handler_name(),
                message: e.to_string(),
            })
    }
}
