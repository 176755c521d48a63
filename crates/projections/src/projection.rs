//! Core projection trait and engine-owned status tracking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use common::AggregateId;
use event_store::{Event, EventId};

use crate::Result;

/// Lifecycle state of a registered projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionState {
    /// Registered but not processing; deliveries are no-ops.
    Stopped,
    /// Processing delivered events.
    Running,
    /// A rebuild is in progress.
    Rebuilding,
    /// A terminal failure occurred; see `last_error`.
    Error,
}

impl std::fmt::Display for ProjectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Rebuilding => "rebuilding",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Live status of a registered projection, owned by the engine.
#[derive(Debug, Clone)]
pub struct ProjectionStatus {
    pub name: String,
    pub state: ProjectionState,
    pub last_event_id: Option<EventId>,
    pub last_event_time: Option<DateTime<Utc>>,
    pub processed_events: u64,
    pub failed_events: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectionStatus {
    /// Creates a fresh status in the `Stopped` state.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            state: ProjectionState::Stopped,
            last_event_id: None,
            last_event_time: None,
            processed_events: 0,
            failed_events: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A projection that folds events into a read model.
///
/// Projections are external collaborators of the engine: the engine
/// subscribes them to their declared event types, dispatches events, tracks
/// their status, and drives replay and rebuild. Handlers must be idempotent;
/// delivery is at-least-once.
#[async_trait]
pub trait Projection<ID: AggregateId>: Send + Sync {
    /// Returns the unique name of this projection.
    fn name(&self) -> &str;

    /// Returns the event types this projection consumes.
    fn event_types(&self) -> Vec<String>;

    /// Handles a single event, updating the projection's read model.
    async fn handle(&self, event: &Event<ID>) -> Result<()>;

    /// Rebuilds the read model from scratch out of the given slice.
    async fn rebuild(&self, events: &[Event<ID>]) -> Result<()>;
}
