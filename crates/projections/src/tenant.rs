//! Tenant-filtering projection decorator.
//!
//! Multi-tenant deployments run one projection instance per tenant; the
//! decorator forwards only events whose `metadata["tenant_id"]` matches. To
//! the engine it is just another projection; the engine never inspects
//! tenant metadata itself.

use async_trait::async_trait;

use common::{AggregateId, TENANT_ID};
use event_store::Event;

use crate::Result;
use crate::projection::Projection;

/// Wraps a projection so it only observes one tenant's events.
pub struct TenantProjection<P> {
    inner: P,
    tenant_id: String,
}

impl<P> TenantProjection<P> {
    /// Creates a decorator that forwards only events of `tenant_id`.
    pub fn new(inner: P, tenant_id: impl Into<String>) -> Self {
        Self {
            inner,
            tenant_id: tenant_id.into(),
        }
    }

    /// Returns the wrapped projection.
    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn matches<ID: AggregateId>(&self, event: &Event<ID>) -> bool {
        event
            .metadata
            .get(TENANT_ID)
            .and_then(|value| value.as_str())
            .is_some_and(|tenant| tenant == self.tenant_id)
    }
}

#[async_trait]
impl<ID: AggregateId, P: Projection<ID>> Projection<ID> for TenantProjection<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn event_types(&self) -> Vec<String> {
        self.inner.event_types()
    }

    async fn handle(&self, event: &Event<ID>) -> Result<()> {
        if !self.matches(event) {
            return Ok(());
        }
        self.inner.handle(event).await
    }

    async fn rebuild(&self, events: &[Event<ID>]) -> Result<()> {
        let filtered: Vec<Event<ID>> = events
            .iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect();
        self.inner.rebuild(&filtered).await
    }
}
