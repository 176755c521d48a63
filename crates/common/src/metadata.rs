//! Well-known event metadata keys.
//!
//! Metadata travels with every event as a string-keyed JSON map. These keys
//! are the ones the core itself reads or that decorators are expected to
//! populate before persistence.

/// Tenant that produced the event. Read by the tenant-filtering projection
/// decorator.
pub const TENANT_ID: &str = "tenant_id";

/// Correlates all events caused by the same originating request.
pub const CORRELATION_ID: &str = "correlation_id";

/// The id of the event or command that directly caused this event.
pub const CAUSATION_ID: &str = "causation_id";
