pub mod metadata;
pub mod types;

pub use metadata::{CAUSATION_ID, CORRELATION_ID, TENANT_ID};
pub use types::AggregateId;
