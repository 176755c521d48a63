use std::fmt::{Debug, Display};
use std::hash::Hash;

use uuid::Uuid;

/// Contract for aggregate identifier types.
///
/// The event store is generic over the key that identifies an aggregate
/// instance. Any ordered, hashable, printable value works as a key; the
/// durable backend is concrete over `i64`.
pub trait AggregateId:
    Clone + Eq + Hash + Ord + Display + Debug + Send + Sync + 'static
{
    /// Whether this value identifies a real aggregate.
    ///
    /// Appends reject events whose aggregate id is not valid.
    fn is_valid(&self) -> bool;
}

impl AggregateId for i64 {
    fn is_valid(&self) -> bool {
        *self > 0
    }
}

impl AggregateId for u64 {
    fn is_valid(&self) -> bool {
        *self > 0
    }
}

impl AggregateId for Uuid {
    fn is_valid(&self) -> bool {
        !self.is_nil()
    }
}

impl AggregateId for String {
    fn is_valid(&self) -> bool {
        !self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_ids_must_be_positive() {
        assert!(1i64.is_valid());
        assert!(!0i64.is_valid());
        assert!(!(-5i64).is_valid());
    }

    #[test]
    fn uuid_ids_must_be_non_nil() {
        assert!(Uuid::new_v4().is_valid());
        assert!(!Uuid::nil().is_valid());
    }

    #[test]
    fn string_ids_must_be_non_empty() {
        assert!("order-1".to_string().is_valid());
        assert!(!String::new().is_valid());
    }
}
