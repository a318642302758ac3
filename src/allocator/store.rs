use std::fmt;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Booking, NewBooking};

/// Storage failures that are never retried by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    ScopeNotFound(Ulid),
    /// The store refused the payload (limits, malformed fields).
    Rejected(String),
    /// Durable write or backing service failed.
    Unavailable(String),
    /// The caller's deadline passed between attempts.
    DeadlineExceeded,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ScopeNotFound(id) => write!(f, "scope not found: {id}"),
            StoreError::Rejected(msg) => write!(f, "rejected by store: {msg}"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::DeadlineExceeded => write!(f, "allocation deadline exceeded"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Why an insert did not persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
    /// Another live booking already holds this slot in the scope.
    Duplicate { scope_id: Ulid, slot_number: u32 },
    Failed(StoreError),
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::Duplicate { scope_id, slot_number } => {
                write!(f, "slot {slot_number} already taken in scope {scope_id}")
            }
            InsertError::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InsertError {}

impl From<StoreError> for InsertError {
    fn from(e: StoreError) -> Self {
        InsertError::Failed(e)
    }
}

/// The allocator's only view of persistence.
///
/// Implementations must enforce uniqueness of `(scope_id, slot_number)` among
/// live bookings atomically inside `insert_booking`, and report a lost race as
/// `InsertError::Duplicate` so the caller can recompute and retry.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Slot numbers held by live bookings. Order is not significant.
    async fn occupied_slots(&self, scope_id: Ulid) -> Result<Vec<u32>, StoreError>;

    async fn max_slot(&self, scope_id: Ulid) -> Result<Option<u32>, StoreError> {
        Ok(self.occupied_slots(scope_id).await?.into_iter().max())
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, InsertError>;
}
