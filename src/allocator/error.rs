use std::fmt;

use ulid::Ulid;

use super::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// No candidate exists under the policy. Not retried.
    ScopeFull { scope_id: Ulid, capacity: u32 },
    /// Every attempt lost its race. The scope may still have room.
    Contention { scope_id: Ulid, attempts: u32 },
    /// Infrastructure or input fault. Surfaced on first occurrence.
    Storage(StoreError),
}

impl AllocationError {
    /// Whether the same request may succeed if the caller tries again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            AllocationError::ScopeFull { .. } => false,
            AllocationError::Contention { .. } => true,
            AllocationError::Storage(StoreError::Rejected(_) | StoreError::ScopeNotFound(_)) => false,
            AllocationError::Storage(_) => true,
        }
    }

    /// Text suitable for showing to the person booking.
    pub fn user_message(&self) -> &'static str {
        match self {
            AllocationError::ScopeFull { .. } => "This queue is full, please pick another option.",
            AllocationError::Contention { .. } => "Could not book right now, please try again.",
            AllocationError::Storage(_) => "Something went wrong, please try again in a moment.",
        }
    }
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::ScopeFull { scope_id, capacity } => {
                write!(f, "scope {scope_id} is full (capacity {capacity})")
            }
            AllocationError::Contention { scope_id, attempts } => {
                write!(f, "could not claim a slot in scope {scope_id} after {attempts} attempts")
            }
            AllocationError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for AllocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocationError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for AllocationError {
    fn from(e: StoreError) -> Self {
        AllocationError::Storage(e)
    }
}
