use ulid::Ulid;

use crate::model::Span;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Uniqueness guard: another live booking holds this slot.
    SlotTaken { scope_id: Ulid, slot_number: u32 },
    SlotOutOfRange { slot_number: u32, capacity: u32 },
    BreakOverlap { existing: Ulid, span: Span },
    HasBookings(Ulid),
    Invalid(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotTaken { scope_id, slot_number } => {
                write!(f, "slot {slot_number} already taken in scope {scope_id}")
            }
            EngineError::SlotOutOfRange { slot_number, capacity } => {
                write!(f, "slot {slot_number} outside 1..={capacity}")
            }
            EngineError::BreakOverlap { existing, span } => write!(
                f,
                "break [{}, {}) overlaps existing break {existing}",
                span.start, span.end
            ),
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete scope {id}: has bookings")
            }
            EngineError::Invalid(msg) => write!(f, "invalid: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
