use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

fn validate_timestamp(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_scope(
    name: Option<&str>,
    capacity: u32,
    starts_at: Ms,
    slot_minutes: u32,
) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_SCOPE_NAME_LEN {
            return Err(EngineError::LimitExceeded("scope name too long"));
        }
    if capacity == 0 {
        return Err(EngineError::Invalid("capacity must be at least 1".into()));
    }
    if capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    if slot_minutes == 0 || slot_minutes > MAX_SLOT_MINUTES {
        return Err(EngineError::Invalid(format!(
            "slot_minutes must be in 1..={MAX_SLOT_MINUTES}"
        )));
    }
    validate_timestamp(starts_at)
}

pub(crate) fn validate_break(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Invalid("break must end after it starts".into()));
    }
    validate_timestamp(span.start)?;
    validate_timestamp(span.end)?;
    if span.duration_ms() > MAX_BREAK_DURATION_MS {
        return Err(EngineError::LimitExceeded("break too long"));
    }
    Ok(())
}

/// Field checks a booking must pass before it may claim a slot.
pub(crate) fn validate_details(details: &BookingDetails) -> Result<(), EngineError> {
    let name = details.performer_name.trim();
    if name.is_empty() {
        return Err(EngineError::Invalid("performer name is empty".into()));
    }
    if name.chars().count() > MAX_PERFORMER_NAME_LEN {
        return Err(EngineError::LimitExceeded("performer name too long"));
    }
    if details.device_id.len() < MIN_DEVICE_ID_LEN {
        return Err(EngineError::Invalid(format!(
            "device id must be at least {MIN_DEVICE_ID_LEN} characters"
        )));
    }
    if details.device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(EngineError::LimitExceeded("device id too long"));
    }
    if let Some(ref song) = details.song_info
        && song.len() > MAX_SONG_INFO_LEN {
            return Err(EngineError::LimitExceeded("song info too long"));
        }
    Ok(())
}

/// The uniqueness guard. Caller holds the scope's write lock.
pub(crate) fn check_slot_free(scope: &ScopeState, slot_number: u32) -> Result<(), EngineError> {
    if slot_number == 0 || slot_number > scope.capacity {
        return Err(EngineError::SlotOutOfRange {
            slot_number,
            capacity: scope.capacity,
        });
    }
    if scope.bookings.contains_key(&slot_number) {
        return Err(EngineError::SlotTaken {
            scope_id: scope.id,
            slot_number,
        });
    }
    Ok(())
}
