//! Hard limits enforced by the store and the SQL front end.

use crate::model::Ms;

pub const MAX_SCOPES: usize = 10_000;
/// Queues are human-sized; nothing near this is expected in practice.
pub const MAX_CAPACITY: u32 = 1_000;
pub const MAX_BREAKS_PER_SCOPE: usize = 64;

pub const MAX_SCOPE_NAME_LEN: usize = 256;
pub const MAX_PERFORMER_NAME_LEN: usize = 80;
pub const MIN_DEVICE_ID_LEN: usize = 8;
pub const MAX_DEVICE_ID_LEN: usize = 128;
pub const MAX_SONG_INFO_LEN: usize = 500;

pub const MAX_SLOT_MINUTES: u32 = 240;
pub const DEFAULT_SLOT_MINUTES: u32 = 4;

pub const DEFAULT_RETRY_BUDGET: u32 = 5;
pub const MAX_RETRY_BUDGET: u32 = 50;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single break may not exceed one day.
pub const MAX_BREAK_DURATION_MS: Ms = 86_400_000;
