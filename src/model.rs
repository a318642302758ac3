use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Enumerations ─────────────────────────────────────────────────

/// Error returned when a text value does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Declares a text-mapped enum with `as_str`, `Display` and `FromStr`.
/// Parsing is case-insensitive.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($text) {
                        return Ok($name::$variant);
                    }
                )+
                Err(UnknownVariant { kind: $kind, value: s.to_string() })
            }
        }
    };
}

text_enum!(
    /// Whether a scope is one time block or the whole event's running order.
    ScopeKind, "scope kind" {
        Block => "block",
        Event => "event",
    }
);

text_enum!(
    PerformanceType, "performance type" {
        Comedy => "Comedy",
        Music => "Music",
        Dance => "Dance",
        Poetry => "Poetry",
        Karaoke => "Karaoke",
    }
);

text_enum!(
    PaymentMethod, "payment method" {
        Venmo => "venmo",
        CashApp => "cashapp",
        ApplePay => "applepay",
        Cash => "cash",
    }
);

text_enum!(
    PaymentStatus, "payment status" {
        Pending => "pending",
        Initiated => "initiated",
        Paid => "paid",
        CashPending => "cash-pending",
    }
);

impl PaymentMethod {
    /// Status a booking starts in when the caller does not choose one.
    /// Cash waits for staff; everything else has been handed to a provider.
    pub fn initial_status(&self) -> PaymentStatus {
        match self {
            PaymentMethod::Cash => PaymentStatus::CashPending,
            _ => PaymentStatus::Initiated,
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

/// Everything the caller knows about a booking before it has a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetails {
    pub performer_name: String,
    pub performance_type: PerformanceType,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub device_id: String,
    pub song_info: Option<String>,
    pub wants_video: bool,
}

impl BookingDetails {
    pub fn new(
        performer_name: impl Into<String>,
        performance_type: PerformanceType,
        payment_method: PaymentMethod,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            performer_name: performer_name.into(),
            performance_type,
            payment_method,
            payment_status: payment_method.initial_status(),
            device_id: device_id.into(),
            song_info: None,
            wants_video: false,
        }
    }
}

/// Insert payload: details plus the candidate slot chosen by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub scope_id: Ulid,
    pub slot_number: u32,
    pub approximate_time: Option<Ms>,
    pub details: BookingDetails,
}

/// A persisted booking. `id` and `created_at` are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub scope_id: Ulid,
    pub slot_number: u32,
    pub approximate_time: Option<Ms>,
    pub details: BookingDetails,
    pub created_at: Ms,
}

// ── Scopes ───────────────────────────────────────────────────────

/// A break inside a scope's running order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Break {
    pub id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ScopeState {
    pub id: Ulid,
    pub kind: ScopeKind,
    pub name: Option<String>,
    pub capacity: u32,
    pub starts_at: Ms,
    /// Average minutes per performance, used for time projection.
    pub slot_minutes: u32,
    /// Sorted by `span.start`.
    pub breaks: Vec<Break>,
    /// Live bookings keyed by slot number.
    pub bookings: BTreeMap<u32, Booking>,
}

impl ScopeState {
    pub fn new(
        id: Ulid,
        kind: ScopeKind,
        name: Option<String>,
        capacity: u32,
        starts_at: Ms,
        slot_minutes: u32,
    ) -> Self {
        Self {
            id,
            kind,
            name,
            capacity,
            starts_at,
            slot_minutes,
            breaks: Vec::new(),
            bookings: BTreeMap::new(),
        }
    }

    pub fn filled(&self) -> u32 {
        self.bookings.len() as u32
    }

    pub fn occupied_slots(&self) -> Vec<u32> {
        self.bookings.keys().copied().collect()
    }

    pub fn max_slot(&self) -> Option<u32> {
        self.bookings.keys().next_back().copied()
    }

    /// Insert break maintaining sort order by span.start.
    pub fn insert_break(&mut self, brk: Break) {
        let pos = self
            .breaks
            .binary_search_by_key(&brk.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.breaks.insert(pos, brk);
    }

    pub fn remove_break(&mut self, id: Ulid) -> Option<Break> {
        let pos = self.breaks.iter().position(|b| b.id == id)?;
        Some(self.breaks.remove(pos))
    }

    pub fn overlapping_break(&self, span: &Span) -> Option<&Break> {
        self.breaks.iter().find(|b| b.span.overlaps(span))
    }

    pub fn find_booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.values().find(|b| b.id == id)
    }

    pub fn find_booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.values_mut().find(|b| b.id == id)
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let slot = self.find_booking(id)?.slot_number;
        self.bookings.remove(&slot)
    }

    pub fn snapshot(&self) -> Scope {
        Scope {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            capacity: self.capacity,
            starts_at: self.starts_at,
            slot_minutes: self.slot_minutes,
            breaks: self.breaks.iter().map(|b| b.span).collect(),
            filled: self.filled(),
        }
    }
}

/// Read-only view of a scope handed to the allocator and to query results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub id: Ulid,
    pub kind: ScopeKind,
    pub name: Option<String>,
    pub capacity: u32,
    pub starts_at: Ms,
    pub slot_minutes: u32,
    pub breaks: Vec<Span>,
    pub filled: u32,
}

/// Every state change, as written to the WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ScopeCreated {
        id: Ulid,
        kind: ScopeKind,
        name: Option<String>,
        capacity: u32,
        starts_at: Ms,
        slot_minutes: u32,
    },
    ScopeDeleted {
        id: Ulid,
    },
    BreakAdded {
        id: Ulid,
        scope_id: Ulid,
        span: Span,
    },
    BreakRemoved {
        id: Ulid,
        scope_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingDeleted {
        id: Ulid,
        scope_id: Ulid,
    },
    PaymentStatusChanged {
        id: Ulid,
        scope_id: Ulid,
        status: PaymentStatus,
    },
}
