use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::model::{ScopeKind, UnknownVariant};

/// How the next slot number is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationPolicy {
    /// Lowest free number in `1..=capacity`; cancelled slots are reused.
    GapFilling,
    /// Highest taken number + 1; never reuses, keeps slot order equal to
    /// booking order so times can be projected from it.
    Sequential,
}

impl AllocationPolicy {
    /// Blocks fill gaps; event-wide queues run in arrival order.
    pub fn default_for(kind: ScopeKind) -> Self {
        match kind {
            ScopeKind::Block => AllocationPolicy::GapFilling,
            ScopeKind::Event => AllocationPolicy::Sequential,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationPolicy::GapFilling => "gap_filling",
            AllocationPolicy::Sequential => "sequential",
        }
    }

    pub fn projects_time(&self) -> bool {
        matches!(self, AllocationPolicy::Sequential)
    }
}

impl fmt::Display for AllocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationPolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "gap_filling" | "gap" => Ok(AllocationPolicy::GapFilling),
            "sequential" | "seq" => Ok(AllocationPolicy::Sequential),
            _ => Err(UnknownVariant {
                kind: "allocation policy",
                value: s.to_string(),
            }),
        }
    }
}

/// Lowest number in `1..=capacity` absent from `occupied`, in any order.
pub fn first_gap(occupied: &[u32], capacity: u32) -> Option<u32> {
    let sorted: BTreeSet<u32> = occupied.iter().copied().collect();
    let mut expected = 1u32;
    for slot in sorted {
        if slot > expected {
            break;
        }
        if slot == expected {
            expected += 1;
        }
    }
    (expected <= capacity).then_some(expected)
}

/// `max + 1` (1 for an empty scope), if it still fits.
pub fn next_after(max: Option<u32>, capacity: u32) -> Option<u32> {
    let next = max.map_or(1, |m| m.saturating_add(1));
    (next <= capacity).then_some(next)
}
