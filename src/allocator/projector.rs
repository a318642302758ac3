//! Approximate performance times for sequential queues.
//!
//! Display-only: nothing here feeds back into slot allocation.

use crate::model::{Ms, Span};

/// Sort and merge overlapping or touching spans, so that a clock moved to the
/// end of one merged break is never inside another.
pub fn normalize_breaks(breaks: &[Span]) -> Vec<Span> {
    let mut sorted = breaks.to_vec();
    sorted.sort_by_key(|s| s.start);
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Projected start of `slot_number`, counting from `start` in steps of
/// `avg_duration`. Each step that lands inside a break is pushed to the break's
/// end; the break itself is not a slot.
pub fn project(slot_number: u32, start: Ms, avg_duration: Ms, breaks: &[Span]) -> Ms {
    let breaks = normalize_breaks(breaks);
    let mut clock = start;
    let mut next_break = 0usize;
    for _ in 1..slot_number {
        clock = clock.saturating_add(avg_duration);
        while next_break < breaks.len() && breaks[next_break].end <= clock {
            next_break += 1;
        }
        if let Some(brk) = breaks.get(next_break)
            && brk.contains_instant(clock) {
                clock = brk.end;
                next_break += 1;
            }
    }
    clock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MINUTE_MS;

    /// 18:00 on an arbitrary day, in ms.
    const T: Ms = 1_761_847_200_000;

    fn at(minutes: Ms) -> Ms {
        T + minutes * MINUTE_MS
    }

    #[test]
    fn first_slot_is_start() {
        assert_eq!(project(1, T, 4 * MINUTE_MS, &[]), T);
        assert_eq!(project(1, T, 9 * MINUTE_MS, &[Span::new(T, at(10))]), T);
    }

    #[test]
    fn no_breaks_is_linear() {
        for k in 1..20u32 {
            assert_eq!(project(k, T, 4 * MINUTE_MS, &[]), T + (k as Ms - 1) * 4 * MINUTE_MS);
        }
    }

    #[test]
    fn break_pushes_slot_to_its_end() {
        let breaks = [Span::new(at(20), at(30))];
        let d = 4 * MINUTE_MS;
        assert_eq!(project(5, T, d, &breaks), at(16));
        // Slot 6 would start at 18:20, inside the break.
        assert_eq!(project(6, T, d, &breaks), at(30));
        assert_eq!(project(7, T, d, &breaks), at(34));
    }

    #[test]
    fn landing_mid_break_jumps_to_end() {
        let breaks = [Span::new(at(18), at(30))];
        assert_eq!(project(6, T, 4 * MINUTE_MS, &breaks), at(30));
    }

    #[test]
    fn break_end_is_not_inside() {
        let breaks = [Span::new(at(5), at(10))];
        assert_eq!(project(2, T, 10 * MINUTE_MS, &breaks), at(10));
        assert_eq!(project(3, T, 10 * MINUTE_MS, &breaks), at(20));
    }

    #[test]
    fn adjacent_breaks_are_cleared_together() {
        let breaks = [Span::new(at(25), at(30)), Span::new(at(20), at(25))];
        assert_eq!(project(6, T, 4 * MINUTE_MS, &breaks), at(30));
    }

    #[test]
    fn overlapping_breaks_merge() {
        let merged = normalize_breaks(&[
            Span::new(50, 60),
            Span::new(10, 30),
            Span::new(20, 40),
            Span::new(40, 45),
        ]);
        assert_eq!(merged, vec![Span::new(10, 45), Span::new(50, 60)]);
    }

    #[test]
    fn several_breaks_across_an_evening() {
        let breaks = [
            Span::new(at(80), at(90)),
            Span::new(at(200), at(210)),
        ];
        let d = 4 * MINUTE_MS;
        // Slots 1..=20 fill 18:00..19:20; slot 21 would start at 19:20.
        assert_eq!(project(21, T, d, &breaks), at(90));
        assert_eq!(project(22, T, d, &breaks), at(94));
        // Slot 49 would start at 21:22, inside the second break.
        assert_eq!(project(48, T, d, &breaks), at(198));
        assert_eq!(project(49, T, d, &breaks), at(210));
        assert_eq!(project(50, T, d, &breaks), at(214));
    }
}
