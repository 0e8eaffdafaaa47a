//! The workload kernel: a deterministic per-element arithmetic transform that every execution
//! unit applies to the shared buffer over and over.
//!
//! The arithmetic itself is irrelevant. What matters is that each invocation reads and writes
//! every element of the buffer, so units running on different cores keep pulling the same cache
//! lines away from each other.

use std::iter;
use std::sync::atomic::Ordering;

use tracing::error;

use crate::SharedBuffer;

const ADDEND: i32 = 15;
const DIVISOR: i32 = 71;
const MASK: i32 = 2;

/// What a single kernel invocation did to the buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "an invocation either transforms the buffer or it does not"
)]
pub enum KernelOutcome {
    /// Every element was transformed.
    Applied,

    /// The buffer was empty, so nothing was touched.
    SkippedEmpty,
}

/// Applies the kernel arithmetic to a single value: add 15, divide by 71 (truncating toward
/// zero), then flip bit 1.
///
/// Arithmetic wraps on overflow, so every `i32` has a well-defined successor.
#[must_use]
pub const fn transform_value(value: i32) -> i32 {
    value.wrapping_add(ADDEND).wrapping_div(DIVISOR) ^ MASK
}

/// Transforms every element of the buffer in index order.
///
/// If the buffer is empty (its first element holds [`EMPTY_VALUE`][crate::EMPTY_VALUE]), an
/// error is logged and the buffer is left untouched.
///
/// Each element is loaded, transformed and stored as separate steps. The kernel does nothing to
/// keep other units from writing in between; callers that need a consistent outcome must
/// serialize invocations, e.g. through a [`CriticalSection`][crate::CriticalSection].
pub fn transform(buffer: SharedBuffer<'_>) -> KernelOutcome {
    if buffer.is_empty() {
        error!("buffer is empty, skipping workload kernel invocation");
        return KernelOutcome::SkippedEmpty;
    }

    // Any ordering between units comes from the caller's critical section, if there is one.
    for cell in buffer.cells() {
        let value = cell.load(Ordering::Relaxed);
        cell.store(transform_value(value), Ordering::Relaxed);
    }

    KernelOutcome::Applied
}

/// The values an element takes on under repeated kernel applications, starting from `initial`.
///
/// The first item is the value after one application, the second after two, and so on. The
/// iterator never ends.
///
/// # Example
///
/// ```
/// use coherence_bench::trajectory;
///
/// let values: Vec<i32> = trajectory(1).take(3).collect();
/// assert_eq!(values, [2, 2, 2]);
/// ```
pub fn trajectory(initial: i32) -> impl Iterator<Item = i32> {
    iter::successors(Some(transform_value(initial)), |&value| {
        Some(transform_value(value))
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{BUFFER_LEN, EMPTY_VALUE, SENTINEL_FILL, SharedArena};

    #[test]
    fn transform_value_pipeline() {
        // (1 + 15) / 71 = 0, 0 ^ 2 = 2
        assert_eq!(transform_value(1), 2);
        // (142 + 15) / 71 = 2, 2 ^ 2 = 0
        assert_eq!(transform_value(142), 0);
        // (-100 + 15) / 71 = -1, -1 ^ 2 = -3
        assert_eq!(transform_value(-100), -3);
    }

    #[test]
    fn transform_value_wraps_instead_of_overflowing() {
        // i32::MAX + 15 wraps to a large negative number.
        let expected = i32::MIN.wrapping_add(14).wrapping_div(71) ^ 2;

        assert_eq!(transform_value(i32::MAX), expected);
    }

    #[test]
    fn sentinel_trajectory_settles() {
        let values: Vec<i32> = trajectory(SENTINEL_FILL).take(6).collect();

        assert_eq!(values, [237_227, 3343, 45, 2, 2, 2]);
    }

    #[test]
    fn trajectory_matches_repeated_application() {
        let mut value = -7_654_321;

        for expected in trajectory(-7_654_321).take(20) {
            value = transform_value(value);
            assert_eq!(value, expected);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call platform APIs")]
    fn transform_applies_to_every_element() {
        let arena = SharedArena::allocate().unwrap();
        let buffer = arena.buffer();

        for index in 0..BUFFER_LEN {
            buffer.set(index, i32::try_from(index).unwrap() * 100 + 1);
        }

        assert_eq!(transform(buffer), KernelOutcome::Applied);

        for index in 0..BUFFER_LEN {
            let original = i32::try_from(index).unwrap() * 100 + 1;
            assert_eq!(buffer.get(index), Some(transform_value(original)));
        }
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call platform APIs")]
    fn empty_buffer_is_left_untouched() {
        let arena = SharedArena::allocate().unwrap();
        let buffer = arena.buffer();
        buffer.set(0, EMPTY_VALUE);

        let before = buffer.snapshot();

        assert_eq!(transform(buffer), KernelOutcome::SkippedEmpty);
        assert_eq!(buffer.snapshot(), before);
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call platform APIs")]
    fn serial_invocations_match_trajectory() {
        let arena = SharedArena::allocate_with_fill(1).unwrap();
        let buffer = arena.buffer();

        for _ in 0..3 {
            assert_eq!(transform(buffer), KernelOutcome::Applied);
        }

        let expected = trajectory(1).nth(2).unwrap();
        assert_eq!(expected, 2);
        assert_eq!(buffer.snapshot(), [expected; BUFFER_LEN]);
    }
}
