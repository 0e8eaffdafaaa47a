//! Timed run loop of one execution unit.

use std::fmt;
use std::num::NonZero;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{CriticalSection, KernelOutcome, SharedBuffer, UnitId};

/// How kernel invocations of one execution unit are coordinated with those of its peers.
#[derive(Clone, Copy, Debug)]
#[expect(
    clippy::exhaustive_enums,
    reason = "a unit either takes the lock or it does not"
)]
pub enum SyncDiscipline<'a> {
    /// Every invocation runs inside the given critical section.
    Exclusive(&'a CriticalSection),

    /// Invocations run without any coordination, racing with other units.
    Unsynchronized,
}

/// Timing of one execution unit's run loop.
///
/// The record is created when the loop starts and finalized when it ends. Kernel invocations
/// that found the buffer empty are counted as completed iterations.
#[derive(Clone, Copy, Debug)]
pub struct TimingRecord {
    unit: UnitId,
    iterations: NonZero<u32>,
    skipped: u32,
    started: Instant,
    finished: Instant,
}

impl TimingRecord {
    /// The execution unit that produced this record.
    #[must_use]
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// How many kernel invocations the unit completed.
    #[must_use]
    pub fn iterations(&self) -> NonZero<u32> {
        self.iterations
    }

    /// How many of the invocations found the buffer empty and did nothing.
    #[must_use]
    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    /// Wall-clock time from the start of the first iteration to the end of the last one.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }

    /// Mean wall-clock time of one iteration.
    #[must_use]
    pub fn average_per_iteration(&self) -> Duration {
        self.elapsed()
            .checked_div(self.iterations.get())
            .expect("guarded by NonZero iteration count")
    }
}

impl fmt::Display for TimingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unit {}: Total time for {} iterations: {:.6} seconds (avg: {:.9} sec/iter)",
            self.unit,
            self.iterations,
            self.elapsed().as_secs_f64(),
            self.average_per_iteration().as_secs_f64()
        )
    }
}

/// Runs `kernel` against `buffer` for `iterations` back-to-back invocations and times the loop
/// with a monotonic clock.
///
/// There is no pause between iterations and no retry. The loop always runs to completion.
pub fn run<K>(
    unit: UnitId,
    buffer: SharedBuffer<'_>,
    iterations: NonZero<u32>,
    kernel: K,
    discipline: SyncDiscipline<'_>,
) -> TimingRecord
where
    K: Fn(SharedBuffer<'_>) -> KernelOutcome,
{
    let mut skipped: u32 = 0;

    debug!(unit, iterations = iterations.get(), ?discipline, "run loop starting");

    let started = Instant::now();

    for _ in 0..iterations.get() {
        let outcome = match discipline {
            SyncDiscipline::Exclusive(critical_section) => {
                critical_section.guarded_run(|| kernel(buffer))
            }
            SyncDiscipline::Unsynchronized => kernel(buffer),
        };

        if outcome == KernelOutcome::SkippedEmpty {
            skipped = skipped.saturating_add(1);
        }
    }

    let finished = Instant::now();

    let record = TimingRecord {
        unit,
        iterations,
        skipped,
        started,
        finished,
    };

    debug!(unit, elapsed = ?record.elapsed(), skipped, "run loop finished");

    record
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::thread;

    use new_zealand::nz;

    use super::*;
    use crate::{EMPTY_VALUE, SharedArena, trajectory, transform};

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call platform APIs")]
    fn invokes_kernel_once_per_iteration() {
        let arena = SharedArena::allocate().unwrap();
        let calls = Cell::new(0_u32);

        let record = run(
            3,
            arena.buffer(),
            nz!(25),
            |_| {
                calls.set(calls.get() + 1);
                KernelOutcome::Applied
            },
            SyncDiscipline::Unsynchronized,
        );

        assert_eq!(calls.get(), 25);
        assert_eq!(record.unit(), 3);
        assert_eq!(record.iterations().get(), 25);
        assert_eq!(record.skipped(), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call platform APIs")]
    fn empty_buffer_iterations_still_count() {
        let arena = SharedArena::allocate().unwrap();
        arena.buffer().set(0, EMPTY_VALUE);
        let critical_section = CriticalSection::new();

        let record = run(
            1,
            arena.buffer(),
            nz!(10),
            transform,
            SyncDiscipline::Exclusive(&critical_section),
        );

        assert_eq!(record.iterations().get(), 10);
        assert_eq!(record.skipped(), 10);
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call platform APIs")]
    fn single_unit_reaches_expected_value() {
        let arena = SharedArena::allocate_with_fill(1).unwrap();
        let critical_section = CriticalSection::new();

        run(
            1,
            arena.buffer(),
            nz!(3),
            transform,
            SyncDiscipline::Exclusive(&critical_section),
        );

        assert_eq!(arena.buffer().get(0), Some(2));
        assert_eq!(arena.buffer().get(0), trajectory(1).nth(2));
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call platform APIs")]
    fn elapsed_covers_the_work() {
        let arena = SharedArena::allocate().unwrap();

        let record = run(
            1,
            arena.buffer(),
            nz!(4),
            |_| {
                thread::sleep(Duration::from_millis(5));
                KernelOutcome::Applied
            },
            SyncDiscipline::Unsynchronized,
        );

        assert!(record.elapsed() >= Duration::from_millis(20));
        assert!(record.average_per_iteration() >= Duration::from_millis(5));
        assert!(record.average_per_iteration() <= record.elapsed());
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call platform APIs")]
    fn report_line_names_unit_and_iterations() {
        let arena = SharedArena::allocate().unwrap();

        let record = run(
            2,
            arena.buffer(),
            nz!(1000),
            transform,
            SyncDiscipline::Unsynchronized,
        );

        let line = record.to_string();

        assert!(
            line.starts_with("Unit 2: Total time for 1000 iterations: "),
            "{line}"
        );
        assert!(line.ends_with(" sec/iter)"), "{line}");
    }
}
