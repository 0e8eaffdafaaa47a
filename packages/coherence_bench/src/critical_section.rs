use parking_lot::Mutex;

/// A mutual-exclusion guard around workload kernel invocations.
///
/// One instance is created per benchmark run and handed by reference to every execution unit
/// that must be serialized. While one unit is inside [`guarded_run()`][Self::guarded_run], every
/// other unit calling it on the same instance blocks, without timeout, until the first one leaves.
///
/// The lock protects no data of its own. It only orders kernel invocations, which is what makes
/// the outcome of a multi-threaded run independent of scheduling.
///
/// # Example
///
/// ```
/// use coherence_bench::{CriticalSection, SharedArena, transform};
///
/// let arena = SharedArena::allocate()?;
/// let critical_section = CriticalSection::new();
///
/// critical_section.guarded_run(|| transform(arena.buffer()));
/// # Ok::<(), coherence_bench::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct CriticalSection {
    lock: Mutex<()>,
}

impl CriticalSection {
    /// Creates a new, unlocked critical section.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `kernel` exactly once while holding the lock.
    ///
    /// The lock is released however `kernel` exits, including by unwinding.
    pub fn guarded_run<R>(&self, kernel: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();

        kernel()
    }

    #[cfg(test)]
    fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}
