use std::mem;
use std::num::NonZero;
use std::str::FromStr;

use derive_more::Display;
use libc::cpu_set_t;
use tracing::{debug, warn};

use crate::pal::{Bindings, BindingsFacade};
use crate::{CoreId, Error, Result, UnitId};

/// How execution units are placed on processor cores relative to each other.
#[derive(Clone, Copy, Debug, Default, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Placement {
    /// Every unit runs on core 0, so units take turns on one core and share its caches.
    #[display("same")]
    Same,

    /// Unit N runs on core N-1, so the shared buffer bounces between the caches of different
    /// cores.
    #[default]
    #[display("diff")]
    Diff,
}

impl FromStr for Placement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "same" => Ok(Self::Same),
            "diff" => Ok(Self::Diff),
            other => Err(Error::InvalidConfiguration {
                problem: format!("unknown affinity '{other}', expected 'same' or 'diff'"),
            }),
        }
    }
}

/// Assigns each execution unit of a run to a processor core.
///
/// Placement is advisory. Several units may be assigned the same core, and if the operating
/// system rejects an assignment the unit simply runs wherever the scheduler puts it.
///
/// # Example
///
/// ```
/// use new_zealand::nz;
/// use coherence_bench::{AffinityPlan, Placement};
///
/// let plan = AffinityPlan::from_placement(Placement::Diff, nz!(2));
///
/// assert_eq!(plan.core_for(1), Some(0));
/// assert_eq!(plan.core_for(2), Some(1));
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AffinityPlan {
    // Index 0 holds the core of unit 1, and so on.
    cores: Vec<CoreId>,
}

impl AffinityPlan {
    /// Creates a plan for `unit_count` units following the given placement.
    #[must_use]
    pub fn from_placement(placement: Placement, unit_count: NonZero<usize>) -> Self {
        let cores = (0..unit_count.get())
            .map(|index| match placement {
                Placement::Same => 0,
                Placement::Diff => {
                    CoreId::try_from(index).expect("unit counts are nowhere near u32::MAX")
                }
            })
            .collect();

        Self { cores }
    }

    /// Creates a plan that assigns `cores[0]` to unit 1, `cores[1]` to unit 2, and so on.
    ///
    /// The cores are not checked against the hardware. A core that does not exist is only
    /// detected when the plan is applied.
    #[must_use]
    pub fn explicit(cores: Vec<CoreId>) -> Self {
        Self { cores }
    }

    /// Number of units the plan has an assignment for.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.cores.len()
    }

    /// The core assigned to `unit`, if the plan covers it.
    #[must_use]
    pub fn core_for(&self, unit: UnitId) -> Option<CoreId> {
        let index = usize::try_from(unit.checked_sub(1)?).ok()?;

        self.cores.get(index).copied()
    }

    /// Restricts the calling thread to the core assigned to `unit`.
    ///
    /// Call this from the execution unit itself, right after it starts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoreOutOfRange`] if the core cannot be expressed as a scheduler core set,
    /// [`Error::Affinity`] if the operating system rejects the request and
    /// [`Error::InvalidConfiguration`] if the plan has no core for `unit`.
    pub fn apply(&self, unit: UnitId) -> Result<()> {
        self.apply_core(unit, &BindingsFacade::target())
    }

    /// Like [`apply()`][Self::apply] but logs a failure instead of returning it, leaving the
    /// unit wherever the scheduler places it.
    ///
    /// Returns whether the placement was applied.
    pub fn apply_or_warn(&self, unit: UnitId) -> bool {
        self.apply_or_warn_core(unit, &BindingsFacade::target())
    }

    pub(crate) fn apply_or_warn_core(&self, unit: UnitId, bindings: &BindingsFacade) -> bool {
        match self.apply_core(unit, bindings) {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    unit,
                    %error,
                    "affinity not applied, continuing with default scheduler placement"
                );
                false
            }
        }
    }

    fn apply_core(&self, unit: UnitId, bindings: &BindingsFacade) -> Result<()> {
        let core = self
            .core_for(unit)
            .ok_or_else(|| Error::InvalidConfiguration {
                problem: format!("affinity plan has no core for unit {unit}"),
            })?;

        pin_current_thread_to(&[core], bindings)?;

        debug!(
            unit,
            core,
            running_on = bindings.sched_getcpu(),
            "affinity applied"
        );

        Ok(())
    }
}

fn pin_current_thread_to(cores: &[CoreId], bindings: &BindingsFacade) -> Result<()> {
    let cpuset = cpu_set_of(cores).map_err(|core| Error::CoreOutOfRange { core })?;

    bindings
        .sched_setaffinity_current(&cpuset)
        .map_err(|source| Error::Affinity {
            cores: cpulist::emit(cores.iter().copied()),
            source,
        })
}

// CPU_SETSIZE is a small positive constant, so this cannot lose information.
const MAX_CORE_SET_SIZE: usize = libc::CPU_SETSIZE.unsigned_abs() as usize;

/// Builds a scheduler core set containing the given cores.
///
/// Returns the first core that cannot be represented if any core index is too large.
fn cpu_set_of(cores: &[CoreId]) -> std::result::Result<cpu_set_t, CoreId> {
    // SAFETY: All zeroes is a valid (empty) cpu_set_t.
    let mut cpuset: cpu_set_t = unsafe { mem::zeroed() };

    for &core in cores {
        let index = usize::try_from(core)
            .ok()
            .filter(|&index| index < MAX_CORE_SET_SIZE)
            .ok_or(core)?;

        // SAFETY: The index is within the bounds of the set, checked above.
        unsafe {
            libc::CPU_SET(index, &mut cpuset);
        }
    }

    Ok(cpuset)
}
