use std::fmt::Write as _;
use std::num::NonZero;
use std::str::FromStr;

use derive_more::Display;
use new_zealand::nz;

use crate::{AffinityPlan, CoreId, Error, Placement, Result};

/// Number of execution units in every benchmark run.
pub const UNIT_COUNT: NonZero<usize> = nz!(2);

const DEFAULT_ITERATIONS: NonZero<u32> = nz!(1000);

/// How the execution units of a run are created and coordinated.
#[derive(Clone, Copy, Debug, Default, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ExecutionModel {
    /// Threads of one process, every kernel invocation inside a shared critical section.
    ///
    /// The final buffer contents are the same on every run.
    #[default]
    #[display("threads")]
    Threads,

    /// A parent process and one forked child, invoking the kernel with no coordination at all.
    ///
    /// Updates may be lost to races, so the final buffer contents vary between runs.
    #[display("processes")]
    Processes,
}

impl FromStr for ExecutionModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "threads" => Ok(Self::Threads),
            "processes" => Ok(Self::Processes),
            other => Err(Error::InvalidConfiguration {
                problem: format!("unknown execution model '{other}', expected 'threads' or 'processes'"),
            }),
        }
    }
}

/// Everything a benchmark run needs to know, fixed before the run starts.
///
/// # Example
///
/// ```
/// use new_zealand::nz;
/// use coherence_bench::{BenchConfig, ExecutionModel, Placement};
///
/// let config = BenchConfig::new()
///     .with_placement(Placement::Same)
///     .with_iterations(nz!(50_000))
///     .with_model(ExecutionModel::Threads);
///
/// assert_eq!(config.iterations().get(), 50_000);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BenchConfig {
    placement: Placement,
    iterations: NonZero<u32>,
    show_perf_hint: bool,
    model: ExecutionModel,
    cores: Option<Vec<CoreId>>,
}

impl BenchConfig {
    /// Creates a configuration with default values: units on different cores, 1000 iterations
    /// per unit, threads model, no perf hint.
    #[must_use]
    pub fn new() -> Self {
        Self {
            placement: Placement::default(),
            iterations: DEFAULT_ITERATIONS,
            show_perf_hint: false,
            model: ExecutionModel::default(),
            cores: None,
        }
    }

    /// Sets how units are placed on cores relative to each other.
    #[must_use]
    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Sets how many times each unit invokes the kernel.
    #[must_use]
    pub fn with_iterations(mut self, iterations: NonZero<u32>) -> Self {
        self.iterations = iterations;
        self
    }

    /// Sets whether a `perf` command suggestion is printed before the run.
    #[must_use]
    pub fn with_perf_hint(mut self, show_perf_hint: bool) -> Self {
        self.show_perf_hint = show_perf_hint;
        self
    }

    /// Sets how execution units are created.
    #[must_use]
    pub fn with_model(mut self, model: ExecutionModel) -> Self {
        self.model = model;
        self
    }

    /// Assigns explicit cores to the units, overriding the placement. The first core goes to
    /// unit 1, the second to unit 2.
    #[must_use]
    pub fn with_cores(mut self, cores: Vec<CoreId>) -> Self {
        self.cores = Some(cores);
        self
    }

    /// How units are placed on cores relative to each other.
    #[must_use]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// How many times each unit invokes the kernel.
    #[must_use]
    pub fn iterations(&self) -> NonZero<u32> {
        self.iterations
    }

    /// Whether a `perf` command suggestion is printed before the run.
    #[must_use]
    pub fn show_perf_hint(&self) -> bool {
        self.show_perf_hint
    }

    /// How execution units are created.
    #[must_use]
    pub fn model(&self) -> ExecutionModel {
        self.model
    }

    /// Checks that the configuration describes a run that can be attempted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if explicit cores were given but not exactly one
    /// per execution unit.
    pub fn validate(&self) -> Result<()> {
        if let Some(cores) = self
            .cores
            .as_ref()
            .filter(|cores| cores.len() != UNIT_COUNT.get())
        {
            return Err(Error::InvalidConfiguration {
                problem: format!(
                    "{} cores given but a run has {UNIT_COUNT} execution units",
                    cores.len()
                ),
            });
        }

        Ok(())
    }

    /// The core assignment for the units of a run.
    #[must_use]
    pub fn affinity_plan(&self) -> AffinityPlan {
        match &self.cores {
            Some(cores) => AffinityPlan::explicit(cores.clone()),
            None => AffinityPlan::from_placement(self.placement, UNIT_COUNT),
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders the suggestion for measuring cache behavior of a run with `perf`.
///
/// `program` and `args` are the command line the benchmark was started with.
#[must_use]
pub fn perf_hint<I, S>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hint = format!(
        "To measure additional metrics with perf, run the binary using:\n   perf stat -e cycles,cache-references,cache-misses {program}"
    );

    for arg in args {
        write!(hint, " {}", arg.as_ref()).expect("writing to a String cannot fail");
    }

    hint.push('\n');
    hint
}
