use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::num::NonZero;
use std::sync::mpsc;
use std::thread;

use derive_more::Display;
use libc::{c_int, pid_t};
use tracing::debug;

use crate::pal::{Bindings, BindingsFacade};
use crate::timing::{self, SyncDiscipline, TimingRecord};
use crate::{
    AffinityPlan, BUFFER_LEN, BenchConfig, CriticalSection, Error, ExecutionModel, Result,
    SENTINEL_FILL, SharedArena, SharedBuffer, UnitId, transform,
};

/// Unit that runs in the original process of the process model.
const PARENT_UNIT: UnitId = 1;

/// Unit that runs in the forked child of the process model.
const CHILD_UNIT: UnitId = 2;

/// Lifecycle of a benchmark run.
///
/// A run only moves forward. A fatal error leaves the orchestrator in the state it had reached.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "the lifecycle of a run is fixed"
)]
pub enum RunState {
    /// Nothing has happened yet.
    Init,

    /// The shared buffer exists.
    Allocated,

    /// Every execution unit has been created.
    SpawnedUnits,

    /// Every execution unit has been placed and is executing its run loop.
    Running,

    /// Every execution unit has finished its run loop.
    Joined,

    /// The final buffer contents and timings have been written out.
    Reported,

    /// The run is over and the shared buffer is gone.
    Done,
}

/// The outcome of a benchmark run.
#[derive(Clone, Debug)]
pub struct RunReport {
    timings: Vec<TimingRecord>,
    final_buffer: [i32; BUFFER_LEN],
}

impl RunReport {
    /// Timing of every execution unit that ran in this process, in unit order.
    ///
    /// In the process model the forked child reports its own timing directly to stdout, so only
    /// the parent's timing is included here.
    #[must_use]
    pub fn timings(&self) -> &[TimingRecord] {
        &self.timings
    }

    /// Contents of the shared buffer after every unit finished.
    #[must_use]
    pub fn final_buffer(&self) -> &[i32; BUFFER_LEN] {
        &self.final_buffer
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.timings {
            writeln!(f, "{record}")?;
        }

        let mut values = self.final_buffer.iter();

        if let Some(first) = values.next() {
            write!(f, "{first}")?;
        }

        for value in values {
            write!(f, " {value}")?;
        }

        Ok(())
    }
}

/// Drives one benchmark run: allocates the shared buffer, creates and places the execution
/// units, waits for them to finish and writes out the results.
///
/// # Example
///
/// ```
/// use std::io;
///
/// use coherence_bench::{BenchConfig, Orchestrator, RunState};
/// use new_zealand::nz;
///
/// let config = BenchConfig::new().with_iterations(nz!(100));
///
/// let mut orchestrator = Orchestrator::new(config)?;
/// let report = orchestrator.execute(&mut io::sink())?;
///
/// assert_eq!(orchestrator.state(), RunState::Done);
/// assert_eq!(report.timings().len(), 2);
/// # Ok::<(), coherence_bench::Error>(())
/// ```
#[derive(Debug)]
pub struct Orchestrator {
    config: BenchConfig,
    plan: AffinityPlan,
    initial_fill: i32,
    state: RunState,
    bindings: BindingsFacade,
}

impl Orchestrator {
    /// Creates an orchestrator for a run with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the configuration fails validation.
    pub fn new(config: BenchConfig) -> Result<Self> {
        Self::with_bindings(config, BindingsFacade::target())
    }

    pub(crate) fn with_bindings(config: BenchConfig, bindings: BindingsFacade) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            plan: config.affinity_plan(),
            config,
            initial_fill: SENTINEL_FILL,
            state: RunState::Init,
            bindings,
        })
    }

    /// Overrides the value every buffer element starts with (default [`SENTINEL_FILL`]).
    #[must_use]
    pub fn with_initial_fill(mut self, fill: i32) -> Self {
        self.initial_fill = fill;
        self
    }

    /// The configuration of this run.
    #[must_use]
    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// How far the run has progressed.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Executes the run to completion and writes the report to `out`: one timing line per unit
    /// followed by one line with the final buffer contents.
    ///
    /// Affinity failures are logged and do not stop the run. Any other failure ends the run
    /// immediately; units that were already started still run their full iteration count because
    /// a run cannot be cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the shared buffer cannot be mapped,
    /// [`Error::UnitCreation`] if an execution unit cannot be started, [`Error::UnitFailed`] if
    /// a unit does not finish cleanly and [`Error::Output`] if the report cannot be written.
    ///
    /// # Panics
    ///
    /// Panics if the orchestrator has already executed a run.
    pub fn execute(&mut self, out: &mut impl Write) -> Result<RunReport> {
        assert_eq!(
            self.state,
            RunState::Init,
            "an orchestrator executes exactly one run"
        );

        let arena = SharedArena::allocate_core(self.initial_fill, self.bindings.clone())?;
        self.transition(RunState::Allocated);

        let buffer = arena.buffer();

        let timings = match self.config.model() {
            ExecutionModel::Threads => self.run_threads(buffer)?,
            ExecutionModel::Processes => self.run_processes(buffer, out)?,
        };

        let report = RunReport {
            timings,
            final_buffer: buffer.snapshot(),
        };

        writeln!(out, "{report}")
            .and_then(|()| out.flush())
            .map_err(|source| Error::Output { source })?;
        self.transition(RunState::Reported);

        drop(arena);
        self.transition(RunState::Done);

        Ok(report)
    }

    fn run_threads(&mut self, buffer: SharedBuffer<'_>) -> Result<Vec<TimingRecord>> {
        let critical_section = CriticalSection::new();
        let plan = self.plan.clone();
        let bindings = self.bindings.clone();
        let iterations = self.config.iterations();

        let (ready_tx, ready_rx) = mpsc::channel::<UnitId>();

        thread::scope(|s| -> Result<Vec<TimingRecord>> {
            let mut handles = Vec::with_capacity(plan.unit_count());

            for unit in unit_ids(&plan) {
                let ready_tx = ready_tx.clone();
                let plan = &plan;
                let bindings = &bindings;
                let critical_section = &critical_section;

                let handle = thread::Builder::new()
                    .name(format!("coherence-unit-{unit}"))
                    .spawn_scoped(s, move || {
                        plan.apply_or_warn_core(unit, bindings);

                        if ready_tx.send(unit).is_err() {
                            debug!(unit, "nobody is waiting for the ready signal anymore");
                        }

                        timing::run(
                            unit,
                            buffer,
                            iterations,
                            transform,
                            SyncDiscipline::Exclusive(critical_section),
                        )
                    })
                    .map_err(|source| Error::UnitCreation { unit, source })?;

                handles.push((unit, handle));
            }

            drop(ready_tx);
            self.transition(RunState::SpawnedUnits);

            // Every unit places itself before reporting in. A unit that dies first just means
            // the channel closes early; its join result tells the rest of the story.
            for _ in 0..handles.len() {
                if ready_rx.recv().is_err() {
                    break;
                }
            }

            self.transition(RunState::Running);

            // Join everything before looking at results, so no panicked thread is left unjoined.
            let results = handles
                .into_iter()
                .map(|(unit, handle)| (unit, handle.join()))
                .collect::<Vec<_>>();

            let timings = results
                .into_iter()
                .map(|(unit, result)| {
                    result.map_err(|payload| Error::UnitFailed {
                        unit,
                        detail: panic_message(payload.as_ref()),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            self.transition(RunState::Joined);

            Ok(timings)
        })
    }

    fn run_processes(
        &mut self,
        buffer: SharedBuffer<'_>,
        out: &mut impl Write,
    ) -> Result<Vec<TimingRecord>> {
        let iterations = self.config.iterations();

        // Anything still buffered would otherwise be written twice, once by each process.
        out.flush()
            .and_then(|()| io::stdout().flush())
            .map_err(|source| Error::Output { source })?;

        // SAFETY: The child only touches the shared mapping, its own stack, stdout and the
        // tracing dispatcher before it leaves via _exit().
        let child = unsafe { self.bindings.fork() }.map_err(|source| Error::UnitCreation {
            unit: CHILD_UNIT,
            source,
        })?;

        if child == 0 {
            child_main(&self.plan, &self.bindings, buffer, iterations);
        }

        debug!(pid = child, unit = CHILD_UNIT, "child process created");
        self.transition(RunState::SpawnedUnits);

        self.plan.apply_or_warn_core(PARENT_UNIT, &self.bindings);
        self.transition(RunState::Running);

        let record = timing::run(
            PARENT_UNIT,
            buffer,
            iterations,
            transform,
            SyncDiscipline::Unsynchronized,
        );

        self.wait_for_child(child)?;
        self.transition(RunState::Joined);

        Ok(vec![record])
    }

    fn wait_for_child(&self, child: pid_t) -> Result<()> {
        let status = self
            .bindings
            .waitpid(child)
            .map_err(|source| Error::UnitFailed {
                unit: CHILD_UNIT,
                detail: format!("could not wait for process {child}: {source}"),
            })?;

        if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
            debug!(pid = child, unit = CHILD_UNIT, "child process finished");
            return Ok(());
        }

        Err(Error::UnitFailed {
            unit: CHILD_UNIT,
            detail: describe_wait_status(status),
        })
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "run state transition");
        self.state = next;
    }
}

/// Body of the forked child process. Never returns.
#[cfg_attr(test, mutants::skip)] // Runs in a separate process, out of reach of the test harness.
fn child_main(
    plan: &AffinityPlan,
    bindings: &BindingsFacade,
    buffer: SharedBuffer<'_>,
    iterations: NonZero<u32>,
) -> ! {
    plan.apply_or_warn_core(CHILD_UNIT, bindings);

    let record = timing::run(
        CHILD_UNIT,
        buffer,
        iterations,
        transform,
        SyncDiscipline::Unsynchronized,
    );

    let mut stdout = io::stdout().lock();

    let code = match writeln!(stdout, "{record}").and_then(|()| stdout.flush()) {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("unit {CHILD_UNIT} could not report its timing: {error}");
            1
        }
    };

    // SAFETY: No preconditions. Destructors and exit handlers are skipped on purpose, as all
    // process-level state (including the mapping) is owned by the parent.
    unsafe { libc::_exit(code) }
}

fn unit_ids(plan: &AffinityPlan) -> impl Iterator<Item = UnitId> {
    let count = UnitId::try_from(plan.unit_count()).expect("unit counts are nowhere near u32::MAX");

    1..=count
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

fn describe_wait_status(status: c_int) -> String {
    if libc::WIFEXITED(status) {
        format!("exited with status {}", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        format!("terminated by signal {}", libc::WTERMSIG(status))
    } else {
        format!("ended with wait status {status:#x}")
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ffi::c_void;
    use std::io;
    use std::ptr::NonNull;

    use mockall::predicate::eq;
    use new_zealand::nz;

    use super::*;
    use crate::pal::MockBindings;
    use crate::{Placement, trajectory};

    /// Hands out a leaked heap buffer in place of a real mapping.
    fn expect_fake_mapping(bindings: &mut MockBindings) {
        bindings.expect_mmap_shared_anonymous().returning(|_| {
            let cells: &'static mut [i32; BUFFER_LEN] = Box::leak(Box::new([0; BUFFER_LEN]));
            Ok(NonNull::from(cells).cast::<c_void>())
        });
        bindings.expect_munmap().returning(|_, _| Ok(()));
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call platform APIs")]
    fn thread_model_runs_to_done() {
        let config = BenchConfig::new()
            .with_placement(Placement::Same)
            .with_iterations(nz!(50));

        let mut orchestrator = Orchestrator::new(config).unwrap();
        assert_eq!(orchestrator.state(), RunState::Init);

        let mut out = Vec::<u8>::new();
        let report = orchestrator.execute(&mut out).unwrap();

        assert_eq!(orchestrator.state(), RunState::Done);
        assert_eq!(report.timings().len(), 2);
        assert_eq!(report.timings()[0].unit(), 1);
        assert_eq!(report.timings()[1].unit(), 2);

        let expected = trajectory(SENTINEL_FILL).nth(99).unwrap();
        assert_eq!(report.final_buffer(), &[expected; BUFFER_LEN]);

        let output = String::from_utf8(out).unwrap();
        let lines = output.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Unit 1: Total time for 50 iterations"));
        assert!(lines[1].starts_with("Unit 2: Total time for 50 iterations"));
        assert_eq!(lines[2].split(' ').count(), BUFFER_LEN);
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call platform APIs")]
    #[should_panic]
    fn second_execution_panics() {
        let config = BenchConfig::new().with_iterations(nz!(1));
        let mut orchestrator = Orchestrator::new(config).unwrap();

        orchestrator.execute(&mut io::sink()).unwrap();
        drop(orchestrator.execute(&mut io::sink()));
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        let config = BenchConfig::new().with_cores(vec![0, 1, 2, 3]);

        assert!(matches!(
            Orchestrator::new(config),
            Err(Error::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn allocation_failure_is_fatal() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_mmap_shared_anonymous()
            .returning(|_| Err(io::Error::from_raw_os_error(libc::ENOMEM)));

        let mut orchestrator =
            Orchestrator::with_bindings(BenchConfig::new(), BindingsFacade::from_mock(bindings))
                .unwrap();

        let mut out = Vec::<u8>::new();
        let result = orchestrator.execute(&mut out);

        assert!(matches!(result, Err(Error::Allocation { .. })));
        assert_eq!(orchestrator.state(), RunState::Init);
        assert!(out.is_empty());
    }

    #[test]
    fn fork_failure_is_fatal() {
        let mut bindings = MockBindings::new();
        expect_fake_mapping(&mut bindings);
        bindings
            .expect_fork()
            .times(1)
            .returning(|| Err(io::Error::from_raw_os_error(libc::EAGAIN)));

        let config = BenchConfig::new().with_model(ExecutionModel::Processes);
        let mut orchestrator =
            Orchestrator::with_bindings(config, BindingsFacade::from_mock(bindings)).unwrap();

        let result = orchestrator.execute(&mut io::sink());

        assert!(matches!(
            result,
            Err(Error::UnitCreation {
                unit: CHILD_UNIT,
                ..
            })
        ));
        assert_eq!(orchestrator.state(), RunState::Allocated);
    }

    #[test]
    fn failed_child_is_fatal() {
        const FAKE_CHILD: pid_t = 4242;

        let mut bindings = MockBindings::new();
        expect_fake_mapping(&mut bindings);
        bindings.expect_fork().times(1).returning(|| Ok(FAKE_CHILD));
        bindings
            .expect_sched_setaffinity_current()
            .returning(|_| Ok(()));
        bindings.expect_sched_getcpu().return_const(0);
        bindings
            .expect_waitpid()
            .with(eq(FAKE_CHILD))
            .times(1)
            // Wait status encoding of "exited with status 3".
            .returning(|_| Ok(3 << 8));

        let config = BenchConfig::new()
            .with_model(ExecutionModel::Processes)
            .with_iterations(nz!(10));
        let mut orchestrator =
            Orchestrator::with_bindings(config, BindingsFacade::from_mock(bindings)).unwrap();

        let result = orchestrator.execute(&mut io::sink());

        match result {
            Err(Error::UnitFailed { unit, detail }) => {
                assert_eq!(unit, CHILD_UNIT);
                assert_eq!(detail, "exited with status 3");
            }
            other => panic!("expected unit failure, got {other:?}"),
        }
        assert_eq!(orchestrator.state(), RunState::Running);
    }

    #[test]
    fn thread_model_survives_rejected_affinity() {
        let mut bindings = MockBindings::new();
        expect_fake_mapping(&mut bindings);
        bindings
            .expect_sched_setaffinity_current()
            .times(2)
            .returning(|_| Err(io::Error::from_raw_os_error(libc::EINVAL)));

        let mut orchestrator = Orchestrator::with_bindings(
            BenchConfig::new().with_iterations(nz!(3)),
            BindingsFacade::from_mock(bindings),
        )
        .unwrap()
        .with_initial_fill(1);

        let report = orchestrator.execute(&mut io::sink()).unwrap();

        assert_eq!(orchestrator.state(), RunState::Done);
        assert_eq!(report.final_buffer(), &[2; BUFFER_LEN]);
    }

    #[test]
    fn report_display_layout() {
        let report = RunReport {
            timings: Vec::new(),
            final_buffer: [7; BUFFER_LEN],
        };

        let text = report.to_string();

        assert_eq!(text.split(' ').count(), BUFFER_LEN);
        assert!(text.split(' ').all(|value| value == "7"));
        assert!(!text.ends_with('\n'));
    }

    #[test]
    fn wait_status_descriptions() {
        assert_eq!(describe_wait_status(0), "exited with status 0");
        assert_eq!(describe_wait_status(libc::SIGKILL), "terminated by signal 9");
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(&"boom"), "panicked: boom");
        assert_eq!(panic_message(&"boom".to_string()), "panicked: boom");
        assert_eq!(panic_message(&42_u8), "panicked");
    }
}
