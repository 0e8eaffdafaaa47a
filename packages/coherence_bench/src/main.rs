#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

//! Command line entry point for the coherence benchmark.
//!
//! Excluded from mutation testing. The interesting logic lives in the library, and checking
//! exit codes here would require spawning subprocesses.

use std::io::{self, Write};
use std::num::NonZero;
use std::process::ExitCode;

use argh::FromArgs;
use coherence_bench::{
    BenchConfig, CoreId, Error, ExecutionModel, Orchestrator, Placement, RunReport, perf_hint,
};
use new_zealand::nz;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Measures how core placement and synchronization affect two execution units that keep
/// rewriting the same shared buffer.
#[derive(FromArgs)]
struct Args {
    /// place both units on the same core or on different cores (same, diff)
    #[argh(option, short = 'a', default = "Placement::Diff")]
    affinity: Placement,

    /// number of kernel invocations per unit
    #[argh(option, short = 'i', default = "nz!(1000)")]
    iterations: NonZero<u32>,

    /// print a perf command for measuring cache behavior before running
    #[argh(switch, short = 'p')]
    perf: bool,

    /// how units are created (threads, processes)
    #[argh(option, short = 'm', default = "ExecutionModel::Threads")]
    model: ExecutionModel,

    /// explicit core for each unit, in unit order; overrides --affinity
    #[argh(option)]
    core: Vec<CoreId>,
}

impl Args {
    fn into_config(self) -> BenchConfig {
        let config = BenchConfig::new()
            .with_placement(self.affinity)
            .with_iterations(self.iterations)
            .with_perf_hint(self.perf)
            .with_model(self.model);

        if self.core.is_empty() {
            config
        } else {
            config.with_cores(self.core)
        }
    }
}

#[cfg_attr(test, mutants::skip)]
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let env_args: Vec<String> = std::env::args().collect();
    let str_args: Vec<&str> = env_args.iter().map(String::as_str).collect();

    let program_name = str_args
        .first()
        .copied()
        .unwrap_or(env!("CARGO_PKG_NAME"));
    let forwarded_args = str_args.get(1..).unwrap_or(&[]);

    let args = match Args::from_args(&[program_name], forwarded_args) {
        Ok(args) => args,
        Err(early_exit) => {
            println!("{}", early_exit.output);
            return if early_exit.status.is_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };

    let config = args.into_config();

    match run(config, program_name, forwarded_args, &mut io::stdout().lock()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Validates the configuration, prints the perf hint if requested and executes the run.
fn run(
    config: BenchConfig,
    program_name: &str,
    args: &[&str],
    out: &mut impl Write,
) -> Result<RunReport, Error> {
    let mut orchestrator = Orchestrator::new(config)?;

    if orchestrator.config().show_perf_hint() {
        if let Err(error) = write!(out, "{}", perf_hint(program_name, args)) {
            warn!(%error, "failed to print perf hint");
        }
    }

    orchestrator.execute(out)
}
