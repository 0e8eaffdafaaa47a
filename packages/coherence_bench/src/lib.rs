#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Microbenchmark harness that shows how processor placement and synchronization discipline
//! affect execution units that repeatedly mutate a shared buffer.
//!
//! Two execution units each apply a [workload kernel][transform] to the same 32-element integer
//! buffer, over and over, as fast as they can. Depending on the configuration:
//!
//! * the units are pinned to the same processor core or to different cores ([`Placement`]);
//! * the units are threads that take turns through a [`CriticalSection`], or a parent process and
//!   its forked child that race each other with no coordination at all ([`ExecutionModel`]).
//!
//! Units on different cores keep stealing the buffer's cache lines from each other, which shows
//! up as a higher time per iteration. Units without coordination lose updates to each other,
//! which shows up as final buffer contents that differ from run to run.
//!
//! # Example
//!
//! ```
//! use std::io;
//!
//! use coherence_bench::{BenchConfig, Orchestrator, Placement};
//! use new_zealand::nz;
//!
//! let config = BenchConfig::new()
//!     .with_placement(Placement::Same)
//!     .with_iterations(nz!(1000));
//!
//! let report = Orchestrator::new(config)?.execute(&mut io::stdout())?;
//!
//! for timing in report.timings() {
//!     println!("unit {} took {:?}", timing.unit(), timing.elapsed());
//! }
//! # Ok::<(), coherence_bench::Error>(())
//! ```
//!
//! # Platform support
//!
//! Linux only, as processor placement uses `sched_setaffinity()` and the process model uses
//! `fork()`.

mod affinity;
mod arena;
mod config;
mod critical_section;
mod error;
mod orchestrator;
mod pal;
mod primitive_types;
pub mod timing;
mod workload;

pub use affinity::*;
pub use arena::*;
pub use config::*;
pub use critical_section::*;
pub use error::*;
pub use orchestrator::*;
pub use primitive_types::*;
pub use timing::{SyncDiscipline, TimingRecord};
pub use workload::*;
