//! Platform Abstraction Layer (PAL). Every call into the operating system made by the harness
//! goes through here, so unit tests can substitute mock bindings to exercise failure paths that
//! are impractical to trigger on a real system.
//!
//! Only Linux is supported, as the harness depends on `sched_setaffinity()` and `fork()`.

mod bindings;
pub(crate) use bindings::*;
