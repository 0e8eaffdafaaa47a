#![cfg_attr(
    test,
    expect(
        clippy::struct_field_names,
        reason = "false positive from automock generated code"
    )
)]

use std::ffi::c_void;
use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;

use libc::{c_int, cpu_set_t, pid_t};

/// Bindings for FFI calls into the operating system.
///
/// All PAL FFI calls must go through this trait, enabling them to be mocked.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Bindings: Debug + Send + Sync + 'static {
    // sched_setaffinity() for the current thread
    fn sched_setaffinity_current(&self, cpuset: &cpu_set_t) -> Result<(), io::Error>;

    fn sched_getcpu(&self) -> i32;

    /// Maps `len` bytes of zero-initialized anonymous memory that stays shared with any child
    /// process created by `fork()` after the mapping is made.
    fn mmap_shared_anonymous(&self, len: usize) -> Result<NonNull<c_void>, io::Error>;

    /// # Safety
    ///
    /// `addr` and `len` must describe a mapping previously returned by
    /// `mmap_shared_anonymous()` and nothing may reference that memory afterwards.
    unsafe fn munmap(&self, addr: NonNull<c_void>, len: usize) -> Result<(), io::Error>;

    /// Returns 0 in the child and the child's process ID in the parent.
    ///
    /// # Safety
    ///
    /// The child starts with only the calling thread. Any lock held by another thread at the
    /// time of the call stays locked forever in the child, so the caller must ensure the child
    /// does not depend on such locks before it exits.
    unsafe fn fork(&self) -> Result<pid_t, io::Error>;

    /// Waits for the specified child process to terminate and returns its raw wait status.
    fn waitpid(&self, pid: pid_t) -> Result<c_int, io::Error>;
}
