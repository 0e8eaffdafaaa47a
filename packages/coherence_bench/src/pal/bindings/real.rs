use std::ffi::c_void;
use std::io;
use std::ptr::{self, NonNull};

use libc::{c_int, cpu_set_t, pid_t};

use crate::pal::Bindings;

/// FFI bindings that target the real operating system that the build is targeting.
///
/// You would only use different bindings in unit tests that need to use mock bindings.
/// Even then, whenever possible, unit tests should use real bindings for maximum realism.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetBindings;

// Error paths require OS-level failures that are impractical to trigger in tests.
#[cfg_attr(coverage_nightly, coverage(off))]
impl Bindings for BuildTargetBindings {
    fn sched_setaffinity_current(&self, cpuset: &cpu_set_t) -> Result<(), io::Error> {
        // 0 means current thread.
        // SAFETY: No safety requirements beyond passing valid arguments.
        let result = unsafe { libc::sched_setaffinity(0, size_of::<cpu_set_t>(), cpuset) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn sched_getcpu(&self) -> i32 {
        // SAFETY: No safety requirements.
        unsafe { libc::sched_getcpu() }
    }

    fn mmap_shared_anonymous(&self, len: usize) -> Result<NonNull<c_void>, io::Error> {
        // SAFETY: We request a fresh mapping at an address of the kernel's choosing,
        // so no existing memory is affected.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(addr).ok_or_else(|| io::Error::other("mmap() returned a null pointer"))
    }

    unsafe fn munmap(&self, addr: NonNull<c_void>, len: usize) -> Result<(), io::Error> {
        // SAFETY: Forwarding safety requirements to the caller.
        let result = unsafe { libc::munmap(addr.as_ptr(), len) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    unsafe fn fork(&self) -> Result<pid_t, io::Error> {
        // SAFETY: Forwarding safety requirements to the caller.
        let pid = unsafe { libc::fork() };

        if pid == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(pid)
        }
    }

    fn waitpid(&self, pid: pid_t) -> Result<c_int, io::Error> {
        let mut status: c_int = 0;

        loop {
            // SAFETY: No safety requirements beyond passing valid arguments.
            let result = unsafe { libc::waitpid(pid, &raw mut status, 0) };

            if result != -1 {
                return Ok(status);
            }

            let error = io::Error::last_os_error();

            // A signal arriving while we wait is not a reason to give up on the child.
            if error.kind() != io::ErrorKind::Interrupted {
                return Err(error);
            }
        }
    }
}
