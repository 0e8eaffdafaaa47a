#![cfg_attr(coverage_nightly, coverage(off))]

use std::ffi::c_void;
use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;
#[cfg(test)]
use std::sync::Arc;

use libc::{c_int, cpu_set_t, pid_t};

#[cfg(test)]
use crate::pal::MockBindings;
use crate::pal::{Bindings, BuildTargetBindings};

/// Enum to hide the real/mock choice behind a single wrapper type.
#[derive(Clone)]
pub(crate) enum BindingsFacade {
    Target(&'static BuildTargetBindings),

    #[cfg(test)]
    Mock(Arc<MockBindings>),
}

impl BindingsFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BuildTargetBindings)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockBindings) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

impl Bindings for BindingsFacade {
    fn sched_setaffinity_current(&self, cpuset: &cpu_set_t) -> Result<(), io::Error> {
        match self {
            Self::Target(bindings) => bindings.sched_setaffinity_current(cpuset),
            #[cfg(test)]
            Self::Mock(mock) => mock.sched_setaffinity_current(cpuset),
        }
    }

    fn sched_getcpu(&self) -> i32 {
        match self {
            Self::Target(bindings) => bindings.sched_getcpu(),
            #[cfg(test)]
            Self::Mock(mock) => mock.sched_getcpu(),
        }
    }

    fn mmap_shared_anonymous(&self, len: usize) -> Result<NonNull<c_void>, io::Error> {
        match self {
            Self::Target(bindings) => bindings.mmap_shared_anonymous(len),
            #[cfg(test)]
            Self::Mock(mock) => mock.mmap_shared_anonymous(len),
        }
    }

    unsafe fn munmap(&self, addr: NonNull<c_void>, len: usize) -> Result<(), io::Error> {
        match self {
            // SAFETY: Forwarding safety requirements to the caller.
            Self::Target(bindings) => unsafe { bindings.munmap(addr, len) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to the caller.
            Self::Mock(mock) => unsafe { mock.munmap(addr, len) },
        }
    }

    unsafe fn fork(&self) -> Result<pid_t, io::Error> {
        match self {
            // SAFETY: Forwarding safety requirements to the caller.
            Self::Target(bindings) => unsafe { bindings.fork() },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to the caller.
            Self::Mock(mock) => unsafe { mock.fork() },
        }
    }

    fn waitpid(&self, pid: pid_t) -> Result<c_int, io::Error> {
        match self {
            Self::Target(bindings) => bindings.waitpid(pid),
            #[cfg(test)]
            Self::Mock(mock) => mock.waitpid(pid),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
impl Debug for BindingsFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
