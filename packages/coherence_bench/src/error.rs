use std::io;

use thiserror::Error;

use crate::{CoreId, UnitId};

/// Errors that can occur when preparing or executing a benchmark run.
///
/// Only some of these are fatal to a run. Affinity errors are returned by the affinity API for
/// callers that care, but the orchestrator logs them and continues with whatever placement the
/// scheduler chooses.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The shared memory region backing the buffer could not be mapped.
    #[error("shared buffer allocation failed: {source}")]
    Allocation {
        /// The error reported by the operating system.
        source: io::Error,
    },

    /// An execution unit could not be started.
    #[error("failed to create execution unit {unit}: {source}")]
    UnitCreation {
        /// The unit that could not be created.
        unit: UnitId,

        /// The error reported by the operating system.
        source: io::Error,
    },

    /// An execution unit was started but did not finish cleanly.
    #[error("execution unit {unit} did not finish cleanly: {detail}")]
    UnitFailed {
        /// The unit that failed.
        unit: UnitId,

        /// A human-readable description of how the unit ended.
        detail: String,
    },

    /// The scheduler rejected a request to restrict a unit to a set of cores.
    #[error("failed to restrict execution to cores {cores}: {source}")]
    Affinity {
        /// The requested core set, in cpulist format.
        cores: String,

        /// The error reported by the operating system.
        source: io::Error,
    },

    /// A core index cannot be expressed in a platform core set at all.
    #[error("core {core} is beyond the largest core index the platform can address")]
    CoreOutOfRange {
        /// The offending core index.
        core: CoreId,
    },

    /// The benchmark configuration is not valid.
    #[error("invalid configuration: {problem}")]
    InvalidConfiguration {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// The run report could not be written out.
    #[error("failed to write run report: {source}")]
    Output {
        /// The underlying I/O error.
        source: io::Error,
    },
}

/// A specialized `Result` type for benchmark operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn allocation_error_mentions_os_code() {
        let error = Error::Allocation {
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };

        let message = error.to_string();
        assert!(message.contains(&libc::ENOMEM.to_string()), "{message}");
    }

    #[test]
    fn unit_creation_error_names_unit() {
        let error = Error::UnitCreation {
            unit: 2,
            source: io::Error::from_raw_os_error(libc::EAGAIN),
        };

        assert!(error.to_string().contains("execution unit 2"));
    }
}
