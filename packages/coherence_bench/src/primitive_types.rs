/// Identifies a specific processor core.
///
/// This will match the numeric identifier used by standard tooling of the operating system
/// (e.g. the `cpu` column of `ps -o psr` or the indexes in `/sys/devices/system/cpu`).
///
/// Nothing guarantees that a given identifier refers to a processor that exists or that the
/// current process is allowed to use. Placement requests for such cores are rejected by the
/// operating system, which the harness reports and then ignores.
pub type CoreId = u32;

/// Identifies an execution unit (a thread or a process) within one benchmark run.
///
/// Units are numbered from 1 in the order they are created.
pub type UnitId = u32;
