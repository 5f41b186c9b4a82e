//! Process-count containment.
//!
//! Each resource class caps how many processes the job owner may run, so a
//! fork bomb in job code cannot take the host down.

use nix::sys::resource::{setrlimit, Resource};

/// Per-core process ceiling of a resource class.
pub fn per_core_ceiling(core_type: &str) -> u64 {
    match core_type {
        "c1" => 60,
        "c2" => 200,
        "f2" => 300,
        "m1" => 300,
        "s1" => 50,
        _ => 100,
    }
}

/// Process ceiling for a job of `cores` cores in class `core_type`.
pub fn process_ceiling(core_type: &str, cores: u32) -> u64 {
    per_core_ceiling(core_type).saturating_mul(u64::from(cores))
}

/// Apply the ceiling as both soft and hard `RLIMIT_NPROC`.
pub fn restrict(core_type: &str, cores: u32) -> nix::Result<u64> {
    let ceiling = process_ceiling(core_type, cores);
    tracing::info!(core_type, cores, ceiling, "restricting process count");
    setrlimit(Resource::RLIMIT_NPROC, ceiling as libc::rlim_t, ceiling as libc::rlim_t)?;
    Ok(ceiling)
}
