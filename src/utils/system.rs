// src/utils/system.rs: scheduler and host introspection, read once at startup

use std::env;
use std::path::PathBuf;

use sysinfo::System;

use crate::config::defs::{
    PipelineError, ARRAY_TASK_ID_VAR, CPUS_PER_TASK_VAR, JOB_ID_VAR, SCRATCH_DIR_VAR,
    TASK_ID_OVERRIDE_VAR,
};

/// Determines the 1-based manifest row this job instance must process.
///
/// Priority: explicit CLI flag, then the override variable, then the
/// scheduler's array-task identifier.
pub fn detect_task_index(flag_override: Option<usize>) -> Result<usize, PipelineError> {
    if let Some(index) = flag_override {
        return Ok(index);
    }
    for var in [TASK_ID_OVERRIDE_VAR, ARRAY_TASK_ID_VAR] {
        if let Ok(raw) = env::var(var) {
            return raw.trim().parse().map_err(|_| {
                PipelineError::InvalidConfig(format!("{var}={raw} is not a task index"))
            });
        }
    }
    Err(PipelineError::InvalidConfig(format!(
        "no task index: set --task-index, {TASK_ID_OVERRIDE_VAR}, or run under an array job ({ARRAY_TASK_ID_VAR})"
    )))
}

/// Threads handed to each stage tool: the scheduler core allocation
/// (default 1), capped by physical cores and any explicit --threads cap.
pub fn detect_threads(flag_cap: Option<usize>) -> usize {
    let allocated = env::var(CPUS_PER_TASK_VAR)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(1usize);
    let physical = System::physical_core_count().unwrap_or(1).max(1);
    let mut threads = allocated.min(physical).max(1);
    if let Some(cap) = flag_cap {
        threads = threads.min(cap.max(1));
    }
    threads
}

pub fn detect_job_id() -> Option<String> {
    env::var(JOB_ID_VAR).ok().filter(|v| !v.trim().is_empty())
}

/// Node-local ephemeral storage root. Prefers the scheduler-provided
/// per-job scratch directory, falling back to the system temp dir.
pub fn get_scratch_root() -> PathBuf {
    if let Ok(dir) = env::var(SCRATCH_DIR_VAR) {
        let path = PathBuf::from(dir);
        if path.is_dir() {
            return path;
        }
    }
    env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_override_beats_environment() {
        assert_eq!(detect_task_index(Some(7)).unwrap(), 7);
    }

    #[test]
    fn thread_count_is_at_least_one() {
        assert!(detect_threads(None) >= 1);
        assert_eq!(detect_threads(Some(1)), 1);
    }
}
