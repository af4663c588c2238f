//! Freezer driver
//!
//! The `freezer` subsystem exposes a per-cgroup tri-state through
//! `freezer.state`: `THAWED`, `FREEZING` (in progress) and `FROZEN`. Writing
//! `FROZEN` asks the kernel to suspend every task in the cgroup; writing
//! `THAWED` resumes them.
//!
//! Freezing can wedge: a task in stopped/traced state (`T` in
//! `/proc/<pid>/stat`) keeps the cgroup in `FREEZING` forever. The driver
//! nudges such tasks with SIGCONT and re-writes `FROZEN` until the kernel
//! converges or retries run out.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use crate::error::{CgroupError, Result};
use crate::proc;

use super::{read_control, tasks, verify, write_control};

/// Default number of freeze retries before giving up.
pub const FREEZE_RETRIES: u32 = 50;

fn freezer_state(hierarchy: &Path, cgroup: &str) -> Result<String> {
    Ok(read_control(hierarchy, cgroup, "freezer.state")?
        .trim()
        .to_string())
}

fn write_freezer_state(hierarchy: &Path, cgroup: &str, state: &str) -> Result<()> {
    write_control(hierarchy, cgroup, "freezer.state", state)
}

// A state other than the three documented values means the kernel broke its
// own contract; there is no sane way to continue driving the freezer.
fn unexpected_state(hierarchy: &Path, cgroup: &str, state: &str) -> ! {
    error!(
        cgroup = %hierarchy.join(cgroup.trim_start_matches('/')).display(),
        state,
        "unexpected freezer state"
    );
    panic!("unexpected freezer state '{state}'");
}

/// Send SIGCONT to every stopped/traced task in the cgroup.
///
/// Stopped tasks cannot be frozen and keep `freezer.state` in `FREEZING`
/// indefinitely; resuming them lets the freezer finish. New tasks cannot
/// enter or leave the cgroup while it is `FREEZING`, so the task list is
/// stable here.
fn resume_stopped_tasks(hierarchy: &Path, cgroup: &str) -> Result<()> {
    for pid in tasks(hierarchy, cgroup)? {
        let stat = proc::stat(pid)?;
        if stat.state == 'T' {
            signal::kill(Pid::from_raw(pid), Signal::SIGCONT).map_err(|errno| {
                CgroupError::io(format!("send SIGCONT to process {pid}"), errno.into())
            })?;
        }
    }
    Ok(())
}

/// Drive `freezer.state` to `FROZEN`.
///
/// Polls every `interval` (an interval of zero tight-loops; callers choosing
/// it accept the CPU cost). Resolves `Ok(true)` once the cgroup is frozen
/// and `Ok(false)` when it is still `FREEZING` after `retries` attempts - a
/// timeout, not an error. Dropping the future abandons the attempt.
pub async fn freeze(
    hierarchy: &Path,
    cgroup: &str,
    interval: Duration,
    retries: u32,
) -> Result<bool> {
    verify(hierarchy, Some(cgroup), Some("freezer.state"))?;

    if freezer_state(hierarchy, cgroup)? == "FROZEN" {
        return Ok(true);
    }

    info!(cgroup, "trying to freeze cgroup");
    write_freezer_state(hierarchy, cgroup, "FROZEN")?;

    let mut attempt: u32 = 0;
    loop {
        let state = freezer_state(hierarchy, cgroup)?;
        match state.as_str() {
            "FROZEN" => {
                info!(cgroup, attempts = attempt + 1, "successfully froze cgroup");
                return Ok(true);
            }
            "FREEZING" => {
                resume_stopped_tasks(hierarchy, cgroup)?;

                if attempt > retries {
                    warn!(
                        cgroup,
                        attempts = retries + 1,
                        "unable to freeze cgroup within the retry limit"
                    );
                    return Ok(false);
                }

                write_freezer_state(hierarchy, cgroup, "FROZEN")?;
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
            other => unexpected_state(hierarchy, cgroup, other),
        }
    }
}

/// Drive `freezer.state` to `THAWED`.
///
/// Symmetric to [`freeze`], but unbounded: a thaw cannot wedge on stopped
/// tasks, so the driver polls until the kernel reports `THAWED`.
pub async fn thaw(hierarchy: &Path, cgroup: &str, interval: Duration) -> Result<bool> {
    verify(hierarchy, Some(cgroup), Some("freezer.state"))?;

    if freezer_state(hierarchy, cgroup)? == "THAWED" {
        return Ok(true);
    }

    info!(cgroup, "trying to thaw cgroup");
    write_freezer_state(hierarchy, cgroup, "THAWED")?;

    loop {
        let state = freezer_state(hierarchy, cgroup)?;
        match state.as_str() {
            "THAWED" => {
                info!(cgroup, "successfully thawed cgroup");
                return Ok(true);
            }
            // Not done yet; keep watching.
            "FROZEN" => tokio::time::sleep(interval).await,
            other => unexpected_state(hierarchy, cgroup, other),
        }
    }
}
