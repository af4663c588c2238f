//! Cgroup teardown
//!
//! Killing everything inside a cgroup is racy if done naively: plain SIGKILL
//! races `fork`, so a task can duplicate itself between the moment its PID is
//! read from `tasks` and the moment the signal lands. The canonical Linux
//! idiom is:
//!
//! ```text
//! freeze -> SIGKILL every task -> thaw -> wait until empty
//! ```
//!
//! Freezing stops the world (no forks, no signal handling); SIGKILL is
//! queued by the kernel and delivered on thaw, when it is uncatchable. If
//! the cgroup still is not empty after the drain retries, the whole chain
//! restarts.
//!
//! [`destroy`] applies the chain to a whole subtree: every nested cgroup is
//! killed in parallel, then the directories are removed leaves-first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{CgroupError, Result};

use super::{freeze, get, kill, remove_dir, tasks, thaw, verify, FREEZE_RETRIES};

/// Default number of empty-watch retries before reporting non-empty.
pub const EMPTY_WATCHER_RETRIES: u32 = 50;

/// Poll the cgroup's task list until it is empty.
///
/// Resolves `Ok(true)` when no tasks remain, `Ok(false)` when tasks are
/// still present after `retries` polls (a timeout, not an error).
pub async fn empty_watch(
    hierarchy: &Path,
    cgroup: &str,
    interval: Duration,
    retries: u32,
) -> Result<bool> {
    let mut attempt: u32 = 0;
    loop {
        if tasks(hierarchy, cgroup)?.is_empty() {
            return Ok(true);
        }

        if attempt > retries {
            return Ok(false);
        }

        tokio::time::sleep(interval).await;
        attempt += 1;
    }
}

/// Atomically kill every task in a single cgroup and wait for it to drain.
///
/// The boolean results of the freeze and thaw steps are deliberately
/// ignored: provided no step errored, the chain simply runs again as long as
/// tasks still exist. Any error fails the killer; dropping the future
/// abandons whichever step was in flight.
pub async fn kill_tasks(hierarchy: &Path, cgroup: &str, interval: Duration) -> Result<()> {
    loop {
        let _ = freeze(hierarchy, cgroup, interval, FREEZE_RETRIES).await?;
        kill(hierarchy, cgroup, Signal::SIGKILL)?;
        let _ = thaw(hierarchy, cgroup, interval).await?;

        if empty_watch(hierarchy, cgroup, interval, EMPTY_WATCHER_RETRIES).await? {
            return Ok(());
        }

        debug!(cgroup, "cgroup still has tasks, restarting the kill chain");
    }
}

/// Destroy a cgroup and all of its descendants.
///
/// The subtree is enumerated leaves-first; one kill chain per cgroup runs in
/// parallel and the directories are removed in the enumerated order once
/// every chain has finished. The first failed rmdir fails the destroy and
/// stops the sweep. Dropping the future aborts all outstanding kill chains.
///
/// Destroying `/` (or the empty cgroup) tears down every cgroup in the
/// hierarchy but leaves the root directory itself in place.
pub async fn destroy(hierarchy: &Path, cgroup: &str, interval: Duration) -> Result<()> {
    verify(hierarchy, Some(cgroup), Some("freezer.state"))?;

    let mut cgroups = get(hierarchy, cgroup)?;
    if cgroup != "/" && !cgroup.is_empty() {
        cgroups.push(cgroup.to_string());
    }

    let mut killers: JoinSet<Result<()>> = JoinSet::new();
    for nested in &cgroups {
        let hierarchy: PathBuf = hierarchy.to_path_buf();
        let nested = nested.clone();
        killers.spawn(async move { kill_tasks(&hierarchy, &nested, interval).await });
    }

    while let Some(joined) = killers.join_next().await {
        joined.map_err(|e| CgroupError::Internal(format!("tasks killer failed to join: {e}")))??;
    }

    for nested in &cgroups {
        remove_dir(hierarchy, nested)?;
    }

    Ok(())
}
