//! Per-executor isolation engine
//!
//! Sits on top of the cgroup primitives and binds launched executor
//! processes to cgroups: one cgroup per live executor, named
//! `<root>/framework_<F>_executor_<E>_tag_<T>` where the tag disambiguates
//! sequential launches of the same executor.
//!
//! The [`Isolator`](isolator::Isolator) is the single coordinator: it owns
//! the live-executor index and the machine-wide CPU allocation map, applies
//! resource changes to control files, listens for OOM events and tears
//! cgroups down when executors leave.
//!
//! Executor launch mechanics (forking, chrooting, redirecting output) belong
//! to the enclosing agent; the coordinator consumes them through the
//! [`ExecutorLauncher`] capability and reports lifecycle transitions as
//! [`IsolatorEvent`]s.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod cpuset;
pub mod isolator;

pub use cpuset::Cpuset;
pub use isolator::Isolator;

/// Identifier of a framework (the scheduler-side owner of executors).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameworkId(pub String);

impl fmt::Display for FrameworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FrameworkId {
    fn from(id: &str) -> Self {
        FrameworkId(id.to_string())
    }
}

/// Identifier of an executor within a framework.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorId(pub String);

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutorId {
    fn from(id: &str) -> Self {
        ExecutorId(id.to_string())
    }
}

/// The slice of framework metadata the isolator consumes.
#[derive(Debug, Clone, Default)]
pub struct FrameworkInfo {
    pub name: String,
    pub user: String,
}

/// The slice of executor metadata the isolator consumes.
#[derive(Debug, Clone)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    /// Command line the launcher will exec.
    pub command: String,
}

/// A named scalar resource allocation (`cpus` in fractional cores, `mem` in
/// megabytes, `net` reserved for the net_cls handler).
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub name: String,
    pub value: f64,
}

impl Resource {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Resource {
            name: name.into(),
            value,
        }
    }
}

/// A set of resource allocations, as delivered by the scheduler.
pub type Resources = Vec<Resource>;

/// Configuration of the isolation engine.
#[derive(Debug, Clone)]
pub struct IsolatorConfig {
    /// Path to the cgroup hierarchy root to mount or reuse.
    pub hierarchy: PathBuf,
    /// CSV of subsystems to attach; must include `freezer` plus whatever
    /// controllers the resource handlers drive.
    pub subsystems: String,
    /// Name of the umbrella cgroup all executor cgroups live under.
    pub root: String,
    /// Poll interval for the freezer and the empty-watcher.
    pub polling_interval: Duration,
}

impl Default for IsolatorConfig {
    fn default() -> Self {
        IsolatorConfig {
            hierarchy: PathBuf::from("/cgroup"),
            subsystems: "cpu,memory,freezer".to_string(),
            root: "mesos".to_string(),
            polling_interval: Duration::from_millis(100),
        }
    }
}

/// Capability for launching executor processes.
///
/// The isolator prepares the cgroup (directory plus resource limits) first,
/// then calls this, then moves the returned PID into the cgroup. Forking,
/// chrooting and I/O plumbing are entirely the implementor's business.
pub trait ExecutorLauncher: Send + 'static {
    fn launch(
        &self,
        framework_id: &FrameworkId,
        framework_info: &FrameworkInfo,
        executor_info: &ExecutorInfo,
        directory: &Path,
    ) -> io::Result<i32>;
}

/// Lifecycle notifications emitted by the isolator for the enclosing agent.
#[derive(Debug, Clone, PartialEq)]
pub enum IsolatorEvent {
    /// An executor has left the system and its cgroup has been removed.
    ExecutorTerminated {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        /// Exit status as reported by the reaper; `None` when the executor's
        /// exit was never reaped (e.g. cleanup finished first).
        status: Option<i32>,
        /// True when the isolator itself terminated the executor (explicit
        /// kill or OOM), false for spontaneous exits.
        destroyed: bool,
        /// Human-readable cause recorded at destruction time.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = IsolatorConfig::default();

        assert_eq!(config.hierarchy, PathBuf::from("/cgroup"));
        assert_eq!(config.subsystems, "cpu,memory,freezer");
        assert_eq!(config.root, "mesos");
        assert_eq!(config.polling_interval, Duration::from_millis(100));
    }
}
