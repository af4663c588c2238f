//! cgwarden - Linux cgroups v1 control library and executor isolation engine
//!
//! This library translates high-level intents - create a cgroup, move a task
//! in, watch for out-of-memory events, destroy a subtree reliably - into
//! interactions with the kernel's cgroup v1 pseudo-filesystem, and builds a
//! per-executor isolation coordinator for a cluster-scheduler agent on top.
//!
//! # Modules
//!
//! - `proc` - parsers for `/proc/cgroups`, `/proc/mounts`, `/proc/<pid>/stat`
//!   and `/proc/cpuinfo`
//! - `cgroups` - hierarchy mounting, cgroup creation/removal/enumeration,
//!   control-file I/O, eventfd notifiers, the freezer driver and the
//!   freeze-kill-thaw-drain teardown machinery
//! - `isolation` - the coordinator binding launched executors to cgroups,
//!   applying resource changes and reconciling teardown with process exits
//! - `error` - the error taxonomy shared by all of the above
//! - `logging` - `tracing` subscriber setup
//!
//! # Quick Start
//!
//! ```ignore
//! use cgwarden::isolation::{Isolator, IsolatorConfig};
//!
//! // Mount (or reuse) the hierarchy and start the coordinator.
//! let (isolator, mut events) = Isolator::start(
//!     IsolatorConfig::default(),
//!     machine_resources,
//!     false,
//!     Box::new(launcher),
//! )?;
//!
//! // Launch an executor confined to its own cgroup.
//! isolator.launch_executor(framework_id, framework_info, executor_info, &dir, resources);
//!
//! // Lifecycle outcomes arrive asynchronously.
//! while let Some(event) = events.recv().await { /* ... */ }
//! ```
//!
//! Only cgroups v1 is supported; the unified (v2) hierarchy is out of scope.

pub mod cgroups;
pub mod error;
pub mod isolation;
pub mod logging;
pub mod proc;

// Re-export commonly used types at crate root for convenience
pub use error::CgroupError;
pub use isolation::{
    ExecutorId, ExecutorInfo, ExecutorLauncher, FrameworkId, FrameworkInfo, Isolator,
    IsolatorConfig, IsolatorEvent, Resource, Resources,
};
