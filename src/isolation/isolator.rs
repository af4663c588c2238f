//! Isolation coordinator
//!
//! A single actor owns everything mutable: the live-executor index, the
//! machine-wide CPU allocation map and the resource-handler table. The
//! public [`Isolator`] handle enqueues commands onto the actor's mailbox;
//! the actor processes one command at a time, so operations on any
//! `(framework, executor)` pair are serialized without locks.
//!
//! Long-running work (OOM listening, subtree destruction) runs in spawned
//! tasks that report back through the same mailbox, which is how reaper
//! notifications, OOM deliveries and explicit kills for the same executor
//! get linearized: the first to arrive wins the destroy reason, later
//! arrivals observe `destroyed` and become no-ops.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cgroups;
use crate::error::{CgroupError, Result};
use crate::proc;

use super::cpuset::Cpuset;
use super::{
    ExecutorId, ExecutorInfo, ExecutorLauncher, FrameworkId, FrameworkInfo, IsolatorConfig,
    IsolatorEvent, Resource, Resources,
};

/// cpu.shares granted per allocated CPU.
const CPU_SHARES_PER_CPU: u64 = 1024;

/// Lower bound on cpu.shares; the kernel misbehaves below small values.
const MIN_CPU_SHARES: u64 = 10;

/// Lower bound on the memory limit, in megabytes.
const MIN_MEMORY_MB: u64 = 32;

/// How many times a failed destroy is retried before giving up.
const DESTROY_RETRIES: u32 = 5;

/// Initial delay before a destroy retry; doubles per attempt.
const DESTROY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Compute cpu.shares for a fractional-core allocation.
fn cpu_shares(cpus: f64) -> u64 {
    ((cpus * CPU_SHARES_PER_CPU as f64).ceil() as u64).max(MIN_CPU_SHARES)
}

/// Compute memory.limit_in_bytes for a megabyte allocation.
fn mem_limit_bytes(mem_mb: f64) -> u64 {
    let mb = (mem_mb.ceil() as u64).max(MIN_MEMORY_MB);
    mb * 1024 * 1024
}

// TODO: map the executor's net allocation to a real net_cls class id; until
// then every executor lands in class 1.
fn bandwidth(_value: f64) -> u32 {
    1
}

/// Per-executor bookkeeping. One of these exists for every live executor;
/// the cgroup directory and the entry are created and removed together
/// (modulo the brief windows inside launch and destroy).
struct CgroupInfo {
    framework_id: FrameworkId,
    executor_id: ExecutorId,

    /// Random tag distinguishing sequential launches of the same executor.
    tag: String,

    /// PID of the executor's leading process, once launched.
    pid: Option<i32>,

    /// Exit status, once the reaper has reported it.
    status: Option<i32>,

    /// True once user-level termination has been requested (explicit kill or
    /// OOM, which is treated as a kill).
    killed: bool,

    /// True once this coordinator has initiated destruction of the cgroup.
    /// Set before the destroyer is spawned so that later OOM or reaper
    /// callbacks observe it and do not re-trigger destruction.
    destroyed: bool,

    /// Cause recorded at destruction time, reported to the agent.
    reason: String,

    /// Cancellation handle for the in-flight OOM listener.
    oom_notifier: Option<AbortHandle>,

    /// CPUs held when the cpuset subsystem is in use.
    cpuset: Option<Cpuset>,
}

impl CgroupInfo {
    /// Relative path of this executor's cgroup in the hierarchy.
    fn name(&self, root: &str) -> String {
        format!(
            "{}/framework_{}_executor_{}_tag_{}",
            root, self.framework_id, self.executor_id, self.tag
        )
    }
}

/// Whether a cgroup directory name follows the executor naming convention.
/// Used to find orphans left behind by a previous agent incarnation.
fn is_executor_cgroup(name: &str) -> bool {
    name.starts_with("framework_") && name.contains("_executor_") && name.contains("_tag_")
}

enum Command {
    Launch {
        framework_id: FrameworkId,
        framework_info: FrameworkInfo,
        executor_info: ExecutorInfo,
        directory: PathBuf,
        resources: Resources,
    },
    Kill {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
    ResourcesChanged {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        resources: Resources,
    },
    ProcessExited {
        pid: i32,
        status: i32,
    },
    Oom {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tag: String,
    },
    DestroyDone {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tag: String,
        attempt: u32,
        result: Result<()>,
    },
}

type Handler = fn(&mut IsolatorActor, &FrameworkId, &ExecutorId, &Resource) -> Result<()>;

/// Handle to the isolation coordinator.
///
/// Cloneable; all methods enqueue work on the coordinator's mailbox and
/// return immediately. Lifecycle outcomes arrive on the event channel
/// returned by [`Isolator::start`].
#[derive(Clone)]
pub struct Isolator {
    tx: mpsc::UnboundedSender<Command>,
}

impl Isolator {
    /// Initialize the isolation engine and start the coordinator.
    ///
    /// Mounts (or reuses) the hierarchy, creates the umbrella cgroup,
    /// schedules destruction of orphaned executor cgroups from a previous
    /// incarnation, seeds the CPU allocation map when `cpuset` is attached
    /// and installs the resource-handler table.
    ///
    /// Must be called from within a tokio runtime. `resources` describes the
    /// total machine resources (logged for the record); `local` marks
    /// single-machine test deployments.
    pub fn start(
        config: IsolatorConfig,
        resources: Resources,
        local: bool,
        launcher: Box<dyn ExecutorLauncher>,
    ) -> Result<(Isolator, mpsc::UnboundedReceiver<IsolatorEvent>)> {
        if !cgroups::supported() {
            return Err(CgroupError::Precondition(
                "cgroups are not supported by the kernel".to_string(),
            ));
        }

        // Teardown is built on freeze-kill-thaw; without the freezer there is
        // no way to destroy a cgroup reliably.
        if !config
            .subsystems
            .split(',')
            .map(str::trim)
            .any(|s| s == "freezer")
        {
            return Err(CgroupError::Precondition(
                "the 'freezer' subsystem is required".to_string(),
            ));
        }

        ensure_hierarchy(&config.hierarchy, &config.subsystems)?;

        if !cgroups::exists(&config.hierarchy, &config.root)? {
            cgroups::create(&config.hierarchy, &config.root)?;
        }

        let attached = cgroups::attached_subsystems(&config.hierarchy)?;
        info!(
            hierarchy = %config.hierarchy.display(),
            subsystems = %config.subsystems,
            local,
            ?resources,
            "cgroups isolation initialized"
        );

        // CPUs are allocated from the kernel's view of the machine, not from
        // the resource offer.
        let cpus = if attached.contains("cpuset") {
            proc::cpus()?.into_iter().map(|cpu| (cpu, 0.0)).collect()
        } else {
            BTreeMap::new()
        };

        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        // The same "cpus" key dispatches to one of two handlers depending on
        // whether the hierarchy pins CPUs or weights them.
        if attached.contains("cpuset") {
            handlers.insert("cpus", IsolatorActor::cpuset_changed);
        } else {
            handlers.insert("cpus", IsolatorActor::cpus_changed);
        }
        handlers.insert("mem", IsolatorActor::mem_changed);
        if attached.contains("net_cls") {
            handlers.insert("net", IsolatorActor::net_changed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let actor = IsolatorActor {
            config,
            attached,
            launcher,
            infos: HashMap::new(),
            cpus,
            handlers,
            tx: tx.clone(),
            events,
        };

        actor.destroy_orphans()?;

        tokio::spawn(actor.run(rx));

        Ok((Isolator { tx }, events_rx))
    }

    /// Launch an executor confined to a fresh cgroup.
    pub fn launch_executor(
        &self,
        framework_id: FrameworkId,
        framework_info: FrameworkInfo,
        executor_info: ExecutorInfo,
        directory: &Path,
        resources: Resources,
    ) {
        self.send(Command::Launch {
            framework_id,
            framework_info,
            executor_info,
            directory: directory.to_path_buf(),
            resources,
        });
    }

    /// Terminate an executor and tear its cgroup down.
    pub fn kill_executor(&self, framework_id: FrameworkId, executor_id: ExecutorId) {
        self.send(Command::Kill {
            framework_id,
            executor_id,
        });
    }

    /// Apply a changed resource allocation to a running executor.
    pub fn resources_changed(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        resources: Resources,
    ) {
        self.send(Command::ResourcesChanged {
            framework_id,
            executor_id,
            resources,
        });
    }

    /// Reaper callback: a tracked PID has exited.
    pub fn process_exited(&self, pid: i32, status: i32) {
        self.send(Command::ProcessExited { pid, status });
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("isolation coordinator is gone, dropping command");
        }
    }
}

/// Make sure the hierarchy is mounted with the requested subsystems.
///
/// Reuses a hierarchy already mounted with (at least) the requested
/// subsystems; fails when the path is mounted as a cgroup hierarchy with a
/// different set. An unmounted but empty pre-existing directory is removed
/// and mounted fresh.
fn ensure_hierarchy(hierarchy: &Path, subsystems: &str) -> Result<()> {
    if cgroups::mounted(hierarchy, subsystems)? {
        return Ok(());
    }

    if hierarchy.exists() {
        let canonical = fs::canonicalize(hierarchy).map_err(|e| {
            CgroupError::io(
                format!("determine canonical path of {}", hierarchy.display()),
                e,
            )
        })?;
        if cgroups::hierarchies()?.contains(&canonical) {
            return Err(CgroupError::Precondition(format!(
                "{} is mounted with a different set of subsystems",
                hierarchy.display()
            )));
        }

        let mut entries = fs::read_dir(hierarchy)
            .map_err(|e| CgroupError::io(format!("read directory {}", hierarchy.display()), e))?;
        if entries.next().is_some() {
            return Err(CgroupError::Precondition(format!(
                "{} exists and is not empty",
                hierarchy.display()
            )));
        }

        fs::remove_dir(hierarchy)
            .map_err(|e| CgroupError::io(format!("remove directory {}", hierarchy.display()), e))?;
    }

    cgroups::mount(hierarchy, subsystems)
}

struct IsolatorActor {
    config: IsolatorConfig,

    /// Subsystems attached to the hierarchy in use.
    attached: BTreeSet<String>,

    launcher: Box<dyn ExecutorLauncher>,

    /// The cgroup information for each live executor.
    infos: HashMap<FrameworkId, HashMap<ExecutorId, CgroupInfo>>,

    /// Machine-wide CPU usage (only populated when cpuset is attached).
    cpus: BTreeMap<u32, f64>,

    /// Resource handlers keyed by resource name; immutable after start.
    handlers: HashMap<&'static str, Handler>,

    /// Self-sender, cloned into spawned tasks so they can report back.
    tx: mpsc::UnboundedSender<Command>,

    events: mpsc::UnboundedSender<IsolatorEvent>,
}

impl IsolatorActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Launch {
                    framework_id,
                    framework_info,
                    executor_info,
                    directory,
                    resources,
                } => self.launch(framework_id, framework_info, executor_info, directory, resources),
                Command::Kill {
                    framework_id,
                    executor_id,
                } => self.kill(&framework_id, &executor_id),
                Command::ResourcesChanged {
                    framework_id,
                    executor_id,
                    resources,
                } => self.apply_resources(&framework_id, &executor_id, &resources),
                Command::ProcessExited { pid, status } => self.handle_process_exited(pid, status),
                Command::Oom {
                    framework_id,
                    executor_id,
                    tag,
                } => self.handle_oom(&framework_id, &executor_id, &tag),
                Command::DestroyDone {
                    framework_id,
                    executor_id,
                    tag,
                    attempt,
                    result,
                } => self.destroy_done(&framework_id, &executor_id, &tag, attempt, result),
            }
        }
    }

    fn find_info(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> Option<&mut CgroupInfo> {
        self.infos
            .get_mut(framework_id)
            .and_then(|executors| executors.get_mut(executor_id))
    }

    fn find_info_by_pid(&mut self, pid: i32) -> Option<&mut CgroupInfo> {
        self.infos
            .values_mut()
            .flat_map(|executors| executors.values_mut())
            .find(|info| info.pid == Some(pid))
    }

    /// Schedule destruction of executor cgroups left behind by a previous
    /// agent incarnation. No live PID claims them, so they are simply torn
    /// down in the background.
    fn destroy_orphans(&self) -> Result<()> {
        let nested = cgroups::get(&self.config.hierarchy, &self.config.root)?;
        let root_prefix = format!("{}/", self.config.root);

        for cgroup in nested {
            let name = match cgroup.strip_prefix(&root_prefix) {
                Some(name) => name,
                None => continue,
            };
            // Only direct children of the umbrella cgroup are executor
            // cgroups; anything deeper belongs to the executor itself and
            // dies with it.
            if name.contains('/') || !is_executor_cgroup(name) {
                continue;
            }

            info!(cgroup = %cgroup, "destroying orphaned executor cgroup");
            let hierarchy = self.config.hierarchy.clone();
            let interval = self.config.polling_interval;
            tokio::spawn(async move {
                if let Err(e) = cgroups::destroy(&hierarchy, &cgroup, interval).await {
                    error!(cgroup = %cgroup, error = %e, "failed to destroy orphaned cgroup");
                }
            });
        }

        Ok(())
    }

    fn launch(
        &mut self,
        framework_id: FrameworkId,
        framework_info: FrameworkInfo,
        executor_info: ExecutorInfo,
        directory: PathBuf,
        resources: Resources,
    ) {
        let executor_id = executor_info.executor_id.clone();

        if self.find_info(&framework_id, &executor_id).is_some() {
            error!(
                framework = %framework_id,
                executor = %executor_id,
                "executor is already launched"
            );
            self.emit_terminated(
                &framework_id,
                &executor_id,
                None,
                false,
                "executor already launched".to_string(),
            );
            return;
        }

        let info = CgroupInfo {
            framework_id: framework_id.clone(),
            executor_id: executor_id.clone(),
            tag: Uuid::new_v4().to_string(),
            pid: None,
            status: None,
            killed: false,
            destroyed: false,
            reason: String::new(),
            oom_notifier: None,
            cpuset: self.attached.contains("cpuset").then(Cpuset::new),
        };
        let cgroup = info.name(&self.config.root);

        info!(
            framework = %framework_id,
            executor = %executor_id,
            cgroup = %cgroup,
            "launching executor"
        );

        self.infos
            .entry(framework_id.clone())
            .or_default()
            .insert(executor_id.clone(), info);

        if let Err(e) = cgroups::create(&self.config.hierarchy, &cgroup) {
            self.fail_launch(&framework_id, &executor_id, format!("failed to create cgroup: {e}"));
            return;
        }

        // Resource limits are in place before the executor starts, so it
        // never runs unconfined.
        for resource in &resources {
            if let Err(e) = self.apply_resource(&framework_id, &executor_id, resource) {
                self.fail_launch(
                    &framework_id,
                    &executor_id,
                    format!("failed to apply resource '{}': {e}", resource.name),
                );
                return;
            }
        }

        let pid = match self
            .launcher
            .launch(&framework_id, &framework_info, &executor_info, &directory)
        {
            Ok(pid) => pid,
            Err(e) => {
                self.fail_launch(&framework_id, &executor_id, format!("failed to launch executor: {e}"));
                return;
            }
        };

        // Move the leading process into the cgroup immediately, before it
        // has a chance to fork.
        if let Err(e) = cgroups::assign(&self.config.hierarchy, &cgroup, pid) {
            self.fail_launch(
                &framework_id,
                &executor_id,
                format!("failed to assign pid {pid} to cgroup: {e}"),
            );
            return;
        }

        if let Some(info) = self.find_info(&framework_id, &executor_id) {
            info.pid = Some(pid);
        }

        info!(
            framework = %framework_id,
            executor = %executor_id,
            pid,
            "executor launched and assigned to cgroup"
        );

        if self.attached.contains("memory") {
            self.oom_listen(&framework_id, &executor_id);
        }
    }

    /// A launch step failed: record the reason and tear down whatever was
    /// already created. When the cgroup directory exists the destroyer
    /// removes it and the agent is notified on completion; when it was never
    /// created the entry is dropped and the agent notified immediately.
    fn fail_launch(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId, reason: String) {
        error!(
            framework = %framework_id,
            executor = %executor_id,
            reason = %reason,
            "executor launch failed"
        );

        let root = self.config.root.clone();
        let cgroup = match self.find_info(framework_id, executor_id) {
            Some(info) => info.name(&root),
            None => return,
        };

        match cgroups::exists(&self.config.hierarchy, &cgroup) {
            Ok(true) => self.destroy_executor(framework_id, executor_id, reason),
            _ => {
                if let Some(info) = self.unregister(framework_id, executor_id) {
                    self.emit_terminated(framework_id, executor_id, info.status, false, reason);
                }
            }
        }
    }

    fn kill(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let info = match self.find_info(framework_id, executor_id) {
            Some(info) => info,
            None => {
                warn!(
                    framework = %framework_id,
                    executor = %executor_id,
                    "asked to kill an unknown executor"
                );
                return;
            }
        };

        if info.killed {
            warn!(
                framework = %framework_id,
                executor = %executor_id,
                "executor is already being killed"
            );
            return;
        }
        info.killed = true;

        info!(framework = %framework_id, executor = %executor_id, "killing executor");
        self.destroy_executor(framework_id, executor_id, "executor killed".to_string());
    }

    fn apply_resources(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        resources: &Resources,
    ) {
        match self.find_info(framework_id, executor_id) {
            None => {
                warn!(
                    framework = %framework_id,
                    executor = %executor_id,
                    "resources changed for an unknown executor"
                );
                return;
            }
            Some(info) if info.killed || info.destroyed => {
                warn!(
                    framework = %framework_id,
                    executor = %executor_id,
                    "resources changed for a terminating executor"
                );
                return;
            }
            Some(_) => {}
        }

        for resource in resources {
            if let Err(e) = self.apply_resource(framework_id, executor_id, resource) {
                error!(
                    framework = %framework_id,
                    executor = %executor_id,
                    resource = %resource.name,
                    error = %e,
                    "failed to apply resource change"
                );
            }
        }
    }

    /// Dispatch one resource to its handler. Resources without a registered
    /// handler are ignored.
    fn apply_resource(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        resource: &Resource,
    ) -> Result<()> {
        match self.handlers.get(resource.name.as_str()).copied() {
            Some(handler) => handler(self, framework_id, executor_id, resource),
            None => {
                debug!(resource = %resource.name, "no handler for resource, skipping");
                Ok(())
            }
        }
    }

    /// Handler for `cpus` when CPUs are weighted with cpu.shares.
    fn cpus_changed(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        resource: &Resource,
    ) -> Result<()> {
        let info = self
            .infos
            .get_mut(framework_id)
            .and_then(|executors| executors.get_mut(executor_id))
            .ok_or_else(|| CgroupError::Internal("no cgroup info for executor".to_string()))?;
        let cgroup = info.name(&self.config.root);

        let shares = cpu_shares(resource.value);
        cgroups::write(
            &self.config.hierarchy,
            &cgroup,
            "cpu.shares",
            &shares.to_string(),
        )?;

        info!(cgroup = %cgroup, cpus = resource.value, shares, "updated cpu.shares");
        Ok(())
    }

    /// Handler for `cpus` when CPUs are pinned with the cpuset subsystem.
    ///
    /// Grows from the least-used CPUs machine-wide, shrinks from the CPUs
    /// this executor uses most, then rewrites the executor's CPU mask.
    fn cpuset_changed(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        resource: &Resource,
    ) -> Result<()> {
        let info = self
            .infos
            .get_mut(framework_id)
            .and_then(|executors| executors.get_mut(executor_id))
            .ok_or_else(|| CgroupError::Internal("no cgroup info for executor".to_string()))?;
        let cpuset = info
            .cpuset
            .as_mut()
            .ok_or_else(|| CgroupError::Internal("executor has no cpuset".to_string()))?;

        let delta = resource.value - cpuset.total();
        if delta > 0.0 {
            for (cpu, fraction) in cpuset.grow(delta, &self.cpus)? {
                *self.cpus.entry(cpu).or_insert(0.0) += fraction;
            }
        } else if delta < 0.0 {
            for (cpu, fraction) in cpuset.shrink(-delta)? {
                if let Some(usage) = self.cpus.get_mut(&cpu) {
                    *usage -= fraction;
                }
            }
        }

        let mask = cpuset.mask();
        let cgroup = info.name(&self.config.root);
        cgroups::write(&self.config.hierarchy, &cgroup, "cpuset.cpus", &mask)?;

        info!(cgroup = %cgroup, cpus = resource.value, mask = %mask, "updated cpuset.cpus");
        Ok(())
    }

    /// Handler for `mem`. Hard and soft limits track together; a shrink the
    /// kernel rejects with EBUSY (limit below current RSS) is reported but
    /// does not fail the executor.
    fn mem_changed(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        resource: &Resource,
    ) -> Result<()> {
        let info = self
            .infos
            .get_mut(framework_id)
            .and_then(|executors| executors.get_mut(executor_id))
            .ok_or_else(|| CgroupError::Internal("no cgroup info for executor".to_string()))?;
        let cgroup = info.name(&self.config.root);

        let limit = mem_limit_bytes(resource.value);

        match cgroups::write(
            &self.config.hierarchy,
            &cgroup,
            "memory.limit_in_bytes",
            &limit.to_string(),
        ) {
            Ok(()) => {}
            Err(e) if e.is_busy() => {
                warn!(
                    cgroup = %cgroup,
                    limit,
                    "kernel refused to shrink memory limit below current usage"
                );
            }
            Err(e) => return Err(e),
        }

        cgroups::write(
            &self.config.hierarchy,
            &cgroup,
            "memory.soft_limit_in_bytes",
            &limit.to_string(),
        )?;

        info!(cgroup = %cgroup, mem_mb = resource.value, limit, "updated memory limits");
        Ok(())
    }

    /// Handler for `net` when the net_cls subsystem is attached.
    fn net_changed(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        resource: &Resource,
    ) -> Result<()> {
        let info = self
            .infos
            .get_mut(framework_id)
            .and_then(|executors| executors.get_mut(executor_id))
            .ok_or_else(|| CgroupError::Internal("no cgroup info for executor".to_string()))?;
        let cgroup = info.name(&self.config.root);

        let classid = bandwidth(resource.value);
        cgroups::write(
            &self.config.hierarchy,
            &cgroup,
            "net_cls.classid",
            &classid.to_string(),
        )?;

        info!(cgroup = %cgroup, classid, "updated net_cls.classid");
        Ok(())
    }

    /// Start listening for OOM events on the executor's cgroup. The spawned
    /// task reports delivery through the mailbox; its abort handle lives in
    /// the CgroupInfo so a voluntary kill can cancel the listener (closing
    /// the eventfd) before the cgroup goes away.
    fn oom_listen(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let root = self.config.root.clone();
        let hierarchy = self.config.hierarchy.clone();
        let tx = self.tx.clone();

        let info = match self.find_info(framework_id, executor_id) {
            Some(info) => info,
            None => return,
        };
        let cgroup = info.name(&root);
        let tag = info.tag.clone();
        let framework_id = framework_id.clone();
        let executor_id = executor_id.clone();

        let handle = tokio::spawn(async move {
            match cgroups::listen(&hierarchy, &cgroup, "memory.oom_control", None).await {
                Ok(_) => {
                    let _ = tx.send(Command::Oom {
                        framework_id,
                        executor_id,
                        tag,
                    });
                }
                Err(e) => {
                    warn!(cgroup = %cgroup, error = %e, "failed to listen for OOM events");
                }
            }
        });

        info.oom_notifier = Some(handle.abort_handle());
    }

    /// An OOM event was delivered for the executor's cgroup.
    fn handle_oom(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId, tag: &str) {
        let root = self.config.root.clone();
        let info = match self.find_info(framework_id, executor_id) {
            Some(info) => info,
            // The executor is already gone; stale delivery.
            None => return,
        };

        // A tag mismatch means the event belongs to an earlier launch of the
        // same executor ids; a set destroyed flag means teardown has already
        // begun. Either way this delivery is a no-op.
        if info.tag != tag || info.destroyed || info.killed {
            return;
        }
        info.killed = true;

        let cgroup = info.name(&root);
        warn!(
            framework = %framework_id,
            executor = %executor_id,
            cgroup = %cgroup,
            "OOM detected for executor"
        );

        // Best-effort diagnostics before the cgroup disappears.
        if let Ok(limit) = cgroups::read(&self.config.hierarchy, &cgroup, "memory.limit_in_bytes") {
            info!(cgroup = %cgroup, limit = %limit.trim(), "memory limit at OOM");
        }
        if let Ok(usage) = cgroups::read(&self.config.hierarchy, &cgroup, "memory.usage_in_bytes") {
            info!(cgroup = %cgroup, usage = %usage.trim(), "memory usage at OOM");
        }

        self.destroy_executor(framework_id, executor_id, "memory limit exceeded".to_string());
    }

    fn handle_process_exited(&mut self, pid: i32, status: i32) {
        let info = match self.find_info_by_pid(pid) {
            Some(info) => info,
            // Not one of ours.
            None => return,
        };

        info.status = Some(status);

        let framework_id = info.framework_id.clone();
        let executor_id = info.executor_id.clone();

        if info.destroyed {
            // We initiated the destruction; the terminated event is emitted
            // when the destroyer completes.
            debug!(pid, status, "tracked process exited during destruction");
            return;
        }

        info!(
            framework = %framework_id,
            executor = %executor_id,
            pid,
            status,
            "executor exited"
        );
        self.destroy_executor(&framework_id, &executor_id, "executor exited".to_string());
    }

    /// Initiate destruction of an executor's cgroup subtree. Sets the
    /// `destroyed` flag first so that at most one destroyer is ever in
    /// flight per executor, cancels the OOM listener, and spawns the
    /// destroyer. The CgroupInfo stays registered until the destroyer
    /// reports success.
    fn destroy_executor(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId, reason: String) {
        let root = self.config.root.clone();
        let info = match self.find_info(framework_id, executor_id) {
            Some(info) => info,
            None => return,
        };

        if info.destroyed {
            return;
        }
        info.destroyed = true;
        info.reason = reason;

        // The listener must not fire on a cgroup being torn down; aborting
        // the task closes its eventfd.
        if let Some(notifier) = info.oom_notifier.take() {
            notifier.abort();
        }

        let cgroup = info.name(&root);
        let tag = info.tag.clone();

        info!(
            framework = %framework_id,
            executor = %executor_id,
            cgroup = %cgroup,
            reason = %info.reason,
            "destroying executor cgroup"
        );

        self.spawn_destroy(framework_id.clone(), executor_id.clone(), tag, cgroup, 1, Duration::ZERO);
    }

    fn spawn_destroy(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tag: String,
        cgroup: String,
        attempt: u32,
        delay: Duration,
    ) {
        let hierarchy = self.config.hierarchy.clone();
        let interval = self.config.polling_interval;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = cgroups::destroy(&hierarchy, &cgroup, interval).await;
            let _ = tx.send(Command::DestroyDone {
                framework_id,
                executor_id,
                tag,
                attempt,
                result,
            });
        });
    }

    fn destroy_done(
        &mut self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        tag: &str,
        attempt: u32,
        result: Result<()>,
    ) {
        let root = self.config.root.clone();
        let info = match self.find_info(framework_id, executor_id) {
            Some(info) if info.tag == tag => info,
            // A newer launch took the slot, or the entry is gone; stale.
            _ => return,
        };

        match result {
            Ok(()) => {
                let cgroup = info.name(&root);
                info!(
                    framework = %framework_id,
                    executor = %executor_id,
                    cgroup = %cgroup,
                    "executor cgroup destroyed"
                );

                let info = self.unregister(framework_id, executor_id);
                if let Some(info) = info {
                    self.emit_terminated(
                        framework_id,
                        executor_id,
                        info.status,
                        info.killed,
                        info.reason,
                    );
                }
            }
            Err(e) if attempt < DESTROY_RETRIES => {
                let delay = DESTROY_RETRY_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    framework = %framework_id,
                    executor = %executor_id,
                    attempt,
                    error = %e,
                    ?delay,
                    "failed to destroy executor cgroup, retrying"
                );
                let cgroup = info.name(&root);
                self.spawn_destroy(
                    framework_id.clone(),
                    executor_id.clone(),
                    tag.to_string(),
                    cgroup,
                    attempt + 1,
                    delay,
                );
            }
            Err(e) => {
                // Leave the CgroupInfo in place so an operator can intervene
                // and a later retry stays coherent.
                error!(
                    framework = %framework_id,
                    executor = %executor_id,
                    attempts = attempt,
                    error = %e,
                    "giving up on destroying executor cgroup"
                );
            }
        }
    }

    /// Remove the executor from the live index, returning the released CPU
    /// fractions to the machine-wide map.
    fn unregister(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> Option<CgroupInfo> {
        let executors = self.infos.get_mut(framework_id)?;
        let mut info = executors.remove(executor_id)?;
        if executors.is_empty() {
            self.infos.remove(framework_id);
        }

        if let Some(mut cpuset) = info.cpuset.take() {
            let total = cpuset.total();
            if total > 0.0 {
                if let Ok(released) = cpuset.shrink(total) {
                    for (cpu, fraction) in released {
                        if let Some(usage) = self.cpus.get_mut(&cpu) {
                            *usage -= fraction;
                        }
                    }
                }
            }
        }

        Some(info)
    }

    fn emit_terminated(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        status: Option<i32>,
        destroyed: bool,
        reason: String,
    ) {
        let _ = self.events.send(IsolatorEvent::ExecutorTerminated {
            framework_id: framework_id.clone(),
            executor_id: executor_id.clone(),
            status,
            destroyed,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_shares_scale_and_floor() {
        assert_eq!(cpu_shares(1.0), 1024);
        assert_eq!(cpu_shares(2.5), 2560);
        // Fractions round up.
        assert_eq!(cpu_shares(0.1), 103);
        // Tiny allocations never drop below the kernel-safe floor.
        assert_eq!(cpu_shares(0.001), 10);
        assert_eq!(cpu_shares(0.0), 10);
    }

    #[test]
    fn mem_limits_floor_at_minimum() {
        assert_eq!(mem_limit_bytes(64.0), 64 * 1024 * 1024);
        assert_eq!(mem_limit_bytes(0.5), 32 * 1024 * 1024);
        assert_eq!(mem_limit_bytes(0.0), 32 * 1024 * 1024);
        // Fractional megabytes round up.
        assert_eq!(mem_limit_bytes(64.2), 65 * 1024 * 1024);
    }

    #[test]
    fn executor_cgroup_names_follow_the_convention() {
        let info = CgroupInfo {
            framework_id: FrameworkId::from("f1"),
            executor_id: ExecutorId::from("e1"),
            tag: "abc123".to_string(),
            pid: None,
            status: None,
            killed: false,
            destroyed: false,
            reason: String::new(),
            oom_notifier: None,
            cpuset: None,
        };

        let name = info.name("mesos");
        assert_eq!(name, "mesos/framework_f1_executor_e1_tag_abc123");

        let leaf = name.strip_prefix("mesos/").unwrap();
        assert!(is_executor_cgroup(leaf));
    }

    #[test]
    fn orphan_matcher_rejects_unrelated_names() {
        assert!(is_executor_cgroup("framework_f_executor_e_tag_t"));
        assert!(!is_executor_cgroup("framework_f_executor_e"));
        assert!(!is_executor_cgroup("something_else"));
        assert!(!is_executor_cgroup("executor_e_tag_t"));
    }
}
