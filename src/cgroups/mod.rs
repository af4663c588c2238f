//! cgroup v1 primitives
//!
//! This module speaks to the kernel through the cgroup v1 virtual filesystem.
//! A *hierarchy* is a mount of filesystem type `cgroup` with one or more
//! subsystems (controllers) attached; every directory below the mount point
//! is a cgroup, and the files inside each directory are its control files.
//!
//! ```text
//! /cgroup/                          <- hierarchy root (mounted with cpu,memory,freezer)
//! |-- tasks                         <- PIDs in the root cgroup
//! |-- mesos/                        <- umbrella cgroup
//! |   |-- freezer.state
//! |   `-- framework_F_executor_E_tag_T/
//! |       |-- tasks
//! |       |-- cpu.shares
//! |       |-- memory.limit_in_bytes
//! |       `-- freezer.state
//! ```
//!
//! Cgroups are named by their path relative to the hierarchy root; the empty
//! string (or `/`) denotes the root itself. All comparisons of hierarchy
//! paths are made on canonicalized absolute paths.
//!
//! Control files are not regular files: they do not support `lseek`, so a
//! read slurps the whole file in one sequential pass, and a write replaces
//! the value with a single newline-terminated line.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::{CgroupError, Result};
use crate::proc;

mod destroy;
mod freezer;
mod notifier;

pub use destroy::{destroy, empty_watch, kill_tasks, EMPTY_WATCHER_RETRIES};
pub use freezer::{freeze, thaw, FREEZE_RETRIES};
pub use notifier::listen;

/// Whether this kernel supports cgroups at all.
pub fn supported() -> bool {
    Path::new("/proc/cgroups").exists()
}

/// Join a relative cgroup path onto a hierarchy root.
///
/// A leading `/` on the cgroup is tolerated (and means the same cgroup);
/// `Path::join` would otherwise interpret it as an absolute replacement.
fn cgroup_path(hierarchy: &Path, cgroup: &str) -> PathBuf {
    hierarchy.join(cgroup.trim_start_matches('/'))
}

fn control_path(hierarchy: &Path, cgroup: &str, control: &str) -> PathBuf {
    cgroup_path(hierarchy, cgroup).join(control)
}

/// Split a subsystem CSV (`"cpu,memory,freezer"`) into trimmed tokens.
fn tokenize(subsystems: &str) -> impl Iterator<Item = &str> {
    subsystems
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path)
        .map_err(|e| CgroupError::io(format!("determine canonical path of {}", path.display()), e))
}

/// Check that the hierarchy is mounted, that the cgroup exists (when given),
/// and that the control file exists (when given). Every public operation
/// routes through this; a missing control file typically means the relevant
/// subsystem is not attached to the hierarchy.
pub(crate) fn verify(hierarchy: &Path, cgroup: Option<&str>, control: Option<&str>) -> Result<()> {
    debug_assert!(control.is_none() || cgroup.is_some());

    if !mounted(hierarchy, "")? {
        return Err(CgroupError::Precondition(format!(
            "{} is not mounted",
            hierarchy.display()
        )));
    }

    if let Some(cgroup) = cgroup {
        if !cgroup_path(hierarchy, cgroup).exists() {
            return Err(CgroupError::Precondition(format!(
                "{cgroup} does not exist"
            )));
        }

        if let Some(control) = control {
            if !control_path(hierarchy, cgroup, control).exists() {
                return Err(CgroupError::Precondition(format!(
                    "'{control}' does not exist (is subsystem attached?)"
                )));
            }
        }
    }

    Ok(())
}

/// Read a control file without precondition checks.
pub(crate) fn read_control(hierarchy: &Path, cgroup: &str, control: &str) -> Result<String> {
    let path = control_path(hierarchy, cgroup, control);
    fs::read_to_string(&path).map_err(|e| CgroupError::io(format!("read {}", path.display()), e))
}

/// Write a control file without precondition checks.
///
/// The value is written as one newline-terminated line. The file is opened
/// write-only without O_CREAT: control files always exist in a live cgroup,
/// and refusing to create keeps a typo from leaving a stray regular file.
pub(crate) fn write_control(
    hierarchy: &Path,
    cgroup: &str,
    control: &str,
    value: &str,
) -> Result<()> {
    let path = control_path(hierarchy, cgroup, control);

    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| CgroupError::io(format!("write {}", path.display()), e))?;
    file.write_all(value.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|e| CgroupError::io(format!("write {}", path.display()), e))?;
    Ok(())
}

/// Read the value of a cgroup control file.
pub fn read(hierarchy: &Path, cgroup: &str, control: &str) -> Result<String> {
    verify(hierarchy, Some(cgroup), Some(control))?;
    read_control(hierarchy, cgroup, control)
}

/// Write a value to a cgroup control file.
pub fn write(hierarchy: &Path, cgroup: &str, control: &str, value: &str) -> Result<()> {
    verify(hierarchy, Some(cgroup), Some(control))?;
    write_control(hierarchy, cgroup, control, value)
}

/// Canonicalized mount points of all currently mounted cgroup hierarchies.
pub fn hierarchies() -> Result<BTreeSet<PathBuf>> {
    let table = proc::mounts()?;

    let mut results = BTreeSet::new();
    for entry in &table.entries {
        if entry.fstype == "cgroup" {
            results.insert(canonicalize(&entry.dir)?);
        }
    }
    Ok(results)
}

/// Whether every subsystem in the CSV is enabled by the kernel.
///
/// Naming a subsystem the kernel does not know at all is an error, not
/// `false`.
pub fn enabled(subsystems: &str) -> Result<bool> {
    let infos = proc::cgroups()?;

    let mut all_enabled = true;
    for subsystem in tokenize(subsystems) {
        match infos.get(subsystem) {
            None => {
                return Err(CgroupError::Precondition(format!(
                    "'{subsystem}' not found"
                )))
            }
            Some(info) if !info.enabled => all_enabled = false,
            Some(_) => {}
        }
    }
    Ok(all_enabled)
}

/// Whether any subsystem in the CSV is already attached to some hierarchy.
///
/// A subsystem with hierarchy id 0 is attached nowhere and therefore free.
pub fn busy(subsystems: &str) -> Result<bool> {
    let infos = proc::cgroups()?;

    let mut any_busy = false;
    for subsystem in tokenize(subsystems) {
        match infos.get(subsystem) {
            None => {
                return Err(CgroupError::Precondition(format!(
                    "'{subsystem}' not found"
                )))
            }
            Some(info) if info.hierarchy != 0 => any_busy = true,
            Some(_) => {}
        }
    }
    Ok(any_busy)
}

/// Names of all subsystems enabled by this kernel.
pub fn enabled_subsystems() -> Result<BTreeSet<String>> {
    let infos = proc::cgroups()?;
    Ok(infos
        .into_values()
        .filter(|info| info.enabled)
        .map(|info| info.name)
        .collect())
}

/// Subsystems attached to a mounted hierarchy.
///
/// Found by intersecting the enabled subsystem names with the options of the
/// hierarchy's mount entry; mount options also carry unrelated flags (`rw`,
/// `relatime`) which the intersection discards. When the same directory was
/// mounted more than once, the last entry is authoritative.
pub fn attached_subsystems(hierarchy: &Path) -> Result<BTreeSet<String>> {
    let hierarchy_abs = canonicalize(hierarchy)?;
    let table = proc::mounts()?;

    let mut hierarchy_entry = None;
    for entry in &table.entries {
        if entry.fstype == "cgroup" && canonicalize(&entry.dir)? == hierarchy_abs {
            hierarchy_entry = Some(entry);
        }
    }

    let entry = hierarchy_entry.ok_or_else(|| {
        CgroupError::Precondition(format!(
            "{} is not a mount point for cgroups",
            hierarchy.display()
        ))
    })?;

    let names = enabled_subsystems()?;
    Ok(names
        .into_iter()
        .filter(|name| entry.has_option(name))
        .collect())
}

/// Mount a new cgroup hierarchy with the given subsystems attached.
///
/// The target directory must not exist yet. Each subsystem must be enabled
/// by the kernel and not attached to another hierarchy (a subsystem can only
/// belong to one hierarchy at a time). On mount failure the created
/// directory is removed best-effort and the mount error propagated.
pub fn mount(hierarchy: &Path, subsystems: &str) -> Result<()> {
    if hierarchy.exists() {
        return Err(CgroupError::Precondition(format!(
            "{} already exists in the file system",
            hierarchy.display()
        )));
    }

    for subsystem in tokenize(subsystems) {
        if !enabled(subsystem)? {
            return Err(CgroupError::Precondition(format!(
                "'{subsystem}' is not enabled by the kernel"
            )));
        }
        if busy(subsystem)? {
            return Err(CgroupError::Precondition(format!(
                "'{subsystem}' is already attached to another hierarchy"
            )));
        }
    }

    fs::create_dir_all(hierarchy)
        .map_err(|e| CgroupError::io(format!("mkdir {}", hierarchy.display()), e))?;

    // Both the source and the mount data are the subsystem CSV; the data is
    // what tells the kernel which controllers to attach.
    if let Err(errno) = nix::mount::mount(
        Some(subsystems),
        hierarchy,
        Some("cgroup"),
        MsFlags::empty(),
        Some(subsystems),
    ) {
        let _ = fs::remove_dir(hierarchy);
        return Err(CgroupError::io(
            format!("mount cgroup hierarchy at {}", hierarchy.display()),
            errno.into(),
        ));
    }

    Ok(())
}

/// Unmount a cgroup hierarchy and remove its root directory.
///
/// All cgroups in the hierarchy must have been removed first.
pub fn unmount(hierarchy: &Path) -> Result<()> {
    verify(hierarchy, None, None)?;

    nix::mount::umount(hierarchy).map_err(|errno| {
        CgroupError::io(
            format!("unmount cgroup hierarchy at {}", hierarchy.display()),
            errno.into(),
        )
    })?;

    fs::remove_dir(hierarchy)
        .map_err(|e| CgroupError::io(format!("remove directory {}", hierarchy.display()), e))
}

/// Whether `hierarchy` is a mounted cgroup hierarchy with every subsystem of
/// the CSV attached. An empty CSV checks only that the hierarchy is mounted.
pub fn mounted(hierarchy: &Path, subsystems: &str) -> Result<bool> {
    if !hierarchy.exists() {
        return Ok(false);
    }

    let realpath = canonicalize(hierarchy)?;
    if !hierarchies()?.contains(&realpath) {
        return Ok(false);
    }

    let attached = attached_subsystems(hierarchy)?;
    Ok(tokenize(subsystems).all(|subsystem| attached.contains(subsystem)))
}

// The kernel initializes cpuset.cpus and cpuset.mems of a fresh cgroup to
// empty; putting a task into a cgroup with an empty cpuset fails with EBUSY.
// Cloning the parent's values is therefore required for correctness, not an
// optimization.
fn clone_cpuset_cpus_mems(hierarchy: &Path, parent: &str, child: &str) -> Result<()> {
    let cpus = read_control(hierarchy, parent, "cpuset.cpus")?;
    let mems = read_control(hierarchy, parent, "cpuset.mems")?;

    write_control(hierarchy, child, "cpuset.cpus", cpus.trim())?;
    write_control(hierarchy, child, "cpuset.mems", mems.trim())?;
    Ok(())
}

/// Parent of a relative cgroup path; the hierarchy root is the empty string.
fn parent_cgroup(cgroup: &str) -> String {
    match Path::new(cgroup.trim_start_matches('/')).parent() {
        Some(parent) => parent.to_string_lossy().into_owned(),
        None => String::new(),
    }
}

/// Create a cgroup.
///
/// The directory is created non-recursively: the parent cgroup must already
/// exist. When the `cpuset` subsystem is attached to the hierarchy, the
/// parent's `cpuset.cpus` and `cpuset.mems` are cloned into the new cgroup
/// (the kernel leaves them empty and an empty cpuset rejects tasks).
pub fn create(hierarchy: &Path, cgroup: &str) -> Result<()> {
    verify(hierarchy, None, None)?;

    let path = cgroup_path(hierarchy, cgroup);
    fs::create_dir(&path)
        .map_err(|e| CgroupError::io(format!("create directory at {}", path.display()), e))?;

    let attached = attached_subsystems(hierarchy)?;
    if attached.contains("cpuset") {
        clone_cpuset_cpus_mems(hierarchy, &parent_cgroup(cgroup), cgroup)?;
    }

    Ok(())
}

/// Remove an empty cgroup directory without precondition checks.
pub(crate) fn remove_dir(hierarchy: &Path, cgroup: &str) -> Result<()> {
    let path = cgroup_path(hierarchy, cgroup);
    fs::remove_dir(&path)
        .map_err(|e| CgroupError::io(format!("remove cgroup at {}", path.display()), e))
}

/// Remove a cgroup.
///
/// Refuses when nested cgroups exist; removing a whole subtree is the
/// destroyer's job (see [`destroy`]). The kernel additionally rejects the
/// rmdir while tasks remain in the cgroup.
pub fn remove(hierarchy: &Path, cgroup: &str) -> Result<()> {
    verify(hierarchy, Some(cgroup), None)?;

    let nested = get(hierarchy, cgroup)?;
    if !nested.is_empty() {
        return Err(CgroupError::Precondition(
            "Nested cgroups exist".to_string(),
        ));
    }

    remove_dir(hierarchy, cgroup)
}

/// Whether the cgroup exists in the (mounted) hierarchy.
pub fn exists(hierarchy: &Path, cgroup: &str) -> Result<bool> {
    verify(hierarchy, None, None)?;
    Ok(cgroup_path(hierarchy, cgroup).exists())
}

/// Whether a control file exists in the cgroup. Absence usually means the
/// owning subsystem is not attached to this hierarchy.
pub fn exists_control(hierarchy: &Path, cgroup: &str, control: &str) -> Result<bool> {
    verify(hierarchy, Some(cgroup), None)?;
    Ok(control_path(hierarchy, cgroup, control).exists())
}

fn walk_postorder(dir: &Path, root: &Path, top: bool, out: &mut Vec<String>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .map_err(|e| CgroupError::io(format!("read directory {}", dir.display()), e))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| CgroupError::io(format!("read directory {}", dir.display()), e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| CgroupError::io(format!("stat {}", entry.path().display()), e))?;
        if file_type.is_dir() {
            walk_postorder(&entry.path(), root, false, out)?;
        }
    }

    if !top {
        let relative = dir.strip_prefix(root).map_err(|_| {
            CgroupError::Internal(format!(
                "{} escaped the hierarchy root {}",
                dir.display(),
                root.display()
            ))
        })?;
        out.push(relative.to_string_lossy().into_owned());
    }

    Ok(())
}

/// Enumerate every cgroup nested under `cgroup`, as paths relative to the
/// hierarchy root, in post-order: each child precedes its parent, and the
/// starting cgroup itself is not included. Callers iterating the result may
/// `rmdir` each entry in order, since leaves come first.
pub fn get(hierarchy: &Path, cgroup: &str) -> Result<Vec<String>> {
    verify(hierarchy, Some(cgroup), None)?;

    let hierarchy_abs = canonicalize(hierarchy)?;
    let dest_abs = canonicalize(&cgroup_path(hierarchy, cgroup))?;

    let mut cgroups = Vec::new();
    walk_postorder(&dest_abs, &hierarchy_abs, true, &mut cgroups)?;
    Ok(cgroups)
}

/// The set of PIDs currently in the cgroup, parsed from its `tasks` file.
pub fn tasks(hierarchy: &Path, cgroup: &str) -> Result<BTreeSet<i32>> {
    let value = read(hierarchy, cgroup, "tasks")?;

    let mut pids = BTreeSet::new();
    for token in value.split_whitespace() {
        let pid = token
            .parse::<i32>()
            .map_err(|_| CgroupError::Parse(format!("invalid pid '{token}' in tasks")))?;
        pids.insert(pid);
    }
    Ok(pids)
}

/// Move a process into the cgroup by writing its PID to `tasks`.
pub fn assign(hierarchy: &Path, cgroup: &str, pid: i32) -> Result<()> {
    write(hierarchy, cgroup, "tasks", &pid.to_string())
}

/// Send a signal to every task currently in the cgroup.
///
/// The task set is read once; the first failed `kill(2)` aborts the sweep
/// and already-signalled processes are not undone. Use [`kill_tasks`] for
/// the atomic freeze-then-kill variant.
pub fn kill(hierarchy: &Path, cgroup: &str, sig: Signal) -> Result<()> {
    verify(hierarchy, Some(cgroup), None)?;

    let pids = tasks(hierarchy, cgroup)?;
    for pid in pids {
        signal::kill(Pid::from_raw(pid), sig).map_err(|errno| {
            CgroupError::io(format!("send {sig:?} to process {pid}"), errno.into())
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_paths_tolerate_leading_slash() {
        let hierarchy = Path::new("/cgroup");
        assert_eq!(
            cgroup_path(hierarchy, "mesos/x"),
            PathBuf::from("/cgroup/mesos/x")
        );
        assert_eq!(
            cgroup_path(hierarchy, "/mesos/x"),
            PathBuf::from("/cgroup/mesos/x")
        );
    }

    #[test]
    fn parent_of_top_level_cgroup_is_the_root() {
        assert_eq!(parent_cgroup("mesos"), "");
        assert_eq!(parent_cgroup("mesos/x"), "mesos");
        assert_eq!(parent_cgroup("/mesos/x/y"), "mesos/x");
    }

    #[test]
    fn tokenize_skips_blanks() {
        let tokens: Vec<&str> = tokenize("cpu, memory ,,freezer").collect();
        assert_eq!(tokens, vec!["cpu", "memory", "freezer"]);
        assert_eq!(tokenize("").count(), 0);
    }

    #[test]
    fn walk_emits_children_before_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        // mesos/x with children a (containing a1) and b.
        fs::create_dir_all(root.join("mesos/x/a/a1")).unwrap();
        fs::create_dir_all(root.join("mesos/x/b")).unwrap();

        let mut out = Vec::new();
        walk_postorder(&root.join("mesos/x"), root, true, &mut out).unwrap();

        // a1 must precede a; the walk root itself is not included.
        let pos = |name: &str| out.iter().position(|c| c == name).unwrap();
        assert!(pos("mesos/x/a/a1") < pos("mesos/x/a"));
        assert!(out.contains(&"mesos/x/b".to_string()));
        assert_eq!(out.len(), 3);
        assert!(!out.contains(&"mesos/x".to_string()));
    }

    #[test]
    fn mounted_is_false_for_missing_path() {
        assert!(!mounted(Path::new("/definitely/not/a/hierarchy"), "").unwrap());
    }

    #[test]
    fn verify_reports_unmounted_hierarchy() {
        let err = verify(Path::new("/definitely/not/a/hierarchy"), None, None).unwrap_err();
        match err {
            CgroupError::Precondition(msg) => assert!(msg.contains("is not mounted")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
