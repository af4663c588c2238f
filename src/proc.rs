//! Parsers for the `/proc` files the library depends on
//!
//! - `/proc/cgroups` - the kernel's table of cgroup subsystems (controllers)
//! - `/proc/mounts` - mounted filesystems, used to discover cgroup hierarchies
//! - `/proc/<pid>/stat` - per-process state, used to find stopped tasks
//! - `/proc/cpuinfo` - CPU enumeration for the cpuset allocator
//!
//! Each file has a string-level parser (testable without `/proc`) and a thin
//! wrapper that reads the live file. `/proc` pseudo-files do not support
//! `lseek`, so reads slurp the whole file in one sequential pass.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::error::{CgroupError, Result};

/// One line of `/proc/cgroups`: a kernel-advertised cgroup subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemInfo {
    /// Name of the subsystem (e.g. `memory`, `freezer`).
    pub name: String,
    /// ID of the hierarchy the subsystem is attached to; 0 means unattached.
    pub hierarchy: u32,
    /// Number of cgroups currently using the subsystem.
    pub cgroups: u32,
    /// Whether the subsystem is enabled in this kernel.
    pub enabled: bool,
}

/// Read and parse `/proc/cgroups` into a map keyed by subsystem name.
pub fn cgroups() -> Result<BTreeMap<String, SubsystemInfo>> {
    let content = fs::read_to_string("/proc/cgroups")
        .map_err(|e| CgroupError::io("read /proc/cgroups", e))?;
    parse_cgroups(&content)
}

fn parse_cgroups(content: &str) -> Result<BTreeMap<String, SubsystemInfo>> {
    let mut infos = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        // The first line starts with '#' and contains the column titles.
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(CgroupError::Parse(format!(
                "malformed /proc/cgroups line: '{line}'"
            )));
        }

        let parse_u32 = |s: &str| {
            s.parse::<u32>().map_err(|_| {
                CgroupError::Parse(format!("malformed /proc/cgroups line: '{line}'"))
            })
        };

        let info = SubsystemInfo {
            name: fields[0].to_string(),
            hierarchy: parse_u32(fields[1])?,
            cgroups: parse_u32(fields[2])?,
            enabled: parse_u32(fields[3])? != 0,
        };
        infos.insert(info.name.clone(), info);
    }

    Ok(infos)
}

/// One line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mount source (for cgroup mounts this echoes the subsystem CSV).
    pub source: String,
    /// Mount point directory.
    pub dir: PathBuf,
    /// Filesystem type (`cgroup` for v1 hierarchies).
    pub fstype: String,
    /// Comma-separated mount options; for cgroup mounts these include the
    /// attached subsystem names alongside unrelated flags like `rw`.
    pub options: Vec<String>,
}

impl MountEntry {
    /// Whether the given option (e.g. a subsystem name) appears in this entry.
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

/// The mount table as read from `/proc/mounts`.
///
/// A directory can be mounted more than once; earlier mounts are obscured by
/// later ones, so consumers looking up a directory must take the last entry
/// that matches.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    pub entries: Vec<MountEntry>,
}

/// Read and parse `/proc/mounts`.
pub fn mounts() -> Result<MountTable> {
    let content = fs::read_to_string("/proc/mounts")
        .map_err(|e| CgroupError::io("read /proc/mounts", e))?;
    parse_mounts(&content)
}

fn parse_mounts(content: &str) -> Result<MountTable> {
    let mut entries = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(CgroupError::Parse(format!(
                "malformed /proc/mounts line: '{line}'"
            )));
        }

        entries.push(MountEntry {
            source: fields[0].to_string(),
            dir: PathBuf::from(fields[1]),
            fstype: fields[2].to_string(),
            options: fields[3].split(',').map(str::to_string).collect(),
        });
    }

    Ok(MountTable { entries })
}

/// The subset of `/proc/<pid>/stat` the library needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStat {
    pub pid: i32,
    /// Executable name, without the surrounding parentheses.
    pub comm: String,
    /// Single-character state: 'R' running, 'S' sleeping, 'T' stopped/traced,
    /// 'Z' zombie, etc.
    pub state: char,
}

/// Read and parse `/proc/<pid>/stat`.
pub fn stat(pid: i32) -> Result<ProcessStat> {
    let path = format!("/proc/{pid}/stat");
    let content =
        fs::read_to_string(&path).map_err(|e| CgroupError::io(format!("read {path}"), e))?;
    parse_stat(&content)
}

// The comm field is parenthesized and may itself contain spaces and
// parentheses, so the state character is found by splitting after the LAST
// ')' rather than by naive whitespace tokenization.
fn parse_stat(content: &str) -> Result<ProcessStat> {
    let malformed = || CgroupError::Parse(format!("malformed stat content: '{}'", content.trim()));

    let open = content.find('(').ok_or_else(malformed)?;
    let close = content.rfind(')').ok_or_else(malformed)?;
    if close < open {
        return Err(malformed());
    }

    let pid = content[..open]
        .trim()
        .parse::<i32>()
        .map_err(|_| malformed())?;
    let comm = content[open + 1..close].to_string();
    let state = content[close + 1..]
        .trim_start()
        .chars()
        .next()
        .ok_or_else(malformed)?;

    Ok(ProcessStat { pid, comm, state })
}

/// Enumerate online CPU ids from `/proc/cpuinfo`.
pub fn cpus() -> Result<Vec<u32>> {
    let content = fs::read_to_string("/proc/cpuinfo")
        .map_err(|e| CgroupError::io("read /proc/cpuinfo", e))?;
    parse_cpuinfo(&content)
}

fn parse_cpuinfo(content: &str) -> Result<Vec<u32>> {
    let mut ids = Vec::new();

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("processor") {
            if let Some(value) = rest.trim_start().strip_prefix(':') {
                let id = value.trim().parse::<u32>().map_err(|_| {
                    CgroupError::Parse(format!("malformed /proc/cpuinfo line: '{line}'"))
                })?;
                ids.push(id);
            }
        }
    }

    if ids.is_empty() {
        return Err(CgroupError::Parse(
            "no processors found in /proc/cpuinfo".to_string(),
        ));
    }

    Ok(ids)
}
