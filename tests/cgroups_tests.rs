//! Integration tests for the cgroup primitives
//!
//! Tests that talk to a real cgroup v1 hierarchy need root and a kernel with
//! free cpu/memory/freezer subsystems (i.e. not already claimed by an init
//! system); they are marked #[ignore] and run with `cargo test -- --ignored`
//! on a dedicated machine. The precondition tests run anywhere.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use cgwarden::cgroups;
use cgwarden::error::CgroupError;

const INTERVAL: Duration = Duration::from_millis(100);

fn unmounted() -> &'static Path {
    Path::new("/definitely/not/a/cgroup/hierarchy")
}

/// Every primitive checks its preconditions before touching the kernel.
#[test]
fn operations_on_unmounted_hierarchy_fail() {
    let assert_precondition = |result: Result<(), CgroupError>| match result {
        Err(CgroupError::Precondition(msg)) => assert!(msg.contains("is not mounted")),
        other => panic!("expected a precondition failure, got {other:?}"),
    };

    assert_precondition(cgroups::create(unmounted(), "mesos/x"));
    assert_precondition(cgroups::remove(unmounted(), "mesos/x"));
    assert_precondition(cgroups::assign(unmounted(), "mesos/x", 1));
    assert_precondition(cgroups::write(unmounted(), "mesos/x", "cpu.shares", "1024"));
    assert_precondition(cgroups::read(unmounted(), "mesos/x", "tasks").map(|_| ()));
    assert_precondition(cgroups::get(unmounted(), "mesos/x").map(|_| ()));
    assert_precondition(cgroups::exists(unmounted(), "mesos/x").map(|_| ()));
}

#[tokio::test]
async fn async_operations_on_unmounted_hierarchy_fail() {
    assert!(cgroups::freeze(unmounted(), "mesos/x", INTERVAL, 1)
        .await
        .is_err());
    assert!(cgroups::thaw(unmounted(), "mesos/x", INTERVAL).await.is_err());
    assert!(cgroups::destroy(unmounted(), "mesos/x", INTERVAL)
        .await
        .is_err());
    assert!(
        cgroups::listen(unmounted(), "mesos/x", "memory.oom_control", None)
            .await
            .is_err()
    );
}

#[test]
fn mounted_is_false_for_a_plain_directory() {
    let tmp = tempfile::tempdir().unwrap();
    assert!(!cgroups::mounted(tmp.path(), "").unwrap());
}

// ---------------------------------------------------------------------------
// Root-only tests below. Each mounts a private hierarchy, runs one scenario
// and unmounts again.
// ---------------------------------------------------------------------------

struct Hierarchy {
    root: PathBuf,
}

impl Hierarchy {
    fn mount(subsystems: &str) -> Self {
        cgwarden::logging::init("info,cgwarden=debug");
        let root = PathBuf::from(format!("/tmp/cgwarden-test-{}", std::process::id()));
        cgroups::mount(&root, subsystems).expect("mounting requires root and free subsystems");
        Self { root }
    }
}

impl Drop for Hierarchy {
    fn drop(&mut self) {
        let _ = cgroups::unmount(&self.root);
    }
}

fn spawn_in_cgroup(hierarchy: &Path, cgroup: &str, command: &str) -> i32 {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .spawn()
        .expect("failed to spawn test child");
    let pid = child.id() as i32;
    cgroups::assign(hierarchy, cgroup, pid).expect("failed to assign child to cgroup");
    pid
}

#[tokio::test]
#[ignore = "requires root and unattached cpu/memory/freezer subsystems"]
async fn create_remove_roundtrip() {
    let h = Hierarchy::mount("cpu,freezer");

    assert!(!cgroups::exists(&h.root, "mesos").unwrap());
    cgroups::create(&h.root, "mesos").unwrap();
    assert!(cgroups::exists(&h.root, "mesos").unwrap());

    // Attached subsystems surface their control files; others are absent.
    assert!(cgroups::exists_control(&h.root, "mesos", "tasks").unwrap());
    assert!(cgroups::exists_control(&h.root, "mesos", "freezer.state").unwrap());
    assert!(!cgroups::exists_control(&h.root, "mesos", "memory.limit_in_bytes").unwrap());

    cgroups::remove(&h.root, "mesos").unwrap();
    assert!(!cgroups::exists(&h.root, "mesos").unwrap());
}

#[tokio::test]
#[ignore = "requires root and unattached cpu/memory/freezer subsystems"]
async fn freeze_kill_destroy_happy_path() {
    let h = Hierarchy::mount("cpu,memory,freezer");
    cgroups::create(&h.root, "mesos").unwrap();
    cgroups::create(&h.root, "mesos/x").unwrap();

    let pid = spawn_in_cgroup(&h.root, "mesos/x", "while true; do :; done");
    assert!(cgroups::tasks(&h.root, "mesos/x").unwrap().contains(&pid));

    tokio::time::timeout(
        Duration::from_secs(2),
        cgroups::destroy(&h.root, "mesos/x", INTERVAL),
    )
    .await
    .expect("destroy timed out")
    .unwrap();

    assert!(!cgroups::exists(&h.root, "mesos/x").unwrap());

    cgroups::remove(&h.root, "mesos").unwrap();
}

#[tokio::test]
#[ignore = "requires root and unattached cpu/memory/freezer subsystems"]
async fn stopped_child_does_not_wedge_the_freezer() {
    let h = Hierarchy::mount("cpu,freezer");
    cgroups::create(&h.root, "mesos").unwrap();
    cgroups::create(&h.root, "mesos/x").unwrap();

    let pid = spawn_in_cgroup(&h.root, "mesos/x", "sleep 1000");

    // A stopped task keeps freezer.state in FREEZING until someone resumes
    // it; the freezer must do that itself.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGSTOP)
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        cgroups::destroy(&h.root, "mesos/x", INTERVAL),
    )
    .await
    .expect("destroy timed out on a stopped child")
    .unwrap();

    assert!(!cgroups::exists(&h.root, "mesos/x").unwrap());

    cgroups::remove(&h.root, "mesos").unwrap();
}

#[tokio::test]
#[ignore = "requires root and unattached cpu/memory/freezer subsystems"]
async fn destroy_removes_subtrees_leaves_first() {
    let h = Hierarchy::mount("cpu,freezer");
    cgroups::create(&h.root, "mesos").unwrap();
    cgroups::create(&h.root, "mesos/x").unwrap();
    cgroups::create(&h.root, "mesos/x/a").unwrap();
    cgroups::create(&h.root, "mesos/x/a/a1").unwrap();
    cgroups::create(&h.root, "mesos/x/b").unwrap();

    // Each child precedes its parent in the enumeration the destroyer uses.
    let nested = cgroups::get(&h.root, "mesos/x").unwrap();
    let pos = |name: &str| nested.iter().position(|c| c == name).unwrap();
    assert!(pos("mesos/x/a/a1") < pos("mesos/x/a"));
    assert_eq!(nested.len(), 3);

    cgroups::destroy(&h.root, "mesos/x", INTERVAL).await.unwrap();
    assert!(!cgroups::exists(&h.root, "mesos/x").unwrap());

    cgroups::remove(&h.root, "mesos").unwrap();
}

#[tokio::test]
#[ignore = "requires root and unattached cpu/memory/freezer subsystems"]
async fn oom_notifier_fires_on_memory_limit() {
    let h = Hierarchy::mount("cpu,memory,freezer");
    cgroups::create(&h.root, "mesos").unwrap();
    cgroups::create(&h.root, "mesos/x").unwrap();

    let limit = 16 * 1024 * 1024u64;
    cgroups::write(&h.root, "mesos/x", "memory.limit_in_bytes", &limit.to_string()).unwrap();

    let notified = tokio::spawn({
        let root = h.root.clone();
        async move { cgroups::listen(&root, "mesos/x", "memory.oom_control", None).await }
    });

    // dd allocates its whole block buffer up front: 64 MiB against a 16 MiB
    // limit is a guaranteed OOM.
    spawn_in_cgroup(
        &h.root,
        "mesos/x",
        "sleep 0.2; dd if=/dev/zero of=/dev/null bs=64M count=1",
    );

    let counter = tokio::time::timeout(Duration::from_secs(5), notified)
        .await
        .expect("OOM notification timed out")
        .unwrap()
        .unwrap();
    assert!(counter >= 1);

    cgroups::destroy(&h.root, "mesos/x", INTERVAL).await.unwrap();
    cgroups::remove(&h.root, "mesos").unwrap();
}

#[tokio::test]
#[ignore = "requires root and unattached cpu/memory/freezer subsystems"]
async fn cancelled_listener_delivers_nothing() {
    let h = Hierarchy::mount("cpu,memory,freezer");
    cgroups::create(&h.root, "mesos").unwrap();
    cgroups::create(&h.root, "mesos/x").unwrap();

    let listener = tokio::spawn({
        let root = h.root.clone();
        async move { cgroups::listen(&root, "mesos/x", "memory.oom_control", None).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Cancel before any event; the eventfd is closed and the destroy below
    // must not be disturbed by the dead registration.
    listener.abort();
    assert!(listener.await.unwrap_err().is_cancelled());

    cgroups::destroy(&h.root, "mesos/x", INTERVAL).await.unwrap();
    cgroups::remove(&h.root, "mesos").unwrap();
}
