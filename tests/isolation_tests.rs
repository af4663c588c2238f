//! Integration tests for the isolation coordinator
//!
//! The full-lifecycle tests mount a private hierarchy and therefore need
//! root plus unattached cpu/memory/freezer subsystems; they are marked
//! #[ignore] and run with `cargo test -- --ignored` on a dedicated machine.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use cgwarden::cgroups;
use cgwarden::isolation::{
    ExecutorId, ExecutorInfo, ExecutorLauncher, FrameworkId, FrameworkInfo, Isolator,
    IsolatorConfig, IsolatorEvent, Resource,
};

/// Launches executors by handing the command line to `sh`. Reaping is the
/// agent's business, so tests wire the exit notification themselves.
struct ShellLauncher;

impl ExecutorLauncher for ShellLauncher {
    fn launch(
        &self,
        _framework_id: &FrameworkId,
        _framework_info: &FrameworkInfo,
        executor_info: &ExecutorInfo,
        directory: &Path,
    ) -> io::Result<i32> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&executor_info.command)
            .current_dir(directory)
            .spawn()?;
        Ok(child.id() as i32)
    }
}

fn test_config() -> IsolatorConfig {
    IsolatorConfig {
        hierarchy: PathBuf::from(format!("/tmp/cgwarden-isolation-{}", std::process::id())),
        subsystems: "cpu,memory,freezer".to_string(),
        root: "mesos".to_string(),
        polling_interval: Duration::from_millis(100),
    }
}

fn executor(id: &str, command: &str) -> ExecutorInfo {
    ExecutorInfo {
        executor_id: ExecutorId::from(id),
        command: command.to_string(),
    }
}

async fn next_event(events: &mut UnboundedReceiver<IsolatorEvent>) -> IsolatorEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for an isolator event")
        .expect("isolator event channel closed")
}

#[tokio::test]
#[ignore = "requires root and unattached cpu/memory/freezer subsystems"]
async fn kill_executor_destroys_its_cgroup() {
    let config = test_config();
    let hierarchy = config.hierarchy.clone();
    let (isolator, mut events) = Isolator::start(
        config,
        vec![Resource::new("cpus", 4.0), Resource::new("mem", 4096.0)],
        true,
        Box::new(ShellLauncher),
    )
    .unwrap();

    let framework = FrameworkId::from("f1");
    let workdir = tempfile::tempdir().unwrap();
    isolator.launch_executor(
        framework.clone(),
        FrameworkInfo::default(),
        executor("e1", "sleep 1000"),
        workdir.path(),
        vec![Resource::new("cpus", 0.5), Resource::new("mem", 64.0)],
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    isolator.kill_executor(framework.clone(), ExecutorId::from("e1"));

    match next_event(&mut events).await {
        IsolatorEvent::ExecutorTerminated {
            framework_id,
            executor_id,
            destroyed,
            reason,
            ..
        } => {
            assert_eq!(framework_id, framework);
            assert_eq!(executor_id, ExecutorId::from("e1"));
            assert!(destroyed);
            assert_eq!(reason, "executor killed");
        }
    }

    // The executor's cgroup is gone; only the umbrella remains.
    assert!(cgroups::get(&hierarchy, "mesos").unwrap().is_empty());

    cgroups::remove(&hierarchy, "mesos").unwrap();
    cgroups::unmount(&hierarchy).unwrap();
}

#[tokio::test]
#[ignore = "requires root and unattached cpu/memory/freezer subsystems"]
async fn spontaneous_exit_cleans_up_without_destroyed_flag() {
    let config = test_config();
    let hierarchy = config.hierarchy.clone();
    let (isolator, mut events) =
        Isolator::start(config, vec![], true, Box::new(ShellLauncher)).unwrap();

    let framework = FrameworkId::from("f1");
    let workdir = tempfile::tempdir().unwrap();
    isolator.launch_executor(
        framework.clone(),
        FrameworkInfo::default(),
        executor("e1", "exit 7"),
        workdir.path(),
        vec![],
    );

    // Let the executor exit, then deliver the reaper notification. The test
    // does not know the PID, so it reaps whatever sh left behind by waiting
    // for the cgroup to drain first.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let pid = wait_for_reaped_child();
    isolator.process_exited(pid, 7);

    match next_event(&mut events).await {
        IsolatorEvent::ExecutorTerminated {
            destroyed,
            reason,
            status,
            ..
        } => {
            assert!(!destroyed);
            assert_eq!(reason, "executor exited");
            assert_eq!(status, Some(7));
        }
    }

    assert!(cgroups::get(&hierarchy, "mesos").unwrap().is_empty());

    cgroups::remove(&hierarchy, "mesos").unwrap();
    cgroups::unmount(&hierarchy).unwrap();
}

#[tokio::test]
#[ignore = "requires root and unattached cpu/memory/freezer subsystems"]
async fn duplicate_launch_is_rejected() {
    let config = test_config();
    let hierarchy = config.hierarchy.clone();
    let (isolator, mut events) =
        Isolator::start(config, vec![], true, Box::new(ShellLauncher)).unwrap();

    let framework = FrameworkId::from("f1");
    let workdir = tempfile::tempdir().unwrap();
    for _ in 0..2 {
        isolator.launch_executor(
            framework.clone(),
            FrameworkInfo::default(),
            executor("e1", "sleep 1000"),
            workdir.path(),
            vec![],
        );
    }

    match next_event(&mut events).await {
        IsolatorEvent::ExecutorTerminated { reason, .. } => {
            assert_eq!(reason, "executor already launched");
        }
    }

    isolator.kill_executor(framework, ExecutorId::from("e1"));
    next_event(&mut events).await;

    cgroups::remove(&hierarchy, "mesos").unwrap();
    cgroups::unmount(&hierarchy).unwrap();
}

#[tokio::test]
#[ignore = "requires root and unattached cpu/memory/freezer subsystems"]
async fn oom_terminates_the_executor() {
    let config = test_config();
    let hierarchy = config.hierarchy.clone();
    let (isolator, mut events) =
        Isolator::start(config, vec![], true, Box::new(ShellLauncher)).unwrap();

    let framework = FrameworkId::from("f1");
    let workdir = tempfile::tempdir().unwrap();
    isolator.launch_executor(
        framework.clone(),
        FrameworkInfo::default(),
        executor(
            "e1",
            "sleep 0.5; dd if=/dev/zero of=/dev/null bs=64M count=1; sleep 1000",
        ),
        workdir.path(),
        vec![Resource::new("mem", 16.0)],
    );

    match next_event(&mut events).await {
        IsolatorEvent::ExecutorTerminated {
            destroyed, reason, ..
        } => {
            assert!(destroyed);
            assert_eq!(reason, "memory limit exceeded");
        }
    }

    assert!(cgroups::get(&hierarchy, "mesos").unwrap().is_empty());

    cgroups::remove(&hierarchy, "mesos").unwrap();
    cgroups::unmount(&hierarchy).unwrap();
}

/// Reap one exited child of this test process and return its PID.
fn wait_for_reaped_child() -> i32 {
    use nix::sys::wait::{waitpid, WaitStatus};

    match waitpid(None, None).expect("waitpid failed") {
        WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => pid.as_raw(),
        other => panic!("unexpected wait status: {other:?}"),
    }
}
