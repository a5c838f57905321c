//! Process sandbox lifecycle: timeouts, stubborn descendants, temp files and
//! cancellation, exercised with real `sh` process trees.

#![cfg(target_os = "linux")]

use std::path::Path;
use std::time::{Duration, Instant};

use prover_eval::sandbox::{
    ProcessRegistry, ProcessSandbox, SandboxConfig, SandboxRequest, StagedInput, TerminationReason,
};
use tempfile::TempDir;

fn sandbox(registry: ProcessRegistry) -> ProcessSandbox {
    ProcessSandbox::new(
        SandboxConfig::new().with_grace_period(Duration::from_millis(300)),
        registry,
    )
}

fn sh(dir: &Path, script: &str, timeout: Duration) -> SandboxRequest {
    SandboxRequest::new("sh", dir, timeout).with_args(["-c", script])
}

/// Waits for a pid written by the child script.
async fn read_pid(path: &Path) -> i32 {
    for _ in 0..100 {
        if let Ok(text) = std::fs::read_to_string(path) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pid file {} never appeared", path.display());
}

/// Gone from the process table, or a zombie awaiting reaping.
fn is_dead(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z" || state == "X"),
    }
}

async fn wait_dead(pid: i32) -> bool {
    for _ in 0..50 {
        if is_dead(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    false
}

fn staged_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("pe_"))
        .collect()
}

#[tokio::test]
async fn test_timeout_kills_sleeping_process() {
    let dir = TempDir::new().unwrap();
    let sb = sandbox(ProcessRegistry::new());

    let start = Instant::now();
    let out = sb.run(&sh(dir.path(), "sleep 5", Duration::from_secs(1))).await.unwrap();

    assert_eq!(out.termination, TerminationReason::TimedOut);
    assert!(out.timed_out());
    assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
    assert!(sb.registry().live_groups().is_empty());
}

#[tokio::test]
async fn test_descendant_ignoring_sigterm_is_killed() {
    let dir = TempDir::new().unwrap();
    let sb = sandbox(ProcessRegistry::new());
    let script = "trap '' TERM; (trap '' TERM; sleep 30) & echo $! > child.pid; wait; sleep 30";

    let start = Instant::now();
    let out = sb.run(&sh(dir.path(), script, Duration::from_secs(1))).await.unwrap();
    assert!(out.timed_out());
    assert!(start.elapsed() < Duration::from_secs(4), "took {:?}", start.elapsed());

    let pid = read_pid(&dir.path().join("child.pid")).await;
    assert!(wait_dead(pid).await, "descendant {} survived teardown", pid);
}

#[tokio::test]
async fn test_background_child_swept_after_clean_exit() {
    let dir = TempDir::new().unwrap();
    let sb = sandbox(ProcessRegistry::new());
    let script = "sleep 30 > /dev/null 2>&1 & echo $! > bg.pid; echo done";

    let out = sb.run(&sh(dir.path(), script, Duration::from_secs(10))).await.unwrap();
    assert!(out.success());
    assert_eq!(out.stdout.trim(), "done");

    let pid = read_pid(&dir.path().join("bg.pid")).await;
    assert!(wait_dead(pid).await, "background process {} outlived the run", pid);
}

#[tokio::test]
async fn test_staged_files_removed_on_every_path() {
    let dir = TempDir::new().unwrap();
    let sb = sandbox(ProcessRegistry::new());
    let input = || StagedInput::new("theorem t : True := trivial", "s0_p1_a0", ".lean");

    let ok = SandboxRequest::new("sh", dir.path(), Duration::from_secs(5))
        .with_args(["-c", "cat \"$0\"", "{input}"])
        .with_input(input());
    let out = sb.run(&ok).await.unwrap();
    assert!(out.stdout.contains("trivial"));

    let fail = SandboxRequest::new("sh", dir.path(), Duration::from_secs(5))
        .with_args(["-c", "exit 3", "{input}"])
        .with_input(input());
    assert_eq!(sb.run(&fail).await.unwrap().exit_code, Some(3));

    let slow = SandboxRequest::new("sh", dir.path(), Duration::from_secs(1))
        .with_args(["-c", "sleep 10", "{input}"])
        .with_input(input());
    assert!(sb.run(&slow).await.unwrap().timed_out());

    assert!(staged_files(dir.path()).is_empty(), "left {:?}", staged_files(dir.path()));
}

#[tokio::test]
async fn test_cancellation_tears_down_running_group() {
    let dir = TempDir::new().unwrap();
    let registry = ProcessRegistry::new();
    let sb = sandbox(registry.clone());

    let canceller = registry.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    let request = SandboxRequest::new("sh", dir.path(), Duration::from_secs(30))
        .with_args(["-c", "echo $$ > leader.pid; sleep 30", "{input}"])
        .with_input(StagedInput::new("x", "cancel", ".lean"));
    let out = sb.run(&request).await.unwrap();

    assert!(out.cancelled());
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(registry.live_groups().is_empty());
    let pid = read_pid(&dir.path().join("leader.pid")).await;
    assert!(wait_dead(pid).await);
    assert!(staged_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_dropped_run_kills_group() {
    let dir = TempDir::new().unwrap();
    let registry = ProcessRegistry::new();
    let sb = sandbox(registry.clone());

    let request = SandboxRequest::new("sh", dir.path(), Duration::from_secs(30))
        .with_args(["-c", "echo $$ > leader.pid; sleep 30", "{input}"])
        .with_input(StagedInput::new("x", "dropped", ".lean"));
    let res = tokio::time::timeout(Duration::from_millis(500), sb.run(&request)).await;
    assert!(res.is_err(), "run should still be in progress");

    let pid = read_pid(&dir.path().join("leader.pid")).await;
    assert!(wait_dead(pid).await, "leader {} survived a dropped run", pid);
    assert!(registry.live_groups().is_empty());
    assert!(staged_files(dir.path()).is_empty(), "left {:?}", staged_files(dir.path()));
}

#[tokio::test]
async fn test_concurrent_runs_use_distinct_files() {
    let dir = TempDir::new().unwrap();
    let sb = sandbox(ProcessRegistry::new());
    let request = |label: &str| {
        SandboxRequest::new("sh", dir.path(), Duration::from_secs(5))
            .with_args(["-c", "cat \"$0\"", "{input}"])
            .with_input(StagedInput::new(label.to_string(), label, ".lean"))
    };

    let (first, second) = (request("s0_p_a0"), request("s1_p_a0"));
    let (a, b) = tokio::join!(sb.run(&first), sb.run(&second));
    assert_eq!(a.unwrap().stdout, "s0_p_a0");
    assert_eq!(b.unwrap().stdout, "s1_p_a0");
    assert!(staged_files(dir.path()).is_empty());
}
