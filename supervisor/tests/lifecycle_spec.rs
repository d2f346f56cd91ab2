#![cfg(unix)]

use config_loader::EnvironmentConfig;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use supervisor::{
    cancellation, ExecutionRequest, ExecutionStatus, Supervisor, TimeoutPolicy, GRACE_PERIOD,
};
use tempfile::TempDir;

fn shell_supervisor(scratch: &Path) -> Supervisor {
    let mut config = EnvironmentConfig::for_interpreter("/bin/sh");
    config.scratch_dir = scratch.to_path_buf();
    Supervisor::new(config)
}

fn process_exists(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Like [`process_exists`], but a zombie waiting for its new parent to reap it
/// counts as gone.
fn process_running(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .map_or(false, |state| state != 'Z' && state != 'X'),
        Err(_) if Path::new("/proc/self/stat").exists() => false,
        Err(_) => process_exists(pid),
    }
}

async fn eventually_gone(pid: i32) -> bool {
    for _ in 0..40 {
        if !process_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn read_pid(path: &Path) -> i32 {
    fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

#[tokio::test]
async fn given_sleep_past_timeout_when_execute_then_timed_out_and_child_gone() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());
    let pid_file = scratch.path().join("child.pid");
    let code = format!("echo $$ > '{}'\necho started\nsleep 30\n", pid_file.display());

    let started = Instant::now();
    let outcome = supervisor
        .execute(
            ExecutionRequest::code(code)
                .with_timeout(TimeoutPolicy::After(Duration::from_secs(1))),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, ExecutionStatus::TimedOut);
    assert_eq!(outcome.stdout, "started\n");
    assert_eq!(outcome.timeout(), Some(Duration::from_secs(1)));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(1) + GRACE_PERIOD + Duration::from_secs(2));
    assert!(!process_exists(read_pid(&pid_file)));
}

#[tokio::test]
async fn given_child_ignoring_sigterm_when_timed_out_then_killed_after_grace_period() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());
    let pid_file = scratch.path().join("stubborn.pid");
    let code = format!(
        "trap '' TERM\necho $$ > '{}'\nsleep 30\n",
        pid_file.display()
    );

    let outcome = supervisor
        .execute(
            ExecutionRequest::code(code)
                .with_timeout(TimeoutPolicy::After(Duration::from_secs(1))),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::TimedOut);
    let waited = Duration::from_millis(outcome.duration_millis);
    assert!(waited >= Duration::from_secs(1) + GRACE_PERIOD - Duration::from_millis(200));
    assert!(waited < Duration::from_secs(1) + GRACE_PERIOD + Duration::from_secs(2));
    assert!(!process_exists(read_pid(&pid_file)));
}

#[tokio::test]
async fn given_group_member_ignoring_sigterm_when_leader_exits_in_grace_then_member_killed() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());
    let pid_file = scratch.path().join("member.pid");
    let code = format!(
        "sh -c 'trap \"\" TERM; echo $$ > \"{}\"; exec sleep 30' &\nsleep 30\n",
        pid_file.display()
    );

    let outcome = supervisor
        .execute(
            ExecutionRequest::code(code)
                .with_timeout(TimeoutPolicy::After(Duration::from_secs(1))),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::TimedOut);
    // The leader obeyed SIGTERM, so no grace period was spent waiting on it
    assert!(Duration::from_millis(outcome.duration_millis) < Duration::from_secs(1) + GRACE_PERIOD);
    assert!(eventually_gone(read_pid(&pid_file)).await);
}

#[tokio::test]
async fn given_caller_cancellation_when_running_then_killed_with_partial_output() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());
    let (handle, cancel) = cancellation();

    let request = ExecutionRequest::code("echo partial\nsleep 30")
        .with_timeout(TimeoutPolicy::Unbounded);
    let (outcome, _) = tokio::join!(
        supervisor.execute_with_cancel(request, cancel),
        async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            handle.cancel();
        }
    );
    let outcome = outcome.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Killed);
    assert_eq!(outcome.stdout, "partial\n");
    assert!(outcome.duration_millis < 5000);
    assert_eq!(outcome.timeout(), None);
}

#[tokio::test]
async fn given_background_descendant_holding_pipe_when_child_exits_then_result_is_bounded() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());

    let started = Instant::now();
    let outcome = supervisor
        .execute(ExecutionRequest::code("echo parent\n(sleep 30) &\nexit 0"))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert_eq!(outcome.stdout, "parent\n");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn given_child_killed_by_signal_when_execute_then_exit_code_is_128_plus_signal() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());

    let outcome = supervisor
        .execute(ExecutionRequest::code("kill -9 $$"))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::NonZeroExit { code: 137 });
}
