#![cfg(unix)]

use config_loader::EnvironmentConfig;
use std::fs;
use std::path::Path;
use supervisor::{ExecutionRequest, ExecutionStatus, RequestError, Supervisor};
use tempfile::TempDir;

fn shell_supervisor(scratch: &Path) -> Supervisor {
    let mut config = EnvironmentConfig::for_interpreter("/bin/sh");
    config.scratch_dir = scratch.to_path_buf();
    Supervisor::new(config)
}

fn program_files(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|name| name.starts_with("pyexec_"))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn given_code_printing_text_when_execute_then_success_with_exact_stdout() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());

    let outcome = supervisor
        .execute(ExecutionRequest::code("echo hello\necho world"))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert_eq!(outcome.stdout, "hello\nworld\n");
    assert_eq!(outcome.stderr, "");
    assert_eq!(outcome.line_offset, 0);
    assert!(program_files(scratch.path()).is_empty(), "program file removed");
}

#[tokio::test]
async fn given_exit_2_when_execute_then_non_zero_exit_with_both_streams() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());

    let outcome = supervisor
        .execute(ExecutionRequest::code("echo out\necho err >&2\nexit 2"))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::NonZeroExit { code: 2 });
    assert_eq!(outcome.stdout, "out\n");
    assert_eq!(outcome.stderr, "err\n");
}

#[tokio::test]
async fn given_interleaved_bursts_beyond_pipe_capacity_when_execute_then_no_deadlock() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());
    let code = r#"
i=0
while [ $i -lt 20 ]; do
  head -c 16384 /dev/zero | tr '\0' 'o'
  head -c 16384 /dev/zero | tr '\0' 'e' >&2
  i=$((i+1))
done
"#;

    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(20),
        supervisor.execute(ExecutionRequest::code(code)),
    )
    .await
    .expect("execution must not deadlock")
    .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert_eq!(outcome.stdout.len(), 20 * 16384);
    assert_eq!(outcome.stderr.len(), 20 * 16384);
    assert!(outcome.stdout.bytes().all(|b| b == b'o'));
    assert!(outcome.stderr.bytes().all(|b| b == b'e'));
}

#[tokio::test]
async fn given_two_concurrent_runs_when_execute_then_outputs_do_not_mix() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());
    let loop_of = |marker: &str| {
        format!(
            "i=0\nwhile [ $i -lt 200 ]; do echo {marker}; i=$((i+1)); done\n",
            marker = marker
        )
    };

    let (a, b) = tokio::join!(
        supervisor.execute(ExecutionRequest::code(loop_of("AAAA"))),
        supervisor.execute(ExecutionRequest::code(loop_of("BBBB"))),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.stdout, "AAAA\n".repeat(200));
    assert_eq!(b.stdout, "BBBB\n".repeat(200));
}

#[tokio::test]
async fn given_missing_script_when_execute_then_invalid_request_and_nothing_spawned() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());
    let missing = scratch.path().join("missing.py");

    let result = supervisor
        .execute(ExecutionRequest::script(missing.to_string_lossy()))
        .await;

    assert!(matches!(result, Err(RequestError::ScriptNotFound { .. })));
    assert!(program_files(scratch.path()).is_empty());
}

#[tokio::test]
async fn given_blank_code_when_execute_then_invalid_request() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());

    let result = supervisor.execute(ExecutionRequest::code("   \n")).await;

    assert!(matches!(result, Err(RequestError::EmptyPayload { .. })));
}

#[tokio::test]
async fn given_script_with_args_when_execute_then_runs_in_place_from_its_directory() {
    let scratch = TempDir::new().unwrap();
    let scripts = TempDir::new().unwrap();
    let script = scripts.path().join("job.sh");
    fs::write(&script, "echo \"args:$1,$2\"\npwd -P\n").unwrap();
    let supervisor = shell_supervisor(scratch.path());

    let outcome = supervisor
        .execute(ExecutionRequest::script(script.to_string_lossy()).with_args(["one", "two words"]))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    let expected_dir = fs::canonicalize(scripts.path()).unwrap();
    assert_eq!(
        outcome.stdout,
        format!("args:one,two words\n{}\n", expected_dir.display())
    );
}

#[tokio::test]
async fn given_missing_working_directory_when_execute_then_it_is_created() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());
    let work = scratch.path().join("nested").join("work");

    let outcome = supervisor
        .execute(ExecutionRequest::code("pwd -P").with_working_directory(&work))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    let expected = fs::canonicalize(&work).unwrap();
    assert_eq!(outcome.stdout.trim_end(), expected.to_string_lossy());
}

#[tokio::test]
async fn given_config_and_request_env_when_execute_then_request_wins() {
    let scratch = TempDir::new().unwrap();
    let mut config = EnvironmentConfig::for_interpreter("/bin/sh");
    config.scratch_dir = scratch.path().to_path_buf();
    config.env.insert("PYEXEC_A".into(), "config".into());
    config.env.insert("PYEXEC_B".into(), "config".into());
    let supervisor = Supervisor::new(config);

    let outcome = supervisor
        .execute(ExecutionRequest::code("echo \"$PYEXEC_A $PYEXEC_B\"").with_env("PYEXEC_B", "request"))
        .await
        .unwrap();

    assert_eq!(outcome.stdout, "config request\n");
}

#[tokio::test]
async fn given_child_reading_stdin_when_execute_then_it_sees_end_of_input() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());

    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        supervisor.execute(ExecutionRequest::code("cat\necho done")),
    )
    .await
    .expect("stdin must not block")
    .unwrap();

    assert_eq!(outcome.stdout, "done\n");
}

#[tokio::test]
async fn given_output_over_limit_when_execute_then_truncated_and_child_not_blocked() {
    let scratch = TempDir::new().unwrap();
    let mut config = EnvironmentConfig::for_interpreter("/bin/sh");
    config.scratch_dir = scratch.path().to_path_buf();
    config.max_output_bytes = 1024;
    let supervisor = Supervisor::new(config);

    let outcome = supervisor
        .execute(ExecutionRequest::code("head -c 200000 /dev/zero | tr '\\0' 'x'\necho tail >&2"))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert_eq!(outcome.stdout.len(), 1024);
    assert!(outcome.stdout_truncated);
    assert!(!outcome.stderr_truncated);
    assert_eq!(outcome.stderr, "tail\n");
}

#[tokio::test]
async fn given_invalid_utf8_when_execute_then_replacement_characters() {
    let scratch = TempDir::new().unwrap();
    let supervisor = shell_supervisor(scratch.path());

    let outcome = supervisor
        .execute(ExecutionRequest::code("printf '\\377ok\\r\\n'"))
        .await
        .unwrap();

    assert_eq!(outcome.stdout, "\u{FFFD}ok\n");
}

#[tokio::test]
async fn given_prelude_when_execute_code_then_line_offset_reported() {
    let scratch = TempDir::new().unwrap();
    let mut config = EnvironmentConfig::for_interpreter("/bin/sh");
    config.scratch_dir = scratch.path().to_path_buf();
    config.setup_prelude = Some("# setup\nPYEXEC_READY=yes\n".to_string());
    let supervisor = Supervisor::new(config);

    let outcome = supervisor
        .execute(ExecutionRequest::code("echo $PYEXEC_READY"))
        .await
        .unwrap();

    assert_eq!(outcome.line_offset, 2);
    assert_eq!(outcome.stdout, "yes\n");
}

#[tokio::test]
async fn given_missing_interpreter_when_execute_then_spawn_failed_without_output() {
    let scratch = TempDir::new().unwrap();
    let mut config = EnvironmentConfig::for_interpreter(scratch.path().join("no-such-python"));
    config.scratch_dir = scratch.path().to_path_buf();
    let supervisor = Supervisor::new(config);

    let outcome = supervisor
        .execute(ExecutionRequest::code("print('never')"))
        .await
        .unwrap();

    assert!(matches!(outcome.status, ExecutionStatus::SpawnFailed { .. }));
    assert!(outcome.stdout.is_empty() && outcome.stderr.is_empty());
    assert!(program_files(scratch.path()).is_empty());
}
