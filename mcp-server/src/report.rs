//! Human readable reports returned as tool results.

use std::fmt::Write;
use std::time::Duration;
use supervisor::{ExecutionOutcome, ExecutionStatus, InstalledPackage, PackageError, RequestError};

/// Report for a code run.
pub fn execution_report(outcome: &ExecutionOutcome) -> String {
    let mut out = String::from("=== Execution Result ===\n");
    push_exit_code(&mut out, outcome);
    out.push('\n');
    push_streams(&mut out, outcome);
    out.push('\n');
    out.push_str(&verdict("Execution", outcome));
    push_footer(&mut out, outcome);
    out
}

/// Report for a script run.
pub fn script_report(script: &str, args: &[String], outcome: &ExecutionOutcome) -> String {
    let mut out = String::from("=== Script Execution ===\n");
    let _ = writeln!(out, "Script: {}", script);
    let _ = writeln!(out, "Args: {:?}", args);
    push_exit_code(&mut out, outcome);
    out.push('\n');
    push_streams(&mut out, outcome);
    out.push('\n');
    out.push_str(&verdict("Script", outcome));
    push_footer(&mut out, outcome);
    out
}

/// Report for an expression evaluation.
pub fn eval_report(expression: &str, outcome: &ExecutionOutcome) -> String {
    if outcome.is_success() {
        let mut out = String::from("=== Expression Evaluation ===\n");
        let _ = writeln!(out, "Expression: {}", expression);
        let _ = writeln!(out, "Result: {}", outcome.stdout);
        let _ = write!(
            out,
            "Type: {}",
            outcome.value_type.as_deref().unwrap_or("unknown")
        );
        push_footer(&mut out, outcome);
        return out;
    }

    let error = match &outcome.status {
        ExecutionStatus::NonZeroExit { .. } => outcome.stderr.trim_end().to_string(),
        _ => verdict("Evaluation", outcome)
            .trim_start_matches("✗ ")
            .to_string(),
    };
    let mut out = format!("Error evaluating expression:\n{}\n\nError: {}\n", expression, error);
    if !outcome.stdout.is_empty() {
        let _ = write!(out, "\n=== STDOUT ===\n{}\n", outcome.stdout);
    }
    push_footer(&mut out, outcome);
    out
}

/// Report for a package installation.
pub fn install_report(command_line: &str, outcome: &ExecutionOutcome) -> String {
    let mut out = String::from("=== Package Installation ===\n");
    let _ = writeln!(out, "Command: {}", command_line);
    out.push('\n');
    out.push_str(&outcome.stdout);
    if !outcome.stderr.is_empty() {
        let _ = write!(out, "\n=== STDERR ===\n{}", outcome.stderr);
    }
    out.push_str("\n\n");
    out.push_str(&verdict("Installation", outcome));
    push_footer(&mut out, outcome);
    out
}

/// Table of installed packages.
pub fn packages_report(packages: &[InstalledPackage]) -> String {
    let mut out = String::from("=== Installed Python Packages ===\n\n");
    let _ = writeln!(out, "{:<30} Version", "Package");
    out.push_str(&"=".repeat(50));
    out.push('\n');
    for package in packages {
        let _ = writeln!(out, "{:<30} {}", package.name, package.version);
    }
    let _ = write!(out, "\nTotal: {} packages", packages.len());
    out
}

pub fn listing_error_report(error: &PackageError) -> String {
    match error {
        PackageError::ListingFailed { status, stderr } if !stderr.is_empty() => {
            format!("Error listing packages ({}):\n{}", status, stderr)
        }
        other => format!("Error listing packages:\n{}", other),
    }
}

/// Text for a request rejected before anything ran.
pub fn invalid_request_report(error: &RequestError) -> String {
    format!("Error: {}", error)
}

fn push_exit_code(out: &mut String, outcome: &ExecutionOutcome) {
    match outcome.status.exit_code() {
        Some(code) => {
            let _ = writeln!(out, "Exit Code: {}", code);
        }
        None => {
            let _ = writeln!(out, "Exit Code: none ({})", outcome.status);
        }
    }
}

fn push_streams(out: &mut String, outcome: &ExecutionOutcome) {
    if !outcome.stdout.is_empty() {
        let _ = writeln!(out, "=== STDOUT ===\n{}", outcome.stdout);
        if outcome.stdout_truncated {
            out.push_str("[stdout truncated]\n");
        }
    }
    if !outcome.stderr.is_empty() {
        let _ = writeln!(out, "=== STDERR ===\n{}", outcome.stderr);
        if outcome.stderr_truncated {
            out.push_str("[stderr truncated]\n");
        }
    }
}

fn verdict(noun: &str, outcome: &ExecutionOutcome) -> String {
    match &outcome.status {
        ExecutionStatus::Success => format!("✓ {} completed successfully", noun),
        ExecutionStatus::NonZeroExit { code } => {
            format!("✗ {} failed with exit code {}", noun, code)
        }
        ExecutionStatus::TimedOut => match outcome.timeout() {
            Some(timeout) => format!("✗ {} timed out after {} seconds", noun, seconds(timeout)),
            None => format!("✗ {} timed out", noun),
        },
        ExecutionStatus::Killed => format!("✗ {} was cancelled", noun),
        ExecutionStatus::SpawnFailed { reason } => {
            format!("✗ {} could not start: {}", noun, reason)
        }
    }
}

fn push_footer(out: &mut String, outcome: &ExecutionOutcome) {
    if matches!(outcome.status, ExecutionStatus::SpawnFailed { .. }) {
        return;
    }
    let duration = Duration::from_millis(outcome.duration_millis);
    let _ = write!(out, "\nDuration: {}", humantime::format_duration(duration));
    if outcome.line_offset > 0 {
        let _ = write!(
            out,
            "\nLine offset: {} (subtract from traceback line numbers)",
            outcome.line_offset
        );
    }
}

fn seconds(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{}", duration.as_secs_f64())
    }
}
