//! Execution outcomes and the mapping from terminal state to outcome.

use crate::lifecycle::{Supervised, Termination};
use crate::render::extract_value;
use crate::request::RequestKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    NonZeroExit { code: i32 },
    TimedOut,
    Killed,
    SpawnFailed { reason: String },
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }

    /// Exit code of a child that exited by itself.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionStatus::Success => Some(0),
            ExecutionStatus::NonZeroExit { code } => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::NonZeroExit { code } => write!(f, "exit code {}", code),
            ExecutionStatus::TimedOut => write!(f, "timed out"),
            ExecutionStatus::Killed => write!(f, "killed"),
            ExecutionStatus::SpawnFailed { reason } => write!(f, "spawn failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration_millis: u64,
    pub line_offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    /// Timer that was armed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_millis: Option<u64>,
    pub started_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn spawn_failed(reason: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::SpawnFailed {
                reason: reason.into(),
            },
            stdout: String::new(),
            stderr: String::new(),
            duration_millis: 0,
            line_offset: 0,
            value_type: None,
            stdout_truncated: false,
            stderr_truncated: false,
            timeout_millis: None,
            started_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_millis.map(Duration::from_millis)
    }
}

/// Inputs the formatter needs besides the supervised run itself.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub kind: RequestKind,
    pub line_offset: usize,
    pub timeout: Option<Duration>,
    pub started_at: DateTime<Utc>,
}

/// Map a terminal state and its captured output to an outcome.
pub fn format_outcome(supervised: Supervised, context: &RunContext) -> ExecutionOutcome {
    let status = match supervised.termination {
        Termination::Exited { code: 0 } => ExecutionStatus::Success,
        Termination::Exited { code } => ExecutionStatus::NonZeroExit { code },
        Termination::TimedOut => ExecutionStatus::TimedOut,
        Termination::Killed => ExecutionStatus::Killed,
    };

    let mut stdout = supervised.output.stdout.decode();
    let stderr = supervised.output.stderr.decode();
    let mut value_type = None;

    if context.kind == RequestKind::Expression {
        if let Some((printed, value)) = extract_value(&stdout) {
            value_type = Some(value.type_name().to_string());
            stdout = printed + &value.render();
        }
    }

    ExecutionOutcome {
        status,
        stdout,
        stderr,
        duration_millis: supervised.elapsed.as_millis() as u64,
        line_offset: context.line_offset,
        value_type,
        stdout_truncated: supervised.output.stdout.truncated,
        stderr_truncated: supervised.output.stderr.truncated,
        timeout_millis: context.timeout.map(|t| t.as_millis() as u64),
        started_at: context.started_at,
    }
}
