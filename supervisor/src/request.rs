use config_loader::MAX_TIMEOUT_SECS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// What the payload of an [`ExecutionRequest`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A block of source text.
    Code,
    /// A single expression whose value is reported.
    Expression,
    /// Path to an existing script file.
    ScriptPath,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Code => "code",
            RequestKind::Expression => "expression",
            RequestKind::ScriptPath => "script",
        };
        f.write_str(name)
    }
}

/// How long a child may run before it is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TimeoutPolicy {
    /// Per-kind default from the environment configuration.
    #[default]
    Default,
    After(Duration),
    Unbounded,
}

impl TimeoutPolicy {
    /// `None` selects the per-kind default. Explicit values must be positive and at
    /// most [`MAX_TIMEOUT_SECS`].
    pub fn from_seconds(seconds: Option<f64>) -> Result<Self, RequestError> {
        match seconds {
            None => Ok(TimeoutPolicy::Default),
            Some(value) if value > 0.0 && value <= MAX_TIMEOUT_SECS => {
                Duration::try_from_secs_f64(value)
                    .map(TimeoutPolicy::After)
                    .map_err(|_| RequestError::InvalidTimeout { value })
            }
            Some(value) => Err(RequestError::InvalidTimeout { value }),
        }
    }

    /// The armed timer length, or `None` when no timer is armed.
    pub fn resolve(self, default: Duration) -> Option<Duration> {
        match self {
            TimeoutPolicy::Default => Some(default),
            TimeoutPolicy::After(duration) => Some(duration),
            TimeoutPolicy::Unbounded => None,
        }
    }
}

/// A single unit of work for the supervisor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub kind: RequestKind,
    pub payload: String,
    pub timeout: TimeoutPolicy,
    pub working_directory: Option<PathBuf>,
    /// Command line arguments, accepted for script runs only.
    pub args: Vec<String>,
    /// Per-request environment overrides, applied over the configured environment.
    pub env: BTreeMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(kind: RequestKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            timeout: TimeoutPolicy::Default,
            working_directory: None,
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn code(code: impl Into<String>) -> Self {
        Self::new(RequestKind::Code, code)
    }

    pub fn expression(expression: impl Into<String>) -> Self {
        Self::new(RequestKind::Expression, expression)
    }

    pub fn script(path: impl Into<String>) -> Self {
        Self::new(RequestKind::ScriptPath, path)
    }

    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Structural checks that need no filesystem access.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.payload.trim().is_empty() {
            return Err(RequestError::EmptyPayload { kind: self.kind });
        }

        if let TimeoutPolicy::After(duration) = self.timeout {
            if duration.is_zero() {
                return Err(RequestError::InvalidTimeout { value: 0.0 });
            }
        }

        if !self.args.is_empty() && self.kind != RequestKind::ScriptPath {
            return Err(RequestError::UnexpectedArgs { kind: self.kind });
        }

        Ok(())
    }
}

/// Reasons a request is rejected before anything is spawned.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Empty {kind}: nothing to execute")]
    EmptyPayload { kind: RequestKind },

    #[error("Timeout must be a positive number of seconds no greater than {max}, got {value}", max = MAX_TIMEOUT_SECS)]
    InvalidTimeout { value: f64 },

    #[error("Arguments are only accepted for script runs, not {kind}")]
    UnexpectedArgs { kind: RequestKind },

    #[error("Script not found: {path}")]
    ScriptNotFound { path: PathBuf },

    #[error("Script is not a regular file: {path}")]
    ScriptNotAFile { path: PathBuf },

    #[error("Script is not readable: {path}: {source}")]
    ScriptUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No packages specified")]
    NoPackages,

    #[error("Invalid package specifier '{name}'")]
    InvalidPackage { name: String },
}
