//! Execution supervisor.
//!
//! Accepts [`ExecutionRequest`]s, runs each one in a fresh interpreter process and
//! returns an [`ExecutionOutcome`] with everything the child wrote, how it ended and
//! how long it took. Each request owns its child, two reader tasks and one timer;
//! nothing is shared between requests except the immutable configuration.

use chrono::Utc;
use config_loader::EnvironmentConfig;
use std::ffi::OsString;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tracing::{info, instrument, warn};

pub mod collector;
pub mod launcher;
pub mod lifecycle;
pub mod outcome;
pub mod packages;
pub mod payload;
pub mod render;
pub mod request;

pub use collector::{decode_output, CapturedOutput, StreamCapture, StreamCollector};
pub use launcher::{platform_launcher, LaunchError, LaunchSpec, ProcessLauncher};
pub use lifecycle::{
    cancellation, CancelHandle, Cancellation, ChildProcessHandle, LifecycleState, Termination,
    DRAIN_WINDOW, GRACE_PERIOD,
};
pub use outcome::{ExecutionOutcome, ExecutionStatus};
pub use packages::{InstallRequest, InstalledPackage, PackageError, PackageManager, PipPackageManager};
pub use payload::{Payload, PayloadSource};
pub use render::Renderable;
pub use request::{ExecutionRequest, RequestError, RequestKind, TimeoutPolicy};

use outcome::RunContext;

/// Runs requests against one immutable environment configuration.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: Arc<EnvironmentConfig>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl Supervisor {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self::with_launcher(config, platform_launcher())
    }

    pub fn with_launcher(config: EnvironmentConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            config: Arc::new(config),
            launcher,
        }
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn default_timeout(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Code => self.config.timeouts.code(),
            RequestKind::Expression => self.config.timeouts.expression(),
            RequestKind::ScriptPath => self.config.timeouts.script(),
        }
    }

    /// Run `request` to completion with no caller cancellation.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, RequestError> {
        self.execute_with_cancel(request, Cancellation::never()).await
    }

    /// Run `request`, terminating the child if `cancellation` fires first.
    ///
    /// Invalid requests are rejected before anything is spawned. Every other failure,
    /// including the interpreter not starting, is reported through the outcome.
    #[instrument(skip_all, fields(kind = %request.kind))]
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancellation: Cancellation,
    ) -> Result<ExecutionOutcome, RequestError> {
        let payload = payload::build(&request, &self.config)?;
        let timeout = request.timeout.resolve(self.default_timeout(request.kind));

        let program = match payload.materialize(&self.config.scratch_dir) {
            Ok(program) => program,
            Err(err) => {
                warn!(error = %err, scratch_dir = %self.config.scratch_dir.display(), "Cannot write program file");
                return Ok(ExecutionOutcome::spawn_failed(
                    format!("cannot write program file: {}", err),
                    Utc::now(),
                ));
            }
        };

        let mut args: Vec<OsString> = vec![program.path().as_os_str().to_os_string()];
        args.extend(payload.args.iter().map(OsString::from));

        let mut env = self.config.env.clone();
        env.extend(request.env.clone());

        let spec = LaunchSpec {
            program: self.config.interpreter.clone(),
            args,
            working_dir: payload.working_dir.clone(),
            env,
        };
        let context = RunContext {
            kind: payload.kind,
            line_offset: payload.line_offset,
            timeout,
            started_at: Utc::now(),
        };

        Ok(self
            .run(spec, program.into_temp_path(), context, cancellation)
            .await)
    }

    /// Run the interpreter with `args` in the scratch directory.
    ///
    /// Used for interpreter-level commands such as package management; they share the
    /// launch, collection and lifecycle pipeline with ordinary requests.
    pub async fn run_interpreter(
        &self,
        args: Vec<String>,
        timeout: Option<Duration>,
        cancellation: Cancellation,
    ) -> ExecutionOutcome {
        let spec = LaunchSpec {
            program: self.config.interpreter.clone(),
            args: args.into_iter().map(OsString::from).collect(),
            working_dir: self.config.scratch_dir.clone(),
            env: self.config.env.clone(),
        };
        let context = RunContext {
            kind: RequestKind::Code,
            line_offset: 0,
            timeout,
            started_at: Utc::now(),
        };
        self.run(spec, None, context, cancellation).await
    }

    async fn run(
        &self,
        spec: LaunchSpec,
        program: Option<TempPath>,
        context: RunContext,
        cancellation: Cancellation,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let launched = match self.launcher.launch(&spec) {
            Ok(launched) => launched,
            Err(err) => {
                warn!(error = %err, "Launch failed");
                return ExecutionOutcome::spawn_failed(err.to_string(), context.started_at);
            }
        };

        let handle = ChildProcessHandle::new(launched.child, started, program);
        info!(
            pid = handle.id(),
            timeout = ?context.timeout,
            working_dir = %spec.working_dir.display(),
            "Execution started"
        );

        let collector = StreamCollector::start(
            launched.stdout,
            launched.stderr,
            self.config.max_output_bytes,
        );
        let supervised = lifecycle::supervise(
            self.launcher.as_ref(),
            handle,
            collector,
            context.timeout,
            cancellation,
        )
        .await;

        let outcome = outcome::format_outcome(supervised, &context);
        info!(
            status = %outcome.status,
            duration_ms = outcome.duration_millis,
            stdout_bytes = outcome.stdout.len(),
            stderr_bytes = outcome.stderr.len(),
            "Execution finished"
        );
        outcome
    }
}
