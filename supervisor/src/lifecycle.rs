//! Lifecycle control: timeout, caller cancellation and termination escalation.
//!
//! A child moves from `Running` to exactly one of `Completed`, `TimedOut` or `Killed`.
//! Leaving `Running` other than by exiting means a graceful request, the
//! [`GRACE_PERIOD`], then a forceful kill. The child is always reaped before
//! [`supervise`] returns.

use crate::collector::{CapturedOutput, StreamCollector};
use crate::launcher::ProcessLauncher;
use std::future;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Time between the graceful termination request and the forceful kill.
pub const GRACE_PERIOD: Duration = Duration::from_secs(3);

/// How long output may stay open after the child exited on its own.
pub const DRAIN_WINDOW: Duration = Duration::from_secs(2);

/// How long output may stay open after the child was terminated.
pub const KILL_DRAIN_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Completed,
    TimedOut,
    Killed,
}

/// Terminal state with the exit code when the child exited by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited { code: i32 },
    TimedOut,
    Killed,
}

impl Termination {
    pub fn state(&self) -> LifecycleState {
        match self {
            Termination::Exited { .. } => LifecycleState::Completed,
            Termination::TimedOut => LifecycleState::TimedOut,
            Termination::Killed => LifecycleState::Killed,
        }
    }
}

/// Requests cancellation of the execution tied to the paired [`Cancellation`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by the lifecycle controller; dropping the handle never cancels.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// A cancellation that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return future::pending().await;
            }
        }
    }
}

pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx: Some(rx) })
}

/// Exclusive owner of one running child and the program file it executes.
pub struct ChildProcessHandle {
    child: Child,
    started: Instant,
    _program: Option<TempPath>,
}

impl ChildProcessHandle {
    pub fn new(child: Child, started: Instant, program: Option<TempPath>) -> Self {
        Self {
            child,
            started,
            _program: program,
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// What happened to a supervised child.
#[derive(Debug, Clone)]
pub struct Supervised {
    pub termination: Termination,
    pub output: CapturedOutput,
    /// Launch to confirmed termination.
    pub elapsed: Duration,
    /// A forceful kill was needed.
    pub forced: bool,
}

/// Run `handle` to a terminal state while `collector` drains its output.
pub async fn supervise(
    launcher: &dyn ProcessLauncher,
    mut handle: ChildProcessHandle,
    collector: StreamCollector,
    timeout: Option<Duration>,
    mut cancellation: Cancellation,
) -> Supervised {
    let pid = handle.id();
    let timer = async {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => future::pending().await,
        }
    };
    tokio::pin!(timer);

    let mut forced = false;
    let termination = tokio::select! {
        status = handle.child.wait() => match status {
            Ok(status) => Termination::Exited { code: launcher.exit_code(status) },
            Err(err) => {
                warn!(?pid, error = %err, "Waiting on child failed, terminating it");
                forced = escalate(launcher, &mut handle.child, pid).await;
                Termination::Exited { code: -1 }
            }
        },
        _ = &mut timer => {
            info!(?pid, ?timeout, "Execution timed out");
            forced = escalate(launcher, &mut handle.child, pid).await;
            Termination::TimedOut
        }
        _ = cancellation.cancelled() => {
            info!(?pid, "Execution cancelled by caller");
            forced = escalate(launcher, &mut handle.child, pid).await;
            Termination::Killed
        }
    };
    let elapsed = handle.started.elapsed();

    let window = match termination {
        Termination::Exited { .. } if !forced => DRAIN_WINDOW,
        _ => KILL_DRAIN_WINDOW,
    };
    let output = collector.finish(window).await;

    debug!(?pid, ?termination, ?elapsed, forced, "Child reaped");
    Supervised {
        termination,
        output,
        elapsed,
        forced,
    }
}

/// Graceful request, grace period, forceful kill. Returns whether the kill was needed.
///
/// Once the leader is reaped, whether within the grace period or after the kill,
/// anything left in its process group is killed too.
async fn escalate(launcher: &dyn ProcessLauncher, child: &mut Child, pid: Option<u32>) -> bool {
    let graceful = match launcher.interrupt(child) {
        Ok(sent) => sent,
        Err(err) => {
            debug!(error = %err, "Graceful termination request failed");
            false
        }
    };

    let mut forced = true;
    if graceful {
        match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
            Ok(Ok(_)) => forced = false,
            Ok(Err(err)) => debug!(error = %err, "Wait during grace period failed"),
            Err(_) => debug!(grace = ?GRACE_PERIOD, "Grace period elapsed"),
        }
    }

    if forced {
        if let Err(err) = launcher.kill(child) {
            debug!(error = %err, "Forceful kill reported an error");
        }
        if let Err(err) = child.wait().await {
            warn!(error = %err, "Reaping killed child failed");
        }
    }

    if let Some(pid) = pid {
        if let Err(err) = launcher.kill_remaining(pid) {
            warn!(pid, error = %err, "Killing remaining group members failed");
        }
    }
    forced
}
