//! Platform process launching and termination.
//!
//! Everything that differs between operating systems (process groups, signals,
//! handle inheritance) sits behind [`ProcessLauncher`]. The implementation is chosen
//! once at startup by [`platform_launcher`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

/// Everything needed to start one child.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    /// Layered over the supervisor's own environment.
    pub env: BTreeMap<String, String>,
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to prepare working directory {path}: {source}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Child has no {stream} pipe")]
    MissingPipe { stream: &'static str },
}

/// A started child with both output pipes detached for collection.
pub struct LaunchedChild {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

pub trait ProcessLauncher: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Platform specific command setup applied before spawning.
    fn prepare(&self, command: &mut Command) -> io::Result<()>;

    /// Ask the child, and its descendants where supported, to exit.
    ///
    /// `Ok(false)` means no graceful request was delivered and the caller should
    /// escalate straight away.
    fn interrupt(&self, child: &Child) -> io::Result<bool>;

    /// Terminate the child forcefully.
    fn kill(&self, child: &mut Child) -> io::Result<()>;

    /// Forcefully terminate whatever is left of the group led by `pid` after the
    /// leader itself has been reaped. A no-op where children have no group.
    fn kill_remaining(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }

    /// Exit code reported for `status`.
    fn exit_code(&self, status: ExitStatus) -> i32;

    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedChild, LaunchError> {
        fs::create_dir_all(&spec.working_dir).map_err(|source| LaunchError::WorkingDirectory {
            path: spec.working_dir.clone(),
            source,
        })?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawn_error = |source| LaunchError::Spawn {
            program: spec.program.display().to_string(),
            source,
        };
        self.prepare(&mut command).map_err(spawn_error)?;
        let mut child = command.spawn().map_err(spawn_error)?;

        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(LaunchError::MissingPipe { stream: "stderr" })?;

        debug!(
            launcher = self.name(),
            pid = child.id(),
            program = %spec.program.display(),
            working_dir = %spec.working_dir.display(),
            "Child spawned"
        );

        Ok(LaunchedChild {
            child,
            stdout,
            stderr,
        })
    }
}

/// The launcher for the platform this binary was built for.
pub fn platform_launcher() -> Arc<dyn ProcessLauncher> {
    #[cfg(unix)]
    {
        Arc::new(UnixLauncher::new())
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsLauncher::new())
    }
}

#[cfg(unix)]
pub use unix::UnixLauncher;

#[cfg(windows)]
pub use windows::WindowsLauncher;

#[cfg(unix)]
mod unix {
    use super::ProcessLauncher;
    use std::fs;
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::process::ExitStatus;
    use tokio::process::{Child, Command};
    use tracing::{debug, warn};

    /// Runs each child as the leader of its own process group.
    #[derive(Debug)]
    pub struct UnixLauncher {
        _private: (),
    }

    impl UnixLauncher {
        /// Marks inherited descriptors close-on-exec before any child exists.
        pub fn new() -> Self {
            let sealed = seal_inherited_descriptors();
            debug!(sealed, "Inherited descriptors marked close-on-exec");
            Self { _private: () }
        }
    }

    impl Default for UnixLauncher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcessLauncher for UnixLauncher {
        fn name(&self) -> &'static str {
            "unix"
        }

        fn prepare(&self, command: &mut Command) -> io::Result<()> {
            command.process_group(0);
            Ok(())
        }

        fn interrupt(&self, child: &Child) -> io::Result<bool> {
            let Some(pid) = child.id() else {
                return Ok(false);
            };
            signal_group(pid, libc::SIGTERM)
        }

        fn kill(&self, child: &mut Child) -> io::Result<()> {
            if let Some(pid) = child.id() {
                if let Err(err) = signal_group(pid, libc::SIGKILL) {
                    warn!(pid, error = %err, "Process group kill failed");
                }
            }
            child.start_kill()
        }

        fn kill_remaining(&self, pid: u32) -> io::Result<()> {
            // Only the group: the leader's pid may already belong to someone else
            // SAFETY: kill(2) has no memory safety preconditions.
            if unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) } == 0 {
                debug!(pid, "Killed remaining process group members");
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            Err(err)
        }

        fn exit_code(&self, status: ExitStatus) -> i32 {
            status
                .code()
                .or_else(|| status.signal().map(|signal| 128 + signal))
                .unwrap_or(-1)
        }
    }

    fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<bool> {
        let pid = pid as libc::pid_t;
        // SAFETY: kill(2) has no memory safety preconditions.
        if unsafe { libc::kill(-pid, signal) } == 0 {
            return Ok(true);
        }
        let group_err = io::Error::last_os_error();
        debug!(pid, signal, error = %group_err, "Group signal failed, signalling child only");

        // SAFETY: as above.
        if unsafe { libc::kill(pid, signal) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(false);
        }
        Err(err)
    }

    /// Set `FD_CLOEXEC` on every open descriptor above stderr. Returns how many changed.
    pub(crate) fn seal_inherited_descriptors() -> usize {
        let fd_dir = ["/proc/self/fd", "/dev/fd"]
            .into_iter()
            .map(Path::new)
            .find(|dir| dir.is_dir());
        let Some(fd_dir) = fd_dir else {
            return 0;
        };
        let entries = match fs::read_dir(fd_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %fd_dir.display(), error = %err, "Cannot enumerate descriptors");
                return 0;
            }
        };

        // Collect first: the directory handle itself is one of the entries
        let fds: Vec<libc::c_int> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .filter(|fd| *fd > 2)
            .collect();

        let mut sealed = 0;
        for fd in fds {
            // SAFETY: fcntl on a possibly closed descriptor only fails with EBADF.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            if flags < 0 || flags & libc::FD_CLOEXEC != 0 {
                continue;
            }
            // SAFETY: as above.
            if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == 0 {
                sealed += 1;
            }
        }
        sealed
    }

}

#[cfg(windows)]
mod windows {
    use super::ProcessLauncher;
    use std::io;
    use std::process::ExitStatus;
    use tokio::process::{Child, Command};
    use windows_sys::Win32::Foundation::{SetHandleInformation, HANDLE_FLAG_INHERIT, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Console::{
        GetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
    };
    use windows_sys::Win32::System::Threading::CREATE_NO_WINDOW;

    /// Spawns children without a console window; termination is always forceful.
    #[derive(Debug)]
    pub struct WindowsLauncher {
        _private: (),
    }

    impl WindowsLauncher {
        /// Clears the inherit flag on the parent's standard handles.
        pub fn new() -> Self {
            for which in [STD_INPUT_HANDLE, STD_OUTPUT_HANDLE, STD_ERROR_HANDLE] {
                // SAFETY: GetStdHandle/SetHandleInformation take plain values.
                unsafe {
                    let handle = GetStdHandle(which);
                    if !handle.is_null() && handle != INVALID_HANDLE_VALUE {
                        SetHandleInformation(handle, HANDLE_FLAG_INHERIT, 0);
                    }
                }
            }
            Self { _private: () }
        }
    }

    impl Default for WindowsLauncher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcessLauncher for WindowsLauncher {
        fn name(&self) -> &'static str {
            "windows"
        }

        fn prepare(&self, command: &mut Command) -> io::Result<()> {
            command.creation_flags(CREATE_NO_WINDOW);
            Ok(())
        }

        fn interrupt(&self, _child: &Child) -> io::Result<bool> {
            Ok(false)
        }

        fn kill(&self, child: &mut Child) -> io::Result<()> {
            child.start_kill()
        }

        fn exit_code(&self, status: ExitStatus) -> i32 {
            status.code().unwrap_or(-1)
        }
    }
}
