//! Package management through the configured interpreter's `pip`.

use crate::lifecycle::Cancellation;
use crate::outcome::{ExecutionOutcome, ExecutionStatus};
use crate::request::RequestError;
use crate::Supervisor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

#[derive(Error, Debug)]
pub enum PackageError {
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),

    #[error("Package listing failed: {status}")]
    ListingFailed {
        status: ExecutionStatus,
        stderr: String,
    },

    #[error("Package listing is not valid JSON: {source}")]
    Unparseable {
        #[source]
        source: serde_json::Error,
    },
}

/// Validated arguments for an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub packages: Vec<String>,
    pub upgrade: bool,
}

impl InstallRequest {
    pub fn new<I, S>(packages: I, upgrade: bool) -> Result<Self, RequestError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let packages: Vec<String> = packages.into_iter().map(Into::into).collect();
        if packages.is_empty() {
            return Err(RequestError::NoPackages);
        }
        // Anything starting with '-' would be read by pip as an option
        if let Some(name) = packages
            .iter()
            .find(|name| name.trim().is_empty() || name.starts_with('-'))
        {
            return Err(RequestError::InvalidPackage { name: name.clone() });
        }
        Ok(Self { packages, upgrade })
    }

    /// Parse a whitespace separated package list such as `"numpy pandas>=2"`.
    pub fn parse(packages: &str, upgrade: bool) -> Result<Self, RequestError> {
        Self::new(packages.split_whitespace(), upgrade)
    }

    pub fn pip_args(&self) -> Vec<String> {
        let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
        if self.upgrade {
            args.push("--upgrade".to_string());
        }
        args.extend(self.packages.iter().cloned());
        args
    }

    /// The command line as shown to users.
    pub fn command_line(&self, interpreter: &Path) -> String {
        let mut parts = vec![interpreter.display().to_string()];
        parts.extend(self.pip_args());
        parts.join(" ")
    }
}

#[async_trait]
pub trait PackageManager: Send + Sync {
    async fn install(&self, request: &InstallRequest, cancellation: Cancellation) -> ExecutionOutcome;

    async fn list(&self) -> Result<Vec<InstalledPackage>, PackageError>;
}

/// Runs `<interpreter> -m pip …` through the supervisor pipeline.
#[derive(Debug, Clone)]
pub struct PipPackageManager {
    supervisor: Arc<Supervisor>,
}

impl PipPackageManager {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl PackageManager for PipPackageManager {
    #[instrument(skip_all, fields(packages = ?request.packages, upgrade = request.upgrade))]
    async fn install(&self, request: &InstallRequest, cancellation: Cancellation) -> ExecutionOutcome {
        let timeout = self.supervisor.config().timeouts.install();
        info!("Installing packages");
        self.supervisor
            .run_interpreter(request.pip_args(), Some(timeout), cancellation)
            .await
    }

    #[instrument(skip_all)]
    async fn list(&self) -> Result<Vec<InstalledPackage>, PackageError> {
        let timeout = self.supervisor.config().timeouts.list();
        let args = ["-m", "pip", "list", "--format=json"]
            .into_iter()
            .map(String::from)
            .collect();
        let outcome = self
            .supervisor
            .run_interpreter(args, Some(timeout), Cancellation::never())
            .await;

        if !outcome.is_success() {
            return Err(PackageError::ListingFailed {
                status: outcome.status,
                stderr: outcome.stderr,
            });
        }
        parse_listing(&outcome.stdout)
    }
}

/// Parse `pip list --format=json` output, sorted case-insensitively by name.
pub fn parse_listing(stdout: &str) -> Result<Vec<InstalledPackage>, PackageError> {
    // pip may print upgrade notices around the JSON document
    let json = stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("[{") || *line == "[]")
        .unwrap_or_else(|| stdout.trim());

    let mut packages: Vec<InstalledPackage> =
        serde_json::from_str(json).map_err(|source| PackageError::Unparseable { source })?;
    packages.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(packages)
}
