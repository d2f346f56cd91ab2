//! Command line and environment configuration for the server binary

use clap::Parser;
use config_loader::{ConfigManager, ConfigOverrides};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "pyexec-mcp")]
#[command(about = "Runs Python code, expressions and scripts for MCP clients over stdio")]
pub struct ServerConfig {
    /// Base directory searched for a virtual environment and fonts
    #[arg(long, env = "PYEXEC_HOME")]
    pub home: Option<PathBuf>,

    /// Directory holding pyexec.json (default: <home>/config)
    #[arg(long, env = "PYEXEC_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Interpreter to run; skips virtual environment discovery
    #[arg(long, env = "PYEXEC_INTERPRETER")]
    pub interpreter: Option<PathBuf>,

    /// Default working directory for code and expression runs
    #[arg(long, env = "PYEXEC_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Output logs in JSON format
    #[arg(long, env)]
    pub log_json: bool,
}

impl ServerConfig {
    /// Parse configuration from command-line args and environment variables
    pub fn parse_config() -> Self {
        ServerConfig::parse()
    }

    pub fn config_manager(&self) -> ConfigManager {
        match (&self.home, &self.config_dir) {
            (Some(home), Some(config_dir)) => ConfigManager::with_dirs(home.clone(), config_dir.clone()),
            (Some(home), None) => ConfigManager::with_dirs(home.clone(), home.join("config")),
            (None, Some(config_dir)) => {
                let discovered = ConfigManager::new();
                ConfigManager::with_dirs(discovered.home_dir().clone(), config_dir.clone())
            }
            (None, None) => ConfigManager::new(),
        }
    }

    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            interpreter: self.interpreter.clone(),
            scratch_dir: self.scratch_dir.clone(),
        }
    }
}
