//! Environment configuration for the pyexec supervisor.
//!
//! Loads the optional `pyexec.json` file, validates it against the bundled schema,
//! resolves the interpreter (explicit path, active virtual environment, project
//! virtual environment, then `PATH`) and produces an immutable [`EnvironmentConfig`]
//! that callers pass explicitly into every execution.

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub mod environment;
pub mod fonts;

pub use environment::{
    timeout_from_secs, ConfigOverrides, EnvironmentConfig, FileConfig, InterpreterSource,
    ResolvedInterpreter, TimeoutDefaults, MAX_TIMEOUT_SECS,
};
pub use fonts::{extract_font_family, FontFace};

/// File name looked up inside the config directory.
pub const CONFIG_FILE_NAME: &str = "pyexec.json";

const CONFIG_SCHEMA: &str = include_str!("../contracts/config/pyexec-config.v1.json");

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("Schema compilation failed: {message}")]
    SchemaCompilationFailed { message: String },

    #[error("Config validation failed")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("JSON parsing failed: {message}")]
    JsonParsingFailed { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub json_pointer: String,
    pub message: String,
    pub schema_path: String,
}

pub struct ConfigManager {
    home_dir: PathBuf,
    config_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Self {
        let home_dir = Self::find_home_dir();
        let config_dir = Self::find_config_dir(&home_dir);

        Self {
            home_dir,
            config_dir,
        }
    }

    pub fn with_dirs(home_dir: PathBuf, config_dir: PathBuf) -> Self {
        Self {
            home_dir,
            config_dir,
        }
    }

    pub fn home_dir(&self) -> &PathBuf {
        &self.home_dir
    }

    pub fn config_dir(&self) -> &PathBuf {
        &self.config_dir
    }

    fn find_home_dir() -> PathBuf {
        if let Ok(home) = std::env::var("PYEXEC_HOME") {
            if !home.trim().is_empty() {
                return PathBuf::from(home);
            }
        }

        // Venv and fonts live next to the installed binary by default
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            return dir;
        }

        dirs::data_local_dir()
            .map(|dir| dir.join("pyexec"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn find_config_dir(home_dir: &Path) -> PathBuf {
        match std::env::var("PYEXEC_CONFIG_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => home_dir.join("config"),
        }
    }

    /// Load, validate and resolve the environment configuration.
    #[instrument(skip(self, overrides), fields(config_dir = %self.config_dir.display()))]
    pub fn load(&self, overrides: &ConfigOverrides) -> Result<EnvironmentConfig, ConfigError> {
        let file_config = self.load_file_config()?;
        let config = EnvironmentConfig::resolve(&self.home_dir, file_config, overrides);

        info!(
            interpreter = %config.interpreter.display(),
            source = ?config.interpreter_source,
            in_venv = config.in_virtual_env(),
            scratch_dir = %config.scratch_dir.display(),
            fonts_dir = %config.fonts_dir.display(),
            "Environment configuration loaded"
        );
        if matches!(config.interpreter_source, InterpreterSource::SystemFallback) {
            warn!(
                interpreter = %config.interpreter.display(),
                "Virtual environment not found, using system Python"
            );
        }

        Ok(config)
    }

    #[instrument(skip(self))]
    pub fn load_file_config(&self) -> Result<FileConfig, ConfigError> {
        let config_path = self.config_dir.join(CONFIG_FILE_NAME);

        let config_value = if config_path.exists() {
            debug!("Loading config from: {:?}", config_path);
            read_json(&config_path)?
        } else {
            debug!("Config file not found, loading defaults from schema");
            self.load_default_config()?
        };

        self.validate_config(&config_value)?;

        serde_json::from_value(config_value).map_err(|e| ConfigError::JsonParsingFailed {
            message: e.to_string(),
        })
    }

    #[instrument(skip(self))]
    pub fn validate_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: config_path.to_string_lossy().to_string(),
            });
        }

        let config_value = read_json(config_path)?;
        self.validate_config(&config_value)
    }

    pub fn validate_config_value(&self, config_value: &Value) -> Result<(), ConfigError> {
        self.validate_config(config_value)
    }

    fn load_default_config(&self) -> Result<Value, ConfigError> {
        let schema_value = schema_value()?;

        let mut default_config = serde_json::Map::new();
        if let Some(properties) = schema_value.get("properties").and_then(|p| p.as_object()) {
            for (key, property) in properties {
                if let Some(default_value) = property.get("default") {
                    default_config.insert(key.clone(), default_value.clone());
                }
            }
        }

        let default_config_value = Value::Object(default_config);
        debug!("Loaded default config: {}", default_config_value);
        Ok(default_config_value)
    }

    fn validate_config(&self, config: &Value) -> Result<(), ConfigError> {
        let schema_value = schema_value()?;
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema_value)
            .map_err(|e| ConfigError::SchemaCompilationFailed {
                message: e.to_string(),
            })?;

        if let Err(errors) = schema.validate(config) {
            let validation_errors: Vec<ValidationError> = errors
                .map(|error| ValidationError {
                    json_pointer: error.instance_path.to_string(),
                    message: error.to_string(),
                    schema_path: error.schema_path.to_string(),
                })
                .collect();

            return Err(ConfigError::ValidationFailed {
                errors: validation_errors,
            });
        }

        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn schema_value() -> Result<Value, ConfigError> {
    serde_json::from_str(CONFIG_SCHEMA).map_err(|e| ConfigError::JsonParsingFailed {
        message: format!("bundled schema: {}", e),
    })
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        message: format!("Failed to read config file: {}", e),
    })?;

    serde_json::from_str(&content).map_err(|e| ConfigError::JsonParsingFailed {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup_test_env() -> (TempDir, ConfigManager) {
        let temp_dir = TempDir::new().unwrap();
        let home_dir = temp_dir.path().join("home");
        let config_dir = home_dir.join("config");
        fs::create_dir_all(&config_dir).unwrap();

        let manager = ConfigManager::with_dirs(home_dir, config_dir);
        (temp_dir, manager)
    }

    #[test]
    fn test_load_valid_config() {
        let (_temp_dir, manager) = setup_test_env();

        let config_content = r#"{
            "fontSetup": false,
            "maxOutputBytes": 4096,
            "timeouts": { "codeSecs": 5, "expressionSecs": 2 }
        }"#;
        fs::write(manager.config_dir.join(CONFIG_FILE_NAME), config_content).unwrap();

        let config = manager.load_file_config().unwrap();
        assert!(!config.font_setup);
        assert_eq!(config.max_output_bytes, 4096);
        assert_eq!(config.timeouts.code_secs, 5.0);
        assert_eq!(config.timeouts.expression_secs, 2.0);
        // Unspecified timeouts keep their defaults
        assert_eq!(config.timeouts.install_secs, 300.0);
    }

    #[test]
    fn test_load_invalid_config_rejects_unknown_key() {
        let (_temp_dir, manager) = setup_test_env();

        fs::write(
            manager.config_dir.join(CONFIG_FILE_NAME),
            r#"{ "fontSetup": true, "sandbox": "strict" }"#,
        )
        .unwrap();

        let result = manager.load_file_config();
        assert!(matches!(result, Err(ConfigError::ValidationFailed { .. })));
    }

    #[test]
    fn test_load_invalid_config_rejects_zero_timeout() {
        let (_temp_dir, manager) = setup_test_env();

        fs::write(
            manager.config_dir.join(CONFIG_FILE_NAME),
            r#"{ "timeouts": { "codeSecs": 0 } }"#,
        )
        .unwrap();

        let result = manager.load_file_config();
        match result {
            Err(ConfigError::ValidationFailed { errors }) => {
                assert!(errors.iter().any(|e| e.json_pointer.contains("codeSecs")));
            }
            other => panic!("expected validation failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_load_missing_config_uses_defaults() {
        let (_temp_dir, manager) = setup_test_env();

        let config = manager.load_file_config().unwrap();

        assert!(config.font_setup);
        assert_eq!(config.max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.timeouts, TimeoutDefaults::default());
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_malformed_json_reports_parse_error() {
        let (_temp_dir, manager) = setup_test_env();

        fs::write(manager.config_dir.join(CONFIG_FILE_NAME), "{ not json").unwrap();

        let result = manager.load_file_config();
        assert!(matches!(result, Err(ConfigError::JsonParsingFailed { .. })));
    }

    #[test]
    fn test_validate_config_file_missing_still_fails() {
        let (_temp_dir, manager) = setup_test_env();

        let missing_path = manager.config_dir.join("missing.json");
        let result = manager.validate_config_file(&missing_path);

        assert!(matches!(
            result,
            Err(ConfigError::ConfigFileNotFound { .. })
        ));
    }
}
