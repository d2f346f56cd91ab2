use config_loader::{
    ConfigError, ConfigManager, ConfigOverrides, InterpreterSource, TimeoutDefaults,
    CONFIG_FILE_NAME, MAX_TIMEOUT_SECS,
};
use serial_test::serial;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn setup_test_environment() -> (TempDir, ConfigManager) {
    let temp_dir = TempDir::new().unwrap();
    let home_dir = temp_dir.path().join("home");
    let config_dir = home_dir.join("config");

    fs::create_dir_all(&config_dir).unwrap();

    let manager = ConfigManager::with_dirs(home_dir, config_dir);
    (temp_dir, manager)
}

fn write_fake_venv(root: &std::path::Path) -> PathBuf {
    let bin = root.join("bin");
    fs::create_dir_all(&bin).unwrap();
    fs::write(bin.join("python"), "").unwrap();
    fs::write(root.join("pyvenv.cfg"), "include-system-site-packages = false\n").unwrap();
    bin.join("python")
}

#[test]
#[serial]
fn given_project_venv_when_load_then_interpreter_and_path_point_into_it() {
    let (_temp_dir, manager) = setup_test_environment();
    let python = write_fake_venv(&manager.home_dir().join("venv"));
    std::env::remove_var("VIRTUAL_ENV");

    let config = manager.load(&ConfigOverrides::default()).unwrap();

    assert_eq!(config.interpreter, python);
    assert_eq!(config.interpreter_source, InterpreterSource::ProjectVirtualEnv);
    assert!(config.in_virtual_env());

    let path = config.env.get("PATH").expect("PATH override for venv");
    let first = std::env::split_paths(path).next().unwrap();
    assert_eq!(first, manager.home_dir().join("venv").join("bin"));
    assert_eq!(
        config.env.get("VIRTUAL_ENV").map(PathBuf::from),
        Some(manager.home_dir().join("venv"))
    );
}

#[test]
#[serial]
fn given_no_config_file_when_load_then_schema_defaults_apply() {
    let (_temp_dir, manager) = setup_test_environment();

    let config = manager.load(&ConfigOverrides::default()).unwrap();

    assert_eq!(config.timeouts.code_secs, 30.0);
    assert_eq!(config.timeouts.expression_secs, 10.0);
    assert_eq!(config.timeouts.script_secs, 60.0);
    assert_eq!(config.max_output_bytes, 10 * 1024 * 1024);
    assert!(config.setup_prelude.is_some(), "font setup is on by default");
    assert_eq!(
        config.env.get("MPLCONFIGDIR").map(PathBuf::from),
        Some(manager.home_dir().join(".matplotlib"))
    );
}

#[test]
#[serial]
fn given_fonts_in_home_when_load_then_prelude_registers_them() {
    let (_temp_dir, manager) = setup_test_environment();
    let fonts_dir = manager.home_dir().join("fonts");
    fs::create_dir_all(&fonts_dir).unwrap();
    fs::write(fonts_dir.join("NotoSansSC-Regular.otf"), b"").unwrap();

    let config = manager.load(&ConfigOverrides::default()).unwrap();

    let prelude = config.setup_prelude.expect("prelude");
    assert!(prelude.contains("Noto Sans SC"));
    assert!(prelude.contains("DejaVu Sans"));
}

#[test]
#[serial]
fn given_font_setup_disabled_when_load_then_no_prelude() {
    let (_temp_dir, manager) = setup_test_environment();
    fs::write(
        manager.config_dir().join(CONFIG_FILE_NAME),
        r#"{ "fontSetup": false, "env": { "PYEXEC_MARKER": "on" } }"#,
    )
    .unwrap();

    let config = manager.load(&ConfigOverrides::default()).unwrap();

    assert!(config.setup_prelude.is_none());
    assert_eq!(config.env.get("PYEXEC_MARKER").map(String::as_str), Some("on"));
}

#[test]
fn given_config_with_invalid_types_when_load_then_validation_error() {
    let (_temp_dir, manager) = setup_test_environment();

    let config_content = r#"{
        "fontSetup": "yes",
        "maxOutputBytes": 12,
        "env": { "A": 1 }
    }"#;

    fs::write(manager.config_dir().join(CONFIG_FILE_NAME), config_content).unwrap();

    let result = manager.load(&ConfigOverrides::default());
    assert!(matches!(result, Err(ConfigError::ValidationFailed { .. })));

    if let Err(ConfigError::ValidationFailed { errors }) = result {
        assert!(errors.len() >= 3);
    }
}

#[test]
fn given_valid_config_file_when_validate_config_file_then_success() {
    let (_temp_dir, manager) = setup_test_environment();

    let config_path = manager.config_dir().join("candidate.json");
    fs::write(
        &config_path,
        r#"{ "interpreter": "/usr/bin/python3", "timeouts": { "installSecs": 600 } }"#,
    )
    .unwrap();

    assert!(manager.validate_config_file(&config_path).is_ok());
}

#[test]
fn given_invalid_config_value_when_validate_config_value_then_validation_error() {
    let (_temp_dir, manager) = setup_test_environment();

    let config_value = serde_json::json!({
        "timeouts": { "codeSecs": -1, "unknownSecs": 3 }
    });

    let result = manager.validate_config_value(&config_value);
    assert!(matches!(result, Err(ConfigError::ValidationFailed { .. })));
}

#[test]
fn given_timeout_beyond_one_week_when_validate_config_value_then_rejected() {
    let (_temp_dir, manager) = setup_test_environment();

    let config_value = serde_json::json!({ "timeouts": { "codeSecs": 1e30 } });

    match manager.validate_config_value(&config_value) {
        Err(ConfigError::ValidationFailed { errors }) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].json_pointer, "/timeouts/codeSecs");
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
}

#[test]
fn given_oversized_timeout_in_code_when_converted_then_capped_without_panic() {
    let timeouts = TimeoutDefaults {
        code_secs: 1e30,
        expression_secs: f64::NAN,
        script_secs: -5.0,
        ..TimeoutDefaults::default()
    };

    assert_eq!(timeouts.code(), Duration::from_secs_f64(MAX_TIMEOUT_SECS));
    assert_eq!(timeouts.expression(), Duration::from_secs_f64(MAX_TIMEOUT_SECS));
    assert_eq!(timeouts.script(), Duration::ZERO);
    assert_eq!(timeouts.install(), Duration::from_secs(300));
}

#[test]
#[serial]
fn given_cli_overrides_when_load_then_they_win_over_file() {
    let (temp_dir, manager) = setup_test_environment();
    fs::write(
        manager.config_dir().join(CONFIG_FILE_NAME),
        r#"{ "interpreter": "/file/python", "scratchDir": "/file/scratch" }"#,
    )
    .unwrap();
    let scratch = temp_dir.path().join("scratch");

    let config = manager
        .load(&ConfigOverrides {
            interpreter: Some(PathBuf::from("/cli/python")),
            scratch_dir: Some(scratch.clone()),
        })
        .unwrap();

    assert_eq!(config.interpreter, PathBuf::from("/cli/python"));
    assert_eq!(config.interpreter_source, InterpreterSource::Explicit);
    assert_eq!(config.scratch_dir, scratch);
}
