//! File-level configuration and its resolution into an [`EnvironmentConfig`].

use crate::fonts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

const VENV_DIR_NAMES: [&str; 3] = ["venv", ".venv", "env"];

/// Contents of `pyexec.json`. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(default)]
    pub interpreter: Option<PathBuf>,
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default = "default_font_setup")]
    pub font_setup: bool,
    #[serde(default)]
    pub fonts_dir: Option<PathBuf>,
    #[serde(default)]
    pub matplotlib_config_dir: Option<PathBuf>,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: TimeoutDefaults,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            scratch_dir: None,
            font_setup: default_font_setup(),
            fonts_dir: None,
            matplotlib_config_dir: None,
            max_output_bytes: default_max_output_bytes(),
            env: BTreeMap::new(),
            timeouts: TimeoutDefaults::default(),
        }
    }
}

fn default_font_setup() -> bool {
    true
}

fn default_max_output_bytes() -> u64 {
    10 * 1024 * 1024
}

/// Longest timeout accepted anywhere, one week.
pub const MAX_TIMEOUT_SECS: f64 = 604_800.0;

/// Seconds to a `Duration`, capped at [`MAX_TIMEOUT_SECS`]. Values the schema would
/// reject (negative, NaN) never panic.
pub fn timeout_from_secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.min(MAX_TIMEOUT_SECS)).unwrap_or(Duration::ZERO)
}

/// Per-operation default timeouts in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutDefaults {
    pub code_secs: f64,
    pub expression_secs: f64,
    pub script_secs: f64,
    pub install_secs: f64,
    pub list_secs: f64,
}

impl Default for TimeoutDefaults {
    fn default() -> Self {
        Self {
            code_secs: 30.0,
            expression_secs: 10.0,
            script_secs: 60.0,
            install_secs: 300.0,
            list_secs: 60.0,
        }
    }
}

impl TimeoutDefaults {
    pub fn code(&self) -> Duration {
        timeout_from_secs(self.code_secs)
    }

    pub fn expression(&self) -> Duration {
        timeout_from_secs(self.expression_secs)
    }

    pub fn script(&self) -> Duration {
        timeout_from_secs(self.script_secs)
    }

    pub fn install(&self) -> Duration {
        timeout_from_secs(self.install_secs)
    }

    pub fn list(&self) -> Duration {
        timeout_from_secs(self.list_secs)
    }
}

/// Command-line overrides that win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub interpreter: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
}

/// Where the interpreter path came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterSource {
    Explicit,
    ActiveVirtualEnv,
    ProjectVirtualEnv,
    SystemFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInterpreter {
    pub path: PathBuf,
    pub source: InterpreterSource,
    /// Root of the virtual environment the interpreter belongs to, if any.
    pub virtual_env: Option<PathBuf>,
}

/// Immutable configuration shared by every execution.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub interpreter: PathBuf,
    pub interpreter_source: InterpreterSource,
    pub virtual_env: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub fonts_dir: PathBuf,
    /// Text prepended to `Code` payloads. `None` disables injection.
    pub setup_prelude: Option<String>,
    /// Variables layered over the supervisor's own environment for every child.
    pub env: BTreeMap<String, String>,
    pub timeouts: TimeoutDefaults,
    pub max_output_bytes: usize,
}

impl EnvironmentConfig {
    /// Minimal configuration running `interpreter` with no prelude and no extra
    /// environment. Used when embedding the supervisor and in tests.
    pub fn for_interpreter(interpreter: impl Into<PathBuf>) -> Self {
        let scratch_dir = env::temp_dir();
        Self {
            interpreter: interpreter.into(),
            interpreter_source: InterpreterSource::Explicit,
            virtual_env: None,
            fonts_dir: scratch_dir.join("fonts"),
            scratch_dir,
            setup_prelude: None,
            env: BTreeMap::new(),
            timeouts: TimeoutDefaults::default(),
            max_output_bytes: default_max_output_bytes() as usize,
        }
    }

    pub fn in_virtual_env(&self) -> bool {
        self.virtual_env.is_some()
    }

    pub(crate) fn resolve(home: &Path, file: FileConfig, overrides: &ConfigOverrides) -> Self {
        let explicit = overrides
            .interpreter
            .clone()
            .or_else(|| file.interpreter.clone());
        let active_venv = env::var_os("VIRTUAL_ENV").map(PathBuf::from);
        let resolved = resolve_interpreter(explicit.as_deref(), home, active_venv.as_deref());

        let scratch_dir = overrides
            .scratch_dir
            .clone()
            .or_else(|| file.scratch_dir.clone())
            .unwrap_or_else(env::temp_dir);
        let fonts_dir = file
            .fonts_dir
            .clone()
            .unwrap_or_else(|| home.join("fonts"));
        let mpl_config_dir = file
            .matplotlib_config_dir
            .clone()
            .unwrap_or_else(|| home.join(".matplotlib"));

        let mut child_env = BTreeMap::new();
        child_env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
        child_env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        child_env.insert(
            "MPLCONFIGDIR".to_string(),
            mpl_config_dir.to_string_lossy().to_string(),
        );
        child_env.insert(
            "FONTCONFIG_PATH".to_string(),
            fonts_dir.to_string_lossy().to_string(),
        );
        if let Some(venv) = &resolved.virtual_env {
            child_env.insert(
                "VIRTUAL_ENV".to_string(),
                venv.to_string_lossy().to_string(),
            );
            if let Some(path) = prepend_to_path(&venv_bin_dir(venv), env::var_os("PATH")) {
                child_env.insert("PATH".to_string(), path);
            }
        }
        child_env.extend(file.env.clone());

        let setup_prelude = if file.font_setup {
            let faces = fonts::discover_fonts(&fonts_dir);
            Some(fonts::build_prelude(&faces, &mpl_config_dir))
        } else {
            None
        };

        Self {
            interpreter: resolved.path,
            interpreter_source: resolved.source,
            virtual_env: resolved.virtual_env,
            scratch_dir,
            fonts_dir,
            setup_prelude,
            env: child_env,
            timeouts: file.timeouts,
            max_output_bytes: usize::try_from(file.max_output_bytes).unwrap_or(usize::MAX),
        }
    }
}

/// Pick the interpreter: explicit path, then the active virtual environment,
/// then a virtual environment next to `home`, then `python3`/`python` on `PATH`.
pub fn resolve_interpreter(
    explicit: Option<&Path>,
    home: &Path,
    active_venv: Option<&Path>,
) -> ResolvedInterpreter {
    if let Some(path) = explicit {
        return ResolvedInterpreter {
            path: path.to_path_buf(),
            source: InterpreterSource::Explicit,
            virtual_env: venv_root_of(path),
        };
    }

    if let Some(venv) = active_venv {
        if let Some(python) = venv_python(venv) {
            return ResolvedInterpreter {
                path: python,
                source: InterpreterSource::ActiveVirtualEnv,
                virtual_env: Some(venv.to_path_buf()),
            };
        }
    }

    for name in VENV_DIR_NAMES {
        let venv = home.join(name);
        if let Some(python) = venv_python(&venv) {
            return ResolvedInterpreter {
                path: python,
                source: InterpreterSource::ProjectVirtualEnv,
                virtual_env: Some(venv),
            };
        }
    }

    let path = ["python3", "python"]
        .iter()
        .find_map(|name| find_on_path(name))
        .unwrap_or_else(|| PathBuf::from("python3"));

    ResolvedInterpreter {
        path,
        source: InterpreterSource::SystemFallback,
        virtual_env: None,
    }
}

fn venv_python(venv: &Path) -> Option<PathBuf> {
    let candidates = [
        venv.join("bin").join("python"),
        venv.join("Scripts").join("python.exe"),
    ];
    candidates.into_iter().find(|candidate| candidate.is_file())
}

fn venv_bin_dir(venv: &Path) -> PathBuf {
    let scripts = venv.join("Scripts");
    if cfg!(windows) && scripts.is_dir() {
        scripts
    } else {
        venv.join("bin")
    }
}

/// `<venv>/bin/python` -> `<venv>` when a `pyvenv.cfg` marks the directory.
fn venv_root_of(interpreter: &Path) -> Option<PathBuf> {
    let root = interpreter.parent()?.parent()?;
    root.join("pyvenv.cfg")
        .is_file()
        .then(|| root.to_path_buf())
}

fn prepend_to_path(dir: &Path, current: Option<OsString>) -> Option<String> {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(current) = current {
        paths.extend(env::split_paths(&current));
    }
    env::join_paths(paths)
        .ok()
        .map(|joined| joined.to_string_lossy().to_string())
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path).find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        let exe = dir.join(format!("{}.exe", name));
        exe.is_file().then_some(exe)
    })
}
