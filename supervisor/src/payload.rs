//! Turns a validated request into something the interpreter can run.

use crate::render::expression_harness;
use crate::request::{ExecutionRequest, RequestError, RequestKind};
use config_loader::EnvironmentConfig;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Where the interpreter reads its program from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSource {
    /// Generated text, written to a temporary file just before launch.
    Inline(String),
    /// A user script, run in place.
    ScriptFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Payload {
    pub kind: RequestKind,
    pub source: PayloadSource,
    /// Lines injected ahead of the user's code.
    pub line_offset: usize,
    pub args: Vec<String>,
    /// Directory the child starts in.
    pub working_dir: PathBuf,
}

/// Build the runnable payload for `request`.
pub fn build(request: &ExecutionRequest, config: &EnvironmentConfig) -> Result<Payload, RequestError> {
    request.validate()?;

    let (source, line_offset) = match request.kind {
        RequestKind::Code => match config.setup_prelude.as_deref() {
            Some(prelude) if !prelude.is_empty() => {
                let offset = prelude.lines().count();
                (PayloadSource::Inline(with_prelude(prelude, &request.payload)), offset)
            }
            _ => (PayloadSource::Inline(request.payload.clone()), 0),
        },
        RequestKind::Expression => (
            PayloadSource::Inline(expression_harness(request.payload.trim())),
            0,
        ),
        RequestKind::ScriptPath => {
            let path = resolve_script(request)?;
            (PayloadSource::ScriptFile(path), 0)
        }
    };

    let working_dir = match (&request.working_directory, &source) {
        (Some(dir), _) => dir.clone(),
        (None, PayloadSource::ScriptFile(path)) => path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.scratch_dir.clone()),
        (None, PayloadSource::Inline(_)) => config.scratch_dir.clone(),
    };

    Ok(Payload {
        kind: request.kind,
        source,
        line_offset,
        args: request.args.clone(),
        working_dir,
    })
}

/// Insert `prelude` after the leading block that must stay first in a module: the
/// docstring, comments and `from __future__` imports. Code without a future import
/// gets the prelude at the very top.
///
/// Lines after the insertion point shift by exactly the prelude's line count.
fn with_prelude(prelude: &str, code: &str) -> String {
    let (header, body) = code.split_at(future_header_len(code));
    let mut text = String::with_capacity(prelude.len() + code.len() + 2);
    text.push_str(header);
    if !header.is_empty() && !header.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(prelude);
    if !prelude.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(body);
    text
}

/// Byte length of the leading lines up to and including the last `__future__`
/// import, or 0 when the code has none.
fn future_header_len(code: &str) -> usize {
    let mut lines = code.split_inclusive('\n');
    let mut consumed = 0;
    let mut header_end = 0;
    let mut seen_docstring = false;

    while let Some(line) = lines.next() {
        consumed += line.len();
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if is_future_import(trimmed) {
            if trimmed.contains('(') && !trimmed.contains(')') {
                for continued in lines.by_ref() {
                    consumed += continued.len();
                    if continued.contains(')') {
                        break;
                    }
                }
            }
            header_end = consumed;
            continue;
        }

        if !seen_docstring && header_end == 0 {
            if let Some(delimiter) = string_delimiter(trimmed) {
                seen_docstring = true;
                let after_open = &unprefixed(trimmed)[delimiter.len()..];
                if delimiter.len() == 3 && !after_open.contains(delimiter) {
                    for continued in lines.by_ref() {
                        consumed += continued.len();
                        if continued.contains(delimiter) {
                            break;
                        }
                    }
                }
                continue;
            }
        }

        break;
    }

    header_end
}

fn is_future_import(line: &str) -> bool {
    let mut words = line.split_whitespace();
    words.next() == Some("from") && words.next() == Some("__future__")
}

/// Opening quote of a string literal statement, ignoring `r`/`u` prefixes.
fn string_delimiter(line: &str) -> Option<&'static str> {
    let literal = unprefixed(line);
    ["\"\"\"", "'''", "\"", "'"]
        .into_iter()
        .find(|quote| literal.starts_with(*quote))
}

fn unprefixed(line: &str) -> &str {
    line.trim_start_matches(['r', 'R', 'u', 'U'])
}

fn resolve_script(request: &ExecutionRequest) -> Result<PathBuf, RequestError> {
    let raw = PathBuf::from(request.payload.trim());
    let path = if raw.is_absolute() {
        raw
    } else {
        let base = match &request.working_directory {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_default(),
        };
        base.join(raw)
    };

    let metadata = match fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(RequestError::ScriptNotFound { path });
        }
        Err(source) => return Err(RequestError::ScriptUnreadable { path, source }),
    };
    if !metadata.is_file() {
        return Err(RequestError::ScriptNotAFile { path });
    }
    if let Err(source) = File::open(&path) {
        return Err(RequestError::ScriptUnreadable { path, source });
    }

    Ok(fs::canonicalize(&path).unwrap_or(path))
}

/// A program file ready to hand to the interpreter.
///
/// For generated payloads the file is temporary and removed when this value (or the
/// [`TempPath`] taken from it) is dropped.
#[derive(Debug)]
pub struct ProgramFile {
    path: PathBuf,
    temp: Option<TempPath>,
}

impl ProgramFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_temp_path(self) -> Option<TempPath> {
        self.temp
    }
}

impl Payload {
    /// Write inline text to a uniquely named `pyexec_*.py` file inside `scratch_dir`.
    pub fn materialize(&self, scratch_dir: &Path) -> io::Result<ProgramFile> {
        match &self.source {
            PayloadSource::ScriptFile(path) => Ok(ProgramFile {
                path: path.clone(),
                temp: None,
            }),
            PayloadSource::Inline(text) => {
                fs::create_dir_all(scratch_dir)?;
                let mut file = tempfile::Builder::new()
                    .prefix("pyexec_")
                    .suffix(".py")
                    .tempfile_in(scratch_dir)?;
                file.write_all(text.as_bytes())?;
                file.flush()?;
                // Close our handle so the interpreter can open the file on every platform
                let temp = file.into_temp_path();
                Ok(ProgramFile {
                    path: temp.to_path_buf(),
                    temp: Some(temp),
                })
            }
        }
    }
}
