//! Font discovery and the plotting setup prelude prepended to code runs.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const FONT_EXTENSIONS: [&str; 3] = ["ttf", "otf", "ttc"];

static WEIGHT_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)-(Bold|Regular|Light|Medium|Thin|ExtraLight|SemiBold|Black|Heavy|Italic|BoldItalic|LightItalic|SemiBoldItalic|ExtraLightItalic)+$",
    )
    .unwrap()
});
static LOWER_UPPER: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z])([A-Z])").unwrap());
static ACRONYM_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Z]+)([A-Z][a-z])").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontFace {
    pub path: PathBuf,
    pub family: String,
}

/// Derive a family name from a font file name.
///
/// `NotoSansSC-Bold.otf` becomes `Noto Sans SC`.
pub fn extract_font_family(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = WEIGHT_SUFFIX.replace(&stem, "");
    let name = LOWER_UPPER.replace_all(&name, "$1 $2");
    let name = ACRONYM_WORD.replace_all(&name, "$1 $2");
    name.trim().to_string()
}

/// Font files directly inside `dir`, sorted by path. A missing directory yields none.
pub fn discover_fonts(dir: &Path) -> Vec<FontFace> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "Fonts directory not readable");
            return Vec::new();
        }
    };

    let mut faces: Vec<FontFace> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_font_extension(path))
        .map(|path| {
            let absolute = fs::canonicalize(&path).unwrap_or(path);
            let family = absolute
                .file_name()
                .map(|n| extract_font_family(&n.to_string_lossy()))
                .unwrap_or_default();
            FontFace {
                path: absolute,
                family,
            }
        })
        .filter(|face| !face.family.is_empty())
        .collect();

    faces.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(dir = %dir.display(), count = faces.len(), "Discovered fonts");
    faces
}

fn has_font_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            FONT_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Python text selecting the `Agg` backend and registering `faces` with matplotlib.
///
/// Every step sits inside `try` so a missing or broken plotting stack never changes
/// the outcome of the user's code. Strings are embedded as JSON literals, which are
/// valid Python literals.
pub fn build_prelude(faces: &[FontFace], mpl_config_dir: &Path) -> String {
    let font_table: Vec<_> = faces
        .iter()
        .map(|face| json!([face.path.to_string_lossy(), face.family]))
        .collect();
    let font_table = serde_json::Value::Array(font_table).to_string();
    let mpl_dir = json!(mpl_config_dir.to_string_lossy()).to_string();

    format!(
        r#"# pyexec: plotting environment setup
import os as _pyexec_os
_pyexec_os.environ.setdefault("MPLCONFIGDIR", {mpl_dir})
try:
    import matplotlib as _pyexec_mpl
    _pyexec_mpl.use("Agg")
    import matplotlib.font_manager as _pyexec_fm
    _pyexec_families = []
    for _pyexec_path, _pyexec_family in {font_table}:
        try:
            _pyexec_fm.fontManager.addfont(_pyexec_path)
            if _pyexec_family not in _pyexec_families:
                _pyexec_families.append(_pyexec_family)
        except Exception:
            pass
    if _pyexec_families:
        _pyexec_mpl.rcParams["font.sans-serif"] = _pyexec_families + ["DejaVu Sans"]
        _pyexec_mpl.rcParams["axes.unicode_minus"] = False
except Exception:
    pass
"#
    )
}
