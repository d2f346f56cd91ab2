//! Expression evaluation harness and canonical value rendering.
//!
//! The harness evaluates the expression inside the child and appends one trailer line
//! to stdout: [`VALUE_SENTINEL`] followed by a JSON description of the value. The
//! supervisor strips the trailer and renders the description as text.

use serde::Deserialize;
use std::fmt;

/// Marks the trailer line written by the expression harness.
pub const VALUE_SENTINEL: &str = "\u{1e}__pyexec_value__\u{1e}";

// serde_json stops at 128 levels of nesting; a mapping level costs three.
const MAX_DESCRIBE_DEPTH: usize = 32;

/// Python source that evaluates `expression` and reports its value on the trailer line.
pub fn expression_harness(expression: &str) -> String {
    let source = json_literal(expression);
    let sentinel = json_literal(VALUE_SENTINEL);

    format!(
        r#"import json as _pyexec_json
import sys as _pyexec_sys


def _pyexec_describe(value, depth=0):
    type_name = type(value).__name__
    if depth > {MAX_DESCRIBE_DEPTH}:
        return {{"kind": "opaque", "type": type_name}}
    if value is None or isinstance(value, (bool, int, float, complex, str, bytes)):
        return {{"kind": "primitive", "type": type_name, "text": str(value), "repr": repr(value)}}
    if isinstance(value, dict):
        return {{
            "kind": "mapping",
            "type": type_name,
            "entries": [
                [_pyexec_describe(k, depth + 1), _pyexec_describe(v, depth + 1)]
                for k, v in value.items()
            ],
        }}
    if isinstance(value, (list, tuple, set, frozenset)):
        items = list(value)
        if isinstance(value, (set, frozenset)):
            try:
                items = sorted(items)
            except TypeError:
                pass
        return {{
            "kind": "sequence",
            "type": type_name,
            "items": [_pyexec_describe(item, depth + 1) for item in items],
        }}
    return {{"kind": "opaque", "type": type_name}}


_pyexec_value = eval(compile({source}, "<expression>", "eval"))
_pyexec_sys.stdout.write("\n" + {sentinel} + _pyexec_json.dumps(_pyexec_describe(_pyexec_value)) + "\n")
_pyexec_sys.stdout.flush()
"#
    )
}

// A JSON string literal is also a valid Python string literal.
fn json_literal(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

/// Structured description of an evaluated value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Renderable {
    Primitive {
        #[serde(rename = "type")]
        type_name: String,
        text: String,
        repr: String,
    },
    Sequence {
        #[serde(rename = "type")]
        type_name: String,
        items: Vec<Renderable>,
    },
    Mapping {
        #[serde(rename = "type")]
        type_name: String,
        entries: Vec<(Renderable, Renderable)>,
    },
    Opaque {
        #[serde(rename = "type")]
        type_name: String,
    },
}

impl Renderable {
    pub fn type_name(&self) -> &str {
        match self {
            Renderable::Primitive { type_name, .. }
            | Renderable::Sequence { type_name, .. }
            | Renderable::Mapping { type_name, .. }
            | Renderable::Opaque { type_name } => type_name,
        }
    }

    /// Top-level rendering: strings show their text, everything else its literal form.
    pub fn render(&self) -> String {
        match self {
            Renderable::Primitive { text, .. } => text.clone(),
            other => other.literal(),
        }
    }

    /// Literal form used for nested values.
    pub fn literal(&self) -> String {
        match self {
            Renderable::Primitive { repr, .. } => repr.clone(),
            Renderable::Sequence { type_name, items } => {
                let inner = join(items.iter().map(Renderable::literal));
                match type_name.as_str() {
                    "tuple" if items.len() == 1 => format!("({},)", inner),
                    "tuple" => format!("({})", inner),
                    "set" if items.is_empty() => "set()".to_string(),
                    "set" => format!("{{{}}}", inner),
                    "frozenset" if items.is_empty() => "frozenset()".to_string(),
                    "frozenset" => format!("frozenset({{{}}})", inner),
                    _ => format!("[{}]", inner),
                }
            }
            Renderable::Mapping { entries, .. } => {
                let inner = join(
                    entries
                        .iter()
                        .map(|(key, value)| format!("{}: {}", key.literal(), value.literal())),
                );
                format!("{{{}}}", inner)
            }
            Renderable::Opaque { type_name } => format!("<{}>", type_name),
        }
    }
}

impl fmt::Display for Renderable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn join(parts: impl Iterator<Item = String>) -> String {
    parts.collect::<Vec<_>>().join(", ")
}

/// Split harness output into what the expression printed and the reported value.
///
/// Returns `None` when no well-formed trailer is present (for example when evaluation
/// raised before reporting).
pub fn extract_value(stdout: &str) -> Option<(String, Renderable)> {
    let marker = format!("\n{}", VALUE_SENTINEL);
    let start = stdout.rfind(&marker)?;
    let description = stdout[start + marker.len()..].trim_end_matches('\n');
    let value = serde_json::from_str(description).ok()?;
    Some((stdout[..start].to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primitive(type_name: &str, text: &str, repr: &str) -> Renderable {
        Renderable::Primitive {
            type_name: type_name.to_string(),
            text: text.to_string(),
            repr: repr.to_string(),
        }
    }

    fn sequence(type_name: &str, items: Vec<Renderable>) -> Renderable {
        Renderable::Sequence {
            type_name: type_name.to_string(),
            items,
        }
    }

    #[test]
    fn top_level_string_renders_as_text_nested_as_repr() {
        let hello = primitive("str", "hello", "'hello'");
        assert_eq!(hello.render(), "hello");
        assert_eq!(sequence("list", vec![hello]).render(), "['hello']");
    }

    #[test]
    fn tuples_and_sets_follow_literal_syntax() {
        let one = primitive("int", "1", "1");
        let two = primitive("int", "2", "2");

        assert_eq!(sequence("tuple", vec![one.clone()]).render(), "(1,)");
        assert_eq!(
            sequence("tuple", vec![one.clone(), two.clone()]).render(),
            "(1, 2)"
        );
        assert_eq!(sequence("tuple", vec![]).render(), "()");
        assert_eq!(sequence("set", vec![]).render(), "set()");
        assert_eq!(sequence("set", vec![one.clone(), two]).render(), "{1, 2}");
        assert_eq!(
            sequence("frozenset", vec![one]).render(),
            "frozenset({1})"
        );
    }

    #[test]
    fn mappings_and_opaque_values() {
        let mapping = Renderable::Mapping {
            type_name: "dict".to_string(),
            entries: vec![(
                primitive("str", "a", "'a'"),
                Renderable::Opaque {
                    type_name: "function".to_string(),
                },
            )],
        };
        assert_eq!(mapping.render(), "{'a': <function>}");
        assert_eq!(mapping.type_name(), "dict");
    }

    #[test]
    fn extract_value_strips_trailer_and_keeps_printed_text() {
        let stdout = format!(
            "side effect\n\n{}{}\n",
            VALUE_SENTINEL,
            r#"{"kind":"sequence","type":"list","items":[{"kind":"primitive","type":"int","text":"1","repr":"1"}]}"#
        );

        let (printed, value) = extract_value(&stdout).unwrap();

        assert_eq!(printed, "side effect\n");
        assert_eq!(value.render(), "[1]");
        assert_eq!(value.type_name(), "list");
    }

    #[test]
    fn extract_value_without_trailer_is_none() {
        assert!(extract_value("Traceback (most recent call last):\n").is_none());
        let broken = format!("\n{}{{not json", VALUE_SENTINEL);
        assert!(extract_value(&broken).is_none());
    }

    #[test]
    fn harness_embeds_expression_as_literal() {
        let harness = expression_harness("len(\"a\\nb\")");
        assert!(harness.contains(r#"eval(compile("len(\"a\\nb\")", "<expression>", "eval"))"#));
        assert!(harness.contains("depth > 32"));
    }
}
