//! Tool catalogue, argument validation and dispatch into the supervisor.

use crate::protocol::ProtocolError;
use crate::report;
use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use supervisor::{
    Cancellation, ExecutionRequest, InstallRequest, PackageManager, RequestError, Supervisor,
    TimeoutPolicy,
};
use tracing::{info, warn};

pub const PYTHON_EXECUTE: &str = "python_execute";
pub const PYTHON_EVAL: &str = "python_eval";
pub const PYTHON_RUN_SCRIPT: &str = "python_run_script";
pub const PYTHON_INSTALL: &str = "python_install";
pub const PYTHON_LIST_PACKAGES: &str = "python_list_packages";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

static TOOLS: Lazy<Vec<ToolDefinition>> = Lazy::new(|| {
    vec![
        ToolDefinition {
            name: PYTHON_EXECUTE,
            description: "Execute Python code in a fresh interpreter process (not sandboxed; \
                runs with the server's user permissions). Returns exit code, stdout and stderr.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "Python code to execute" },
                    "working_dir": {
                        "type": "string",
                        "description": "Working directory (default: the scratch directory)"
                    },
                    "timeout": {
                        "type": "number",
                        "description": "Timeout in seconds (default: 30)"
                    }
                },
                "required": ["code"]
            }),
        },
        ToolDefinition {
            name: PYTHON_EVAL,
            description: "Evaluate a single Python expression and return its value and type.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "Python expression to evaluate"
                    },
                    "timeout": {
                        "type": "number",
                        "description": "Timeout in seconds (default: 10)"
                    }
                },
                "required": ["expression"]
            }),
        },
        ToolDefinition {
            name: PYTHON_RUN_SCRIPT,
            description: "Run an existing Python script file with optional arguments.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "script_path": {
                        "type": "string",
                        "description": "Path to the Python script"
                    },
                    "args": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Command line arguments for the script"
                    },
                    "working_dir": {
                        "type": "string",
                        "description": "Working directory (default: the script's directory)"
                    },
                    "timeout": {
                        "type": "number",
                        "description": "Timeout in seconds (default: 60)"
                    }
                },
                "required": ["script_path"]
            }),
        },
        ToolDefinition {
            name: PYTHON_INSTALL,
            description: "Install Python packages with pip into the active environment.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "packages": {
                        "type": "string",
                        "description": "Space separated package specifiers, e.g. 'numpy pandas>=2'"
                    },
                    "upgrade": {
                        "type": "boolean",
                        "description": "Upgrade packages that are already installed (default: false)"
                    }
                },
                "required": ["packages"]
            }),
        },
        ToolDefinition {
            name: PYTHON_LIST_PACKAGES,
            description: "List the Python packages installed in the active environment.",
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
    ]
});

/// Input schemas compiled once; a schema that fails to compile keeps its error.
static TOOL_SCHEMAS: Lazy<HashMap<&'static str, Result<JSONSchema, String>>> = Lazy::new(|| {
    TOOLS
        .iter()
        .map(|tool| {
            let compiled = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&tool.input_schema)
                .map_err(|e| e.to_string());
            (tool.name, compiled)
        })
        .collect()
});

pub fn tool_definitions() -> &'static [ToolDefinition] {
    &TOOLS
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecuteArgs {
    pub code: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EvalArgs {
    pub expression: String,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunScriptArgs {
    pub script_path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstallArgs {
    pub packages: String,
    #[serde(default)]
    pub upgrade: bool,
}

/// A validated tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    Execute(ExecuteArgs),
    Eval(EvalArgs),
    RunScript(RunScriptArgs),
    Install(InstallArgs),
    ListPackages,
}

impl ToolCall {
    /// Check `arguments` against the tool's input schema and decode them.
    pub fn parse(name: &str, arguments: Value) -> Result<Self, ProtocolError> {
        let definition = tool_definitions()
            .iter()
            .find(|tool| tool.name == name)
            .ok_or_else(|| ProtocolError::InvalidParams(format!("Unknown tool: {}", name)))?;
        validate_arguments(definition, &arguments)?;

        Ok(match definition.name {
            PYTHON_EXECUTE => ToolCall::Execute(decode(arguments)?),
            PYTHON_EVAL => ToolCall::Eval(decode(arguments)?),
            PYTHON_RUN_SCRIPT => ToolCall::RunScript(decode(arguments)?),
            PYTHON_INSTALL => ToolCall::Install(decode(arguments)?),
            _ => ToolCall::ListPackages,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::Execute(_) => PYTHON_EXECUTE,
            ToolCall::Eval(_) => PYTHON_EVAL,
            ToolCall::RunScript(_) => PYTHON_RUN_SCRIPT,
            ToolCall::Install(_) => PYTHON_INSTALL,
            ToolCall::ListPackages => PYTHON_LIST_PACKAGES,
        }
    }
}

fn validate_arguments(definition: &ToolDefinition, arguments: &Value) -> Result<(), ProtocolError> {
    let schema = match TOOL_SCHEMAS.get(definition.name) {
        Some(Ok(schema)) => schema,
        Some(Err(message)) => {
            return Err(ProtocolError::Internal(format!(
                "tool schema for {}: {}",
                definition.name, message
            )))
        }
        None => {
            return Err(ProtocolError::Internal(format!(
                "no compiled schema for {}",
                definition.name
            )))
        }
    };

    if let Err(errors) = schema.validate(arguments) {
        let messages: Vec<String> = errors
            .map(|error| {
                let pointer = error.instance_path.to_string();
                if pointer.is_empty() {
                    error.to_string()
                } else {
                    format!("{}: {}", pointer, error)
                }
            })
            .collect();
        return Err(ProtocolError::InvalidParams(format!(
            "{} arguments: {}",
            definition.name,
            messages.join("; ")
        )));
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(arguments: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(arguments).map_err(|e| ProtocolError::InvalidParams(e.to_string()))
}

/// Text content of a tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    fn new(text: String, is_error: bool) -> Self {
        Self { text, is_error }
    }

    fn rejected(error: &RequestError) -> Self {
        Self::new(report::invalid_request_report(error), true)
    }

    pub fn into_result(self) -> Value {
        json!({
            "content": [{ "type": "text", "text": self.text }],
            "isError": self.is_error,
        })
    }
}

/// Run a validated call to completion and render its report.
pub async fn run(
    call: ToolCall,
    supervisor: &Supervisor,
    packages: &dyn PackageManager,
    cancellation: Cancellation,
) -> ToolOutput {
    match call {
        ToolCall::Execute(args) => {
            let request = match TimeoutPolicy::from_seconds(args.timeout) {
                Ok(timeout) => {
                    let mut request = ExecutionRequest::code(args.code).with_timeout(timeout);
                    request.working_directory = args.working_dir;
                    request
                }
                Err(err) => return ToolOutput::rejected(&err),
            };
            match supervisor.execute_with_cancel(request, cancellation).await {
                Ok(outcome) => ToolOutput::new(
                    report::execution_report(&outcome),
                    !outcome.is_success(),
                ),
                Err(err) => ToolOutput::rejected(&err),
            }
        }
        ToolCall::Eval(args) => {
            let timeout = match TimeoutPolicy::from_seconds(args.timeout) {
                Ok(timeout) => timeout,
                Err(err) => return ToolOutput::rejected(&err),
            };
            let request = ExecutionRequest::expression(args.expression.clone()).with_timeout(timeout);
            match supervisor.execute_with_cancel(request, cancellation).await {
                Ok(outcome) => ToolOutput::new(
                    report::eval_report(args.expression.trim(), &outcome),
                    !outcome.is_success(),
                ),
                Err(err) => ToolOutput::rejected(&err),
            }
        }
        ToolCall::RunScript(args) => {
            let timeout = match TimeoutPolicy::from_seconds(args.timeout) {
                Ok(timeout) => timeout,
                Err(err) => return ToolOutput::rejected(&err),
            };
            let mut request = ExecutionRequest::script(args.script_path.clone())
                .with_args(args.args.clone())
                .with_timeout(timeout);
            request.working_directory = args.working_dir;
            match supervisor.execute_with_cancel(request, cancellation).await {
                Ok(outcome) => ToolOutput::new(
                    report::script_report(&args.script_path, &args.args, &outcome),
                    !outcome.is_success(),
                ),
                Err(err) => ToolOutput::rejected(&err),
            }
        }
        ToolCall::Install(args) => {
            let request = match InstallRequest::parse(&args.packages, args.upgrade) {
                Ok(request) => request,
                Err(err) => return ToolOutput::rejected(&err),
            };
            let command_line = request.command_line(&supervisor.config().interpreter);
            info!(command = %command_line, "Installing packages");
            let outcome = packages.install(&request, cancellation).await;
            ToolOutput::new(
                report::install_report(&command_line, &outcome),
                !outcome.is_success(),
            )
        }
        ToolCall::ListPackages => match packages.list().await {
            Ok(installed) => ToolOutput::new(report::packages_report(&installed), false),
            Err(err) => {
                warn!(error = %err, "Package listing failed");
                ToolOutput::new(report::listing_error_report(&err), true)
            }
        },
    }
}
