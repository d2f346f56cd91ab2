//! Model Context Protocol front end for the pyexec supervisor.
//!
//! Speaks newline-delimited JSON-RPC 2.0 over stdio and exposes five tools:
//! `python_execute`, `python_eval`, `python_run_script`, `python_install` and
//! `python_list_packages`.

pub mod config;
pub mod protocol;
pub mod report;
pub mod server;
pub mod tools;

pub use config::ServerConfig;
pub use protocol::{Incoming, ProtocolError, Response, RpcError};
pub use server::{McpServer, SERVER_NAME};
pub use tools::{tool_definitions, ToolCall, ToolDefinition, ToolOutput};
