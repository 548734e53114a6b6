//! The `mcp_server_*` tools through which the model manages its own servers.
//!
//! Every outcome, errors included, is returned as text for the model to read.

use super::ai_servers::AiServers;
use super::router::BuiltinHandler;
use super::supervisor::Redeployed;
use crate::sandbox::policy;
use crate::validation::{
    CreateServerRequest, EditServerRequest, ServerLogsRequest, ServerNameRequest,
};
use async_trait::async_trait;
use kiln_shared::{KilnError, KilnResult, ServerState, ToolSchema};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

pub const CREATE: &str = "mcp_server_create";
pub const EDIT: &str = "mcp_server_edit";
pub const DELETE: &str = "mcp_server_delete";
pub const LIST: &str = "mcp_server_list";
pub const START: &str = "mcp_server_start";
pub const STOP: &str = "mcp_server_stop";
pub const LOGS: &str = "mcp_server_logs";

const TOOL_NAMES: &[&str] = &[CREATE, EDIT, DELETE, LIST, START, STOP, LOGS];

fn create_description() -> String {
    format!(
        "Create a new MCP tool server from Python code. \
The server runs in a sandbox and speaks newline-delimited JSON-RPC (MCP) on stdin/stdout. \
Allowed imports: {}. With allow_network also: {}. \
For file storage use os.environ['MCP_SANDBOX_DIR'] as the directory path.",
        policy::ALLOWED_MODULES.join(", "),
        policy::NETWORK_MODULES.join(", "),
    )
}

fn name_property() -> Value {
    json!({ "type": "string", "description": "Server name." })
}

fn name_only_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "name": name_property() },
        "required": ["name"],
    })
}

fn tool(name: &str, description: &str, input_schema: Value) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

fn tool_list(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

fn tool_names(tools: &[ToolSchema]) -> Vec<String> {
    tools.iter().map(|t| t.name.clone()).collect()
}

fn parse<T: DeserializeOwned>(args: Value) -> KilnResult<T> {
    serde_json::from_value(args).map_err(|e| KilnError::InvalidRequest(e.to_string()))
}

pub struct ManagementTools {
    servers: Arc<AiServers>,
}

impl ManagementTools {
    #[must_use]
    pub fn new(servers: Arc<AiServers>) -> Self {
        Self { servers }
    }

    async fn create(&self, args: Value) -> KilnResult<String> {
        let req: CreateServerRequest = parse(args)?;
        let created = self.servers.create(req).await?;
        let name = &created.definition.id;
        Ok(match created.started {
            Some(Ok(tools)) => format!(
                "Server '{name}' created and started. Tools: {}",
                tool_list(&tool_names(&tools))
            ),
            Some(Err(e)) => format!("Server '{name}' created but failed to start: {e}"),
            None => format!("Server '{name}' created (not started)."),
        })
    }

    async fn edit(&self, args: Value) -> KilnResult<String> {
        let req: EditServerRequest = parse(args)?;
        let name = req.name.clone();
        Ok(match self.servers.edit(req).await? {
            Redeployed::Rebuilt => format!("Server '{name}' updated (not running)."),
            Redeployed::Restarted(tools) => format!(
                "Server '{name}' updated and restarted. Tools: {}",
                tool_list(&tool_names(&tools))
            ),
            Redeployed::RestartFailed(e) => {
                format!("Server '{name}' updated but failed to restart: {e}")
            }
        })
    }

    async fn delete(&self, args: Value) -> KilnResult<String> {
        let req: ServerNameRequest = parse(args)?;
        crate::validation::validate_request(&req).map_err(KilnError::InvalidRequest)?;
        self.servers.delete(&req.name).await?;
        Ok(format!("Server '{}' deleted.", req.name))
    }

    async fn list(&self) -> String {
        let statuses = self.servers.list().await;
        if statuses.is_empty() {
            return "No AI-created MCP servers.".to_string();
        }
        statuses
            .iter()
            .map(|s| {
                let mut parts = vec![format!("**{}** [{}]", s.id, s.state)];
                if !s.description.is_empty() {
                    parts.push(format!("  {}", s.description));
                }
                if s.state == ServerState::Running && !s.tools.is_empty() {
                    parts.push(format!("  Tools: {}", s.tools.join(", ")));
                }
                if s.state == ServerState::Crashed {
                    if let Some(err) = &s.last_error {
                        parts.push(format!("  Last error: {err}"));
                    }
                }
                parts.join("\n")
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    async fn start(&self, args: Value) -> KilnResult<String> {
        let req: ServerNameRequest = parse(args)?;
        crate::validation::validate_request(&req).map_err(KilnError::InvalidRequest)?;
        match self.servers.start(&req.name).await {
            Ok(tools) => Ok(format!(
                "Server '{}' started. Tools: {}",
                req.name,
                tool_list(&tool_names(&tools))
            )),
            Err(KilnError::AlreadyRunning(_)) => {
                Ok(format!("Server '{}' is already running.", req.name))
            }
            Err(e) => Err(e),
        }
    }

    async fn stop(&self, args: Value) -> KilnResult<String> {
        let req: ServerNameRequest = parse(args)?;
        crate::validation::validate_request(&req).map_err(KilnError::InvalidRequest)?;
        Ok(if self.servers.stop(&req.name).await? {
            format!("Server '{}' stopped.", req.name)
        } else {
            format!("Server '{}' is not running.", req.name)
        })
    }

    async fn logs(&self, args: Value) -> KilnResult<String> {
        let req: ServerLogsRequest = parse(args)?;
        let name = req.name.clone();
        let lines = self.servers.logs(req).await?;
        Ok(if lines.is_empty() {
            format!("No logs for server '{name}'.")
        } else {
            lines.join("\n")
        })
    }
}

#[async_trait]
impl BuiltinHandler for ManagementTools {
    fn schemas(&self) -> Vec<ToolSchema> {
        vec![
            tool(
                CREATE,
                &create_description(),
                json!({
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Server name: a letter followed by letters, digits or underscores (max 64).",
                        },
                        "code": { "type": "string", "description": "Python source code." },
                        "description": { "type": "string", "description": "What the server does." },
                        "auto_start": {
                            "type": "boolean",
                            "description": "Start now and on every boot (default true).",
                        },
                        "allow_network": {
                            "type": "boolean",
                            "description": "Allow network modules (only if the operator enabled it).",
                        },
                    },
                    "required": ["name", "code", "description"],
                }),
            ),
            tool(
                EDIT,
                "Update the code of an existing AI-created MCP server. Automatically restarts if running.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": name_property(),
                        "code": { "type": "string", "description": "New Python source code." },
                    },
                    "required": ["name", "code"],
                }),
            ),
            tool(
                DELETE,
                "Delete an AI-created MCP server and all its files.",
                name_only_schema(),
            ),
            tool(
                LIST,
                "List all AI-created MCP servers with their status and tools.",
                json!({ "type": "object", "properties": {} }),
            ),
            tool(START, "Start a stopped AI-created MCP server.", name_only_schema()),
            tool(STOP, "Stop a running AI-created MCP server.", name_only_schema()),
            tool(
                LOGS,
                "Get recent stderr output from an AI-created MCP server for debugging.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": name_property(),
                        "lines": {
                            "type": "integer",
                            "description": "Number of recent log lines (default 50, max 200).",
                        },
                    },
                    "required": ["name"],
                }),
            ),
        ]
    }

    fn handles(&self, tool: &str) -> bool {
        TOOL_NAMES.contains(&tool)
    }

    async fn call(&self, tool: &str, args: Value) -> KilnResult<String> {
        let outcome = match tool {
            CREATE => self.create(args).await,
            EDIT => self.edit(args).await,
            DELETE => self.delete(args).await,
            LIST => Ok(self.list().await),
            START => self.start(args).await,
            STOP => self.stop(args).await,
            LOGS => self.logs(args).await,
            other => return Err(KilnError::ToolNotFound(other.to_string())),
        };
        Ok(outcome.unwrap_or_else(|e| match e {
            KilnError::Validation(_) => e.to_string(),
            other => format!("Error: {other}"),
        }))
    }
}
