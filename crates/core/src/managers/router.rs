//! Name-based dispatch of tool calls.
//!
//! Resolution order is fixed: built-in handlers, then externally configured
//! servers, then AI-created servers.

use super::external::ExternalServers;
use super::mcp_protocol::CallToolResult;
use super::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use kiln_shared::{KilnError, KilnResult, ToolSchema};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const EMPTY_RESULT_TEXT: &str = "Tool returned no output.";

/// Tools implemented inside the host process.
#[async_trait]
pub trait BuiltinHandler: Send + Sync {
    fn schemas(&self) -> Vec<ToolSchema>;

    fn handles(&self, tool: &str) -> bool {
        self.schemas().iter().any(|s| s.name == tool)
    }

    async fn call(&self, tool: &str, args: Value) -> KilnResult<String>;
}

/// Where a tool name resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolTarget {
    /// Index into the router's built-in handlers.
    BuiltIn(usize),
    External(String),
    AiServer(String),
}

pub struct ToolRouter {
    builtins: Vec<Arc<dyn BuiltinHandler>>,
    external: Arc<ExternalServers>,
    supervisor: Arc<ProcessSupervisor>,
}

impl ToolRouter {
    #[must_use]
    pub fn new(
        builtins: Vec<Arc<dyn BuiltinHandler>>,
        external: Arc<ExternalServers>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        Self {
            builtins,
            external,
            supervisor,
        }
    }

    pub async fn resolve(&self, tool: &str) -> Option<ToolTarget> {
        if let Some(i) = self.builtins.iter().position(|h| h.handles(tool)) {
            return Some(ToolTarget::BuiltIn(i));
        }
        if let Some(id) = self.external.find_tool_owner(tool).await {
            return Some(ToolTarget::External(id));
        }
        self.supervisor
            .find_tool_owner(tool)
            .map(ToolTarget::AiServer)
    }

    /// Invoke `tool` and return its text result.
    pub async fn dispatch(&self, tool: &str, args: Value) -> KilnResult<String> {
        let target = self
            .resolve(tool)
            .await
            .ok_or_else(|| KilnError::ToolNotFound(tool.to_string()))?;
        debug!(tool = %tool, target = ?target, "Dispatching tool call");

        match target {
            ToolTarget::BuiltIn(i) => self.builtins[i].call(tool, args).await,
            ToolTarget::External(id) => {
                let result = self.external.call_tool(&id, tool, args).await?;
                result_text(tool, &result)
            }
            ToolTarget::AiServer(id) => {
                match self.supervisor.call_tool(&id, tool, args).await {
                    Ok(result) => result_text(tool, &result),
                    Err(e @ KilnError::DispatchTimeout { .. }) => {
                        self.recover_if_unresponsive(&id).await;
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Restart a server in the background once its timeouts pile up.
    async fn recover_if_unresponsive(&self, id: &str) {
        if !self.supervisor.is_unresponsive(id).await {
            return;
        }
        warn!(server = %id, "Server unresponsive across repeated timeouts, restarting");
        let supervisor = self.supervisor.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            match supervisor.recover_unresponsive(&id).await {
                Ok(Some(tools)) => {
                    info!(server = %id, tools = tools.len(), "Unresponsive server restarted")
                }
                Ok(None) => debug!(server = %id, "Server already recovered"),
                Err(e) => error!(server = %id, error = %e, "Failed to restart unresponsive server"),
            }
        });
    }

    /// Every routable tool in function-calling format, in resolution order.
    /// A name shadowed by a higher-priority source is listed once.
    pub async fn function_schemas(&self) -> Vec<Value> {
        let mut seen = HashSet::new();
        let mut schemas = Vec::new();
        let builtin = self.builtins.iter().flat_map(|h| h.schemas());
        let external = self.external.tools().await;
        let ai = self.supervisor.running_tools().await;
        for tool in builtin.chain(external).chain(ai) {
            if seen.insert(tool.name.clone()) {
                schemas.push(tool.to_function_schema());
            } else {
                debug!(tool = %tool.name, "Tool shadowed by a higher-priority source");
            }
        }
        schemas
    }
}

/// Text of a `tools/call` result; `isError` becomes a tool error.
pub fn result_text(tool: &str, result: &CallToolResult) -> KilnResult<String> {
    let text = result.joined_text();
    if result.is_error == Some(true) {
        return Err(KilnError::Tool(if text.is_empty() {
            format!("'{tool}' reported an error")
        } else {
            text
        }));
    }
    if text.is_empty() {
        Ok(EMPTY_RESULT_TEXT.to_string())
    } else {
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::mcp::ClientOptions;
    use crate::managers::mcp_protocol::ToolContent;
    use crate::managers::supervisor::SupervisorOptions;
    use crate::sandbox::SandboxBuilder;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl BuiltinHandler for Echo {
        fn schemas(&self) -> Vec<ToolSchema> {
            vec![ToolSchema {
                name: "echo".into(),
                description: "Echo the input".into(),
                input_schema: serde_json::json!({ "type": "object" }),
            }]
        }

        async fn call(&self, _tool: &str, args: Value) -> KilnResult<String> {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn router(dir: &std::path::Path) -> ToolRouter {
        let options = SupervisorOptions {
            start_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(1),
            max_consecutive_timeouts: 3,
            client: ClientOptions::default(),
        };
        ToolRouter::new(
            vec![Arc::new(Echo)],
            Arc::new(ExternalServers::new(ClientOptions::default(), Duration::from_secs(1))),
            Arc::new(ProcessSupervisor::new(
                SandboxBuilder::new(dir, "python3"),
                options,
            )),
        )
    }

    #[tokio::test]
    async fn test_builtin_resolves_first() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        assert_eq!(router.resolve("echo").await, Some(ToolTarget::BuiltIn(0)));
        let out = router
            .dispatch("echo", serde_json::json!({ "text": "hi" }))
            .await
            .unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dir = tempfile::tempdir().unwrap();
        let err = router(dir.path())
            .dispatch("missing", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ToolNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_function_schemas_lists_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let schemas = router(dir.path()).function_schemas().await;
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0]["function"]["name"], "echo");
    }

    #[test]
    fn test_result_text() {
        let ok = CallToolResult {
            content: vec![
                ToolContent::Text { text: "a".into() },
                ToolContent::Text { text: "b".into() },
            ],
            is_error: None,
        };
        assert_eq!(result_text("t", &ok).unwrap(), "a\nb");

        let empty = CallToolResult {
            content: vec![],
            is_error: Some(false),
        };
        assert_eq!(result_text("t", &empty).unwrap(), EMPTY_RESULT_TEXT);

        let failed = CallToolResult {
            content: vec![ToolContent::Text { text: "bad input".into() }],
            is_error: Some(true),
        };
        let err = result_text("t", &failed).unwrap_err();
        assert!(matches!(err, KilnError::Tool(msg) if msg == "bad input"));
    }
}
