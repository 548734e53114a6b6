//! Externally configured MCP servers (declared in a TOML file by the operator).
//!
//! These are trusted collaborators: they are spawned with the host
//! environment and are not validated or sandboxed. They take routing
//! priority over AI-created servers.

use super::mcp::{ClientOptions, McpClient, RpcError};
use super::mcp_protocol::{CallToolResult, McpConfigFile, McpServerConfig};
use super::mcp_transport::{self, StdioTransport, TransportFault};
use anyhow::{Context, Result};
use kiln_shared::{KilnError, KilnResult, ServerState, ToolSchema};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

const CONNECT_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum ExternalStatus {
    Connected,
    Error(String),
}

/// Public info about a configured server.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExternalServerInfo {
    pub id: String,
    pub command: String,
    pub status: ExternalStatus,
    pub tools: Vec<String>,
}

struct ExternalHandle {
    config: McpServerConfig,
    client: Option<Arc<McpClient>>,
    tools: Vec<ToolSchema>,
    status: ExternalStatus,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ExternalHandle {
    fn state(&self) -> ServerState {
        match self.status {
            ExternalStatus::Connected => ServerState::Running,
            ExternalStatus::Error(_) => ServerState::Crashed,
        }
    }

    fn serves(&self, client: &Weak<McpClient>) -> bool {
        self.client
            .as_ref()
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), client.as_ptr()))
    }
}

/// Handles and routing index, shared with the process watchers.
/// Lock order: `servers` before `tool_index`.
#[derive(Default)]
struct Registry {
    servers: RwLock<HashMap<String, ExternalHandle>>,
    /// Tool name → server ID index for fast routing
    tool_index: RwLock<HashMap<String, String>>,
}

impl Registry {
    /// Mark the handle served by `client` as dead and stop routing to it.
    /// A handle that has since reconnected with another client is left alone.
    async fn mark_exited(&self, id: &str, client: &Weak<McpClient>, reason: String) {
        let mut servers = self.servers.write().await;
        let Some(handle) = servers.get_mut(id) else {
            return;
        };
        if !handle.serves(client) {
            return;
        }
        handle.client = None;
        handle.kill_tx = None;
        handle.status = ExternalStatus::Error(reason);
        self.tool_index.write().await.retain(|_, owner| owner != id);
        warn!(server = %id, "External MCP server marked dead, tools unrouted");
    }
}

pub struct ExternalServers {
    registry: Arc<Registry>,
    options: ClientOptions,
    handshake_timeout: Duration,
}

impl ExternalServers {
    #[must_use]
    pub fn new(options: ClientOptions, handshake_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            options,
            handshake_timeout,
        }
    }

    /// Load server configs from a TOML file (if it exists) and connect each.
    /// Individual connection failures are recorded, not returned.
    pub async fn load_config_file(&self, config_path: &Path) -> Result<()> {
        if !config_path.exists() {
            info!("No MCP config file at {}, skipping", config_path.display());
            return Ok(());
        }

        let content =
            std::fs::read_to_string(config_path).context("Failed to read MCP config file")?;
        let config: McpConfigFile =
            toml::from_str(&content).context("Failed to parse MCP config file")?;

        let total = config.servers.len();
        info!(
            "Loading {} external MCP server(s) from {}",
            total,
            config_path.display()
        );

        let mut failed = 0usize;
        for server_config in config.servers {
            if let Err(e) = self.connect(server_config.clone()).await {
                failed += 1;
                warn!(
                    id = %server_config.id,
                    error = %format!("{e:#}"),
                    "Failed to connect MCP server from config"
                );
                // Keep it listed with its error
                self.registry
                    .servers
                    .write()
                    .await
                    .entry(server_config.id.clone())
                    .or_insert_with(|| ExternalHandle {
                        config: server_config,
                        client: None,
                        tools: Vec::new(),
                        status: ExternalStatus::Error(format!("{e:#}")),
                        kill_tx: None,
                    });
            }
        }

        if failed > 0 {
            warn!(
                total = total,
                failed = failed,
                "MCP config loaded with failures ({}/{} servers failed)",
                failed,
                total
            );
        }
        Ok(())
    }

    /// Spawn, handshake and index one server, retrying a few times.
    pub async fn connect(&self, config: McpServerConfig) -> Result<Vec<String>> {
        mcp_transport::validate_command(&config.command)?;
        {
            let servers = self.registry.servers.read().await;
            if let Some(existing) = servers.get(&config.id) {
                if existing.status == ExternalStatus::Connected {
                    anyhow::bail!("MCP server '{}' is already connected", config.id);
                }
            }
        }

        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.try_connect(&config).await {
                Ok(connected) => return Ok(self.register(config, connected).await),
                Err(e) => {
                    debug!(id = %config.id, attempt, error = %format!("{e:#}"), "Connect attempt failed");
                    last_err = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no connection attempts made")))
    }

    async fn try_connect(&self, config: &McpServerConfig) -> Result<Connected> {
        let transport = StdioTransport::start(config)?;
        let (child, channel, faults) = transport.into_parts();
        let client = Arc::new(McpClient::new(channel, self.options));
        let (kill_tx, kill_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));
        tokio::spawn(watch_process(
            Watched {
                id: config.id.clone(),
                client: Arc::downgrade(&client),
                exited: exited.clone(),
                registry: self.registry.clone(),
            },
            child,
            faults,
            kill_rx,
        ));

        let handshake = tokio::time::timeout(self.handshake_timeout, async {
            client.initialize().await?;
            client.list_tools().await
        })
        .await;
        let tools = match handshake {
            Ok(Ok(list)) => list.tools.into_iter().map(ToolSchema::from).collect(),
            Ok(Err(e)) => {
                let _ = kill_tx.send(());
                return Err(anyhow::anyhow!("handshake failed: {e}"));
            }
            Err(_) => {
                let _ = kill_tx.send(());
                anyhow::bail!(
                    "handshake timed out after {}s",
                    self.handshake_timeout.as_secs()
                );
            }
        };
        Ok(Connected {
            client,
            tools,
            kill_tx,
            exited,
        })
    }

    async fn register(&self, config: McpServerConfig, connected: Connected) -> Vec<String> {
        let id = config.id.clone();
        let names: Vec<String> = connected.tools.iter().map(|t| t.name.clone()).collect();
        let mut servers = self.registry.servers.write().await;
        let mut index = self.registry.tool_index.write().await;
        index.retain(|_, owner| owner != &id);

        // The watcher sets the flag before taking the lock, so an exit that
        // raced the handshake is seen either here or by the watcher.
        if connected.exited.load(Ordering::SeqCst) {
            warn!(server = %id, "External MCP server exited right after connecting");
            servers.insert(
                id,
                ExternalHandle {
                    config,
                    client: None,
                    tools: connected.tools,
                    status: ExternalStatus::Error("process exited".to_string()),
                    kill_tx: None,
                },
            );
            return Vec::new();
        }

        for name in &names {
            if let Some(existing) = index.insert(name.clone(), id.clone()) {
                if existing != id {
                    warn!(
                        tool = %name,
                        existing_server = %existing,
                        new_server = %id,
                        "Tool name collision, overwriting routing"
                    );
                }
            }
        }
        servers.insert(
            id.clone(),
            ExternalHandle {
                config,
                client: Some(connected.client),
                tools: connected.tools,
                status: ExternalStatus::Connected,
                kill_tx: Some(connected.kill_tx),
            },
        );
        info!(server = %id, tools = names.len(), "External MCP server connected");
        names
    }

    pub async fn find_tool_owner(&self, tool: &str) -> Option<String> {
        self.registry.tool_index.read().await.get(tool).cloned()
    }

    /// Tools of every connected server.
    pub async fn tools(&self) -> Vec<ToolSchema> {
        self.registry
            .servers
            .read()
            .await
            .values()
            .filter(|h| h.status == ExternalStatus::Connected)
            .flat_map(|h| h.tools.iter().cloned())
            .collect()
    }

    pub async fn list(&self) -> Vec<ExternalServerInfo> {
        let servers = self.registry.servers.read().await;
        let mut infos: Vec<ExternalServerInfo> = servers
            .values()
            .map(|h| ExternalServerInfo {
                id: h.config.id.clone(),
                command: h.config.command.clone(),
                status: h.status.clone(),
                tools: h.tools.iter().map(|t| t.name.clone()).collect(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        args: Value,
    ) -> KilnResult<CallToolResult> {
        let client = {
            let servers = self.registry.servers.read().await;
            let handle = servers
                .get(server_id)
                .ok_or_else(|| KilnError::ServerNotFound(server_id.to_string()))?;
            handle.client.clone().ok_or_else(|| KilnError::NotRunning {
                id: server_id.to_string(),
                state: handle.state(),
            })?
        };

        client.call_tool(tool_name, args).await.map_err(|e| match e {
            RpcError::Timeout(d) => KilnError::DispatchTimeout {
                tool: tool_name.to_string(),
                secs: d.as_secs(),
            },
            RpcError::Remote { message, .. } => KilnError::Tool(message),
            RpcError::Closed => KilnError::NotRunning {
                id: server_id.to_string(),
                state: ServerState::Crashed,
            },
            RpcError::Malformed(m) => KilnError::Protocol(m),
        })
    }

    /// Kill every connected server.
    pub async fn shutdown(&self) {
        let mut servers = self.registry.servers.write().await;
        for handle in servers.values_mut() {
            handle.client = None;
            handle.status = ExternalStatus::Error("shut down".to_string());
            if let Some(tx) = handle.kill_tx.take() {
                let _ = tx.send(());
            }
        }
        self.registry.tool_index.write().await.clear();
    }
}

struct Connected {
    client: Arc<McpClient>,
    tools: Vec<ToolSchema>,
    kill_tx: oneshot::Sender<()>,
    exited: Arc<AtomicBool>,
}

/// What a process watcher needs to retire its server on exit.
struct Watched {
    id: String,
    client: Weak<McpClient>,
    exited: Arc<AtomicBool>,
    registry: Arc<Registry>,
}

/// Reap an external server and report what happened to it. An exit that
/// was not requested through `kill_rx` takes the server out of routing.
async fn watch_process(
    watched: Watched,
    mut child: Child,
    mut faults: mpsc::UnboundedReceiver<TransportFault>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let id = watched.id.as_str();
    let mut faults_open = true;
    loop {
        tokio::select! {
            fault = faults.recv(), if faults_open => match fault {
                Some(TransportFault::ProtocolViolation(line)) => {
                    warn!(server = %id, line = %line, "External server wrote non-JSON to stdout");
                }
                Some(TransportFault::ImportBlocked(module)) => {
                    warn!(server = %id, module = %module, "External server reported a blocked import");
                }
                None => faults_open = false,
            },
            _ = &mut kill_rx => {
                let _ = child.kill().await;
                debug!(server = %id, "External server killed");
                return;
            }
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => {
                        warn!(server = %id, %status, "External MCP server exited");
                        format!("process exited ({status})")
                    }
                    Err(e) => {
                        warn!(server = %id, error = %e, "Failed to wait for external MCP server");
                        format!("process lost: {e}")
                    }
                };
                watched.exited.store(true, Ordering::SeqCst);
                watched
                    .registry
                    .mark_exited(id, &watched.client, reason)
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> ExternalServers {
        ExternalServers::new(ClientOptions::default(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_missing_config_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ext = servers();
        ext.load_config_file(&dir.path().join("mcp.toml")).await.unwrap();
        assert!(ext.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.toml");
        std::fs::write(&path, "[[servers]\nid = ").unwrap();
        assert!(servers().load_config_file(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_disallowed_command_is_recorded_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.toml");
        std::fs::write(
            &path,
            "[[servers]]\nid = \"shell\"\ncommand = \"bash\"\nargs = [\"-c\", \"true\"]\n",
        )
        .unwrap();
        let ext = servers();
        ext.load_config_file(&path).await.unwrap();

        let list = ext.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "shell");
        assert!(matches!(list[0].status, ExternalStatus::Error(_)));
        assert!(ext.tools().await.is_empty());
    }

    /// Answers the handshake, then exits.
    const SHORT_LIVED_SERVER: &str = r#"
import json, sys, time
for line in sys.stdin:
    msg = json.loads(line)
    if "id" not in msg:
        continue
    if msg["method"] == "initialize":
        result = {"protocolVersion": "2024-11-05", "capabilities": {}, "serverInfo": {"name": "brief", "version": "0"}}
    else:
        result = {"tools": [{"name": "brief_echo", "inputSchema": {"type": "object"}}]}
    print(json.dumps({"jsonrpc": "2.0", "id": msg["id"], "result": result}), flush=True)
    if msg["method"] == "tools/list":
        time.sleep(0.3)
        break
"#;

    #[tokio::test]
    async fn test_exited_server_is_retired() {
        if !crate::test_utils::python_available() {
            eprintln!("python3 not available, skipping");
            return;
        }
        let ext = servers();
        let tools = ext
            .connect(McpServerConfig {
                id: "brief".to_string(),
                command: "python3".to_string(),
                args: vec!["-c".to_string(), SHORT_LIVED_SERVER.to_string()],
                env: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(tools, vec!["brief_echo".to_string()]);

        let retired = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if matches!(ext.list().await[0].status, ExternalStatus::Error(_)) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(retired.is_ok(), "exit was never noticed");
        assert!(ext.tools().await.is_empty());
        assert_eq!(ext.find_tool_owner("brief_echo").await, None);

        let started = std::time::Instant::now();
        let err = ext
            .call_tool("brief", "brief_echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, KilnError::NotRunning { state: ServerState::Crashed, .. }),
            "{err}"
        );
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_call_unknown_server() {
        let err = servers()
            .call_tool("nope", "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ServerNotFound(_)));
    }
}
