//! Lifecycle of AI-created server processes.
//!
//! One [`ServerSlot`] per server id holds the lifecycle state, the running
//! process (if any) and the tools it advertised. Transitions for one id are
//! serialised by the slot's own transition lock; different ids never share a
//! lock. Each spawned process is owned by a monitor task that reaps it and
//! reports unexpected exits, runtime import blocks and protocol violations.

use super::mcp::{ClientOptions, McpClient, RpcError};
use super::mcp_protocol::CallToolResult;
use super::mcp_transport::{StdioTransport, TransportFault};
use crate::fsio;
use crate::sandbox::SandboxBuilder;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kiln_shared::{KilnError, KilnResult, ServerDefinition, ServerState, ToolSchema};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Log lines attached to a start failure.
const START_FAILURE_TAIL: usize = 20;

/// How long a monitor keeps reading pipe faults after its process is gone.
const FAULT_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub start_timeout: Duration,
    pub stop_grace: Duration,
    pub max_consecutive_timeouts: u32,
    pub client: ClientOptions,
}

impl SupervisorOptions {
    #[must_use]
    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self {
            start_timeout: config.start_timeout(),
            stop_grace: config.stop_grace(),
            max_consecutive_timeouts: config.max_consecutive_timeouts,
            client: ClientOptions {
                request_timeout: config.tool_timeout(),
                max_in_flight: config.max_in_flight,
            },
        }
    }
}

/// Runtime view of one server, as reported by `list()`.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub state: ServerState,
    pub tools: Vec<ToolSchema>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Outcome of [`ProcessSupervisor::redeploy`].
#[derive(Debug)]
pub enum Redeployed {
    /// The server was not running; only its instance was rewritten.
    Rebuilt,
    Restarted(Vec<ToolSchema>),
    /// The new instance is in place but its process failed to start.
    RestartFailed(KilnError),
}

struct StopRequest {
    graceful: bool,
    ack: oneshot::Sender<()>,
}

struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    client: Arc<McpClient>,
    stop_tx: Option<oneshot::Sender<StopRequest>>,
}

#[derive(Default)]
struct SlotInner {
    process: Option<ProcessHandle>,
    definition: Option<ServerDefinition>,
    tools: Vec<ToolSchema>,
    last_error: Option<String>,
    blocked_import: Option<String>,
}

struct ServerSlot {
    transition: Mutex<()>,
    state: watch::Sender<ServerState>,
    generation: AtomicU64,
    inner: RwLock<SlotInner>,
}

impl ServerSlot {
    fn new() -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            transition: Mutex::new(()),
            state,
            generation: AtomicU64::new(0),
            inner: RwLock::new(SlotInner::default()),
        }
    }

    fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ServerState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "State transition");
        }
    }
}

pub struct ProcessSupervisor {
    builder: SandboxBuilder,
    options: SupervisorOptions,
    slots: DashMap<String, Arc<ServerSlot>>,
    /// Tool name → server id, for tools advertised by AI-created servers.
    tool_index: DashMap<String, String>,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(builder: SandboxBuilder, options: SupervisorOptions) -> Self {
        Self {
            builder,
            options,
            slots: DashMap::new(),
            tool_index: DashMap::new(),
        }
    }

    #[must_use]
    pub fn builder(&self) -> &SandboxBuilder {
        &self.builder
    }

    fn slot(&self, id: &str) -> Arc<ServerSlot> {
        self.slots
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ServerSlot::new()))
            .value()
            .clone()
    }

    fn existing(&self, id: &str) -> Option<Arc<ServerSlot>> {
        self.slots.get(id).map(|s| s.value().clone())
    }

    #[must_use]
    pub fn state(&self, id: &str) -> ServerState {
        self.existing(id)
            .map_or(ServerState::Stopped, |slot| slot.state())
    }

    /// Watch a server's state (creates the slot if needed).
    #[must_use]
    pub fn subscribe(&self, id: &str) -> watch::Receiver<ServerState> {
        self.slot(id).state.subscribe()
    }

    pub async fn runtime_info(&self, id: &str) -> RuntimeInfo {
        let Some(slot) = self.existing(id) else {
            return RuntimeInfo {
                state: ServerState::Stopped,
                tools: Vec::new(),
                pid: None,
                started_at: None,
                last_error: None,
            };
        };
        let inner = slot.inner.read().await;
        RuntimeInfo {
            state: slot.state(),
            tools: inner.tools.clone(),
            pid: inner.process.as_ref().and_then(|p| p.pid),
            started_at: inner.process.as_ref().map(|p| p.started_at),
            last_error: inner.last_error.clone(),
        }
    }

    /// Cached tool schemas of every server currently `Running`.
    pub async fn running_tools(&self) -> Vec<ToolSchema> {
        let slots: Vec<Arc<ServerSlot>> = self.slots.iter().map(|s| s.value().clone()).collect();
        let mut tools = Vec::new();
        for slot in slots {
            if slot.state() == ServerState::Running {
                tools.extend(slot.inner.read().await.tools.iter().cloned());
            }
        }
        tools
    }

    /// Ids with a live process (starting or running).
    #[must_use]
    pub fn active_ids(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.value().state().is_active())
            .map(|s| s.key().clone())
            .collect()
    }

    /// Server that most recently advertised `tool`.
    #[must_use]
    pub fn find_tool_owner(&self, tool: &str) -> Option<String> {
        self.tool_index.get(tool).map(|id| id.value().clone())
    }

    fn index_tools(&self, id: &str, tools: &[ToolSchema]) {
        self.tool_index.retain(|_, owner| owner != id);
        for tool in tools {
            if let Some(previous) = self.tool_index.insert(tool.name.clone(), id.to_string()) {
                if previous != id {
                    warn!(
                        tool = %tool.name,
                        existing_server = %previous,
                        new_server = %id,
                        "Tool name collision, overwriting routing"
                    );
                }
            }
        }
    }

    // ============================================================
    // Transitions
    // ============================================================

    /// `Stopped | Crashed -> Starting -> Running`. Returns the discovered tools.
    pub async fn start(&self, def: &ServerDefinition) -> KilnResult<Vec<ToolSchema>> {
        let slot = self.slot(&def.id);
        let _guard = slot.transition.lock().await;
        self.start_locked(&slot, def).await
    }

    /// Graceful stop. Returns whether a process was actually running.
    pub async fn stop(&self, id: &str) -> KilnResult<bool> {
        let Some(slot) = self.existing(id) else {
            return Ok(false);
        };
        let _guard = slot.transition.lock().await;
        Ok(self.stop_locked(&slot, id).await)
    }

    /// Stop (if needed) and start again under one hold of the transition lock.
    pub async fn restart(&self, def: &ServerDefinition) -> KilnResult<Vec<ToolSchema>> {
        let slot = self.slot(&def.id);
        let _guard = slot.transition.lock().await;
        self.stop_locked(&slot, &def.id).await;
        self.start_locked(&slot, def).await
    }

    /// Replace a server's instance with `def`. A running server is stopped,
    /// rebuilt and started again; a stopped one is only rebuilt.
    pub async fn redeploy(&self, def: &ServerDefinition) -> KilnResult<Redeployed> {
        let slot = self.slot(&def.id);
        let _guard = slot.transition.lock().await;
        let was_active = slot.state().is_active();
        if was_active {
            self.stop_locked(&slot, &def.id).await;
        }
        if let Err(e) = self.builder.build(def) {
            if was_active {
                warn!(server = %def.id, error = %e, "Rebuild failed after stop, server left stopped");
            }
            return Err(e.into());
        }
        {
            let mut inner = slot.inner.write().await;
            inner.definition = Some(def.clone());
            inner.tools.clear();
        }
        self.tool_index.retain(|_, owner| owner != &def.id);
        if !was_active {
            return Ok(Redeployed::Rebuilt);
        }
        Ok(match self.start_locked(&slot, def).await {
            Ok(tools) => Redeployed::Restarted(tools),
            Err(e) => Redeployed::RestartFailed(e),
        })
    }

    /// Stop the server and forget it: slot, routing entries and instance directory.
    pub async fn remove(&self, id: &str) -> KilnResult<()> {
        if let Some(slot) = self.existing(id) {
            let _guard = slot.transition.lock().await;
            self.stop_locked(&slot, id).await;
            self.tool_index.retain(|_, owner| owner != id);
            self.slots.remove(id);
        }
        self.builder.destroy(id)?;
        Ok(())
    }

    /// Stop every live server concurrently.
    pub async fn shutdown_all(&self) {
        let ids = self.active_ids();
        if ids.is_empty() {
            return;
        }
        info!("Stopping {} server(s)", ids.len());
        let stops = ids.iter().map(|id| self.stop(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!(server = %id, error = %e, "Failed to stop server during shutdown");
            }
        }
    }

    async fn start_locked(
        &self,
        slot: &Arc<ServerSlot>,
        def: &ServerDefinition,
    ) -> KilnResult<Vec<ToolSchema>> {
        let id = def.id.as_str();
        let current = slot.state();
        if current.is_active() {
            return Err(KilnError::AlreadyRunning(id.to_string()));
        }
        if !def.is_runnable() {
            return Err(KilnError::InvalidRequest(format!(
                "Server '{id}' has not passed validation and cannot be started"
            )));
        }

        slot.set_state(ServerState::Starting);
        let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut inner = slot.inner.write().await;
            inner.definition = Some(def.clone());
            inner.last_error = None;
            inner.blocked_import = None;
        }

        let instance = match self.builder.build(def) {
            Ok(instance) => instance,
            Err(e) => {
                let log = self.builder.servers_dir().join(id).join(crate::sandbox::LOG_FILE);
                return Err(self
                    .abort_start(slot, id, generation, format!("{e:#}"), &log)
                    .await);
            }
        };
        let log = instance.log();
        note(&log, &format!("starting (capabilities: {})", def.capabilities));

        let spec = self.builder.launch_spec(&instance);
        let transport = match StdioTransport::spawn_sandboxed(&spec) {
            Ok(t) => t,
            Err(e) => {
                return Err(self
                    .abort_start(slot, id, generation, format!("{e:#}"), &log)
                    .await)
            }
        };
        let pid = transport.pid();
        let (child, channel, faults) = transport.into_parts();
        let client = Arc::new(McpClient::new(channel, self.options.client));
        let (stop_tx, stop_rx) = oneshot::channel();

        slot.inner.write().await.process = Some(ProcessHandle {
            generation,
            pid,
            started_at: Utc::now(),
            client: client.clone(),
            stop_tx: Some(stop_tx),
        });
        tokio::spawn(monitor(
            Monitor {
                id: id.to_string(),
                slot: slot.clone(),
                generation,
                log: log.clone(),
                grace: self.options.stop_grace,
            },
            child,
            faults,
            stop_rx,
        ));

        let handshake = tokio::time::timeout(self.options.start_timeout, async {
            client.initialize().await?;
            client.list_tools().await
        })
        .await;
        let tools: Vec<ToolSchema> = match handshake {
            Ok(Ok(list)) => list.tools.into_iter().map(ToolSchema::from).collect(),
            Ok(Err(e)) => {
                return Err(self
                    .abort_start(slot, id, generation, format!("handshake failed: {e}"), &log)
                    .await)
            }
            Err(_) => {
                let reason = format!(
                    "handshake timed out after {}s",
                    self.options.start_timeout.as_secs()
                );
                return Err(self.abort_start(slot, id, generation, reason, &log).await);
            }
        };

        {
            let mut inner = slot.inner.write().await;
            let alive = inner
                .process
                .as_ref()
                .is_some_and(|p| p.generation == generation);
            if !alive || slot.state() != ServerState::Starting {
                drop(inner);
                return Err(self
                    .abort_start(
                        slot,
                        id,
                        generation,
                        "process exited during startup".to_string(),
                        &log,
                    )
                    .await);
            }
            inner.tools.clone_from(&tools);
            slot.set_state(ServerState::Running);
        }
        self.index_tools(id, &tools);

        note(&log, &format!("running, {} tool(s) advertised", tools.len()));
        info!(server = %id, pid = ?pid, tools = tools.len(), "✅ Server running");
        Ok(tools)
    }

    /// Kill whatever is left of a failed start and record the failure.
    async fn abort_start(
        &self,
        slot: &Arc<ServerSlot>,
        id: &str,
        generation: u64,
        reason: String,
        log: &Path,
    ) -> KilnError {
        terminate(slot, Some(generation), false, self.options.stop_grace).await;

        let blocked = slot.inner.read().await.blocked_import.clone();
        note(log, &format!("start failed: {reason}"));
        let err = match blocked {
            Some(module) => KilnError::RuntimeImportBlocked {
                id: id.to_string(),
                module,
            },
            None => KilnError::ProcessStartFailure {
                id: id.to_string(),
                reason,
                log_tail: fsio::read_tail(log, START_FAILURE_TAIL).unwrap_or_default(),
            },
        };

        slot.inner.write().await.last_error = Some(err.to_string());
        slot.set_state(ServerState::Crashed);
        error!(server = %id, error = %err, "❌ Server failed to start");
        err
    }

    async fn stop_locked(&self, slot: &Arc<ServerSlot>, id: &str) -> bool {
        match slot.state() {
            ServerState::Stopped => return false,
            ServerState::Crashed => {
                slot.set_state(ServerState::Stopped);
                return false;
            }
            ServerState::Starting | ServerState::Running | ServerState::Stopping => {}
        }
        slot.set_state(ServerState::Stopping);
        let stopped = terminate(slot, None, true, self.options.stop_grace).await;
        slot.set_state(ServerState::Stopped);
        if stopped {
            note(&self.builder.servers_dir().join(id).join(crate::sandbox::LOG_FILE), "stopped");
            info!(server = %id, "Server stopped");
        }
        stopped
    }

    // ============================================================
    // Dispatch
    // ============================================================

    /// One `tools/call` exchange with a running server.
    pub async fn call_tool(&self, id: &str, tool: &str, args: Value) -> KilnResult<CallToolResult> {
        let slot = self
            .existing(id)
            .ok_or_else(|| KilnError::ServerNotFound(id.to_string()))?;
        let state = slot.state();
        if state != ServerState::Running {
            return Err(KilnError::NotRunning {
                id: id.to_string(),
                state,
            });
        }
        let client = {
            let inner = slot.inner.read().await;
            if !inner.tools.iter().any(|t| t.name == tool) {
                return Err(KilnError::ToolNotFound(tool.to_string()));
            }
            inner
                .process
                .as_ref()
                .map(|p| p.client.clone())
                .ok_or_else(|| KilnError::NotRunning {
                    id: id.to_string(),
                    state: slot.state(),
                })?
        };

        client.call_tool(tool, args).await.map_err(|e| match e {
            RpcError::Timeout(d) => KilnError::DispatchTimeout {
                tool: tool.to_string(),
                secs: d.as_secs(),
            },
            RpcError::Remote { message, .. } => KilnError::Tool(message),
            RpcError::Closed => KilnError::NotRunning {
                id: id.to_string(),
                state: slot.state(),
            },
            RpcError::Malformed(m) => KilnError::Protocol(m),
        })
    }

    /// Whether a running server has stopped answering often enough to be restarted.
    pub async fn is_unresponsive(&self, id: &str) -> bool {
        let Some(slot) = self.existing(id) else {
            return false;
        };
        let inner = slot.inner.read().await;
        inner.process.as_ref().is_some_and(|p| {
            p.client.consecutive_timeouts() >= self.options.max_consecutive_timeouts
        })
    }

    /// Restart `id` if it is still unresponsive once the transition lock is
    /// held. Callers that lose the race find a fresh process and get `None`.
    pub async fn recover_unresponsive(&self, id: &str) -> KilnResult<Option<Vec<ToolSchema>>> {
        let Some(slot) = self.existing(id) else {
            return Ok(None);
        };
        let _guard = slot.transition.lock().await;
        let def = {
            let inner = slot.inner.read().await;
            let unresponsive = inner.process.as_ref().is_some_and(|p| {
                p.client.consecutive_timeouts() >= self.options.max_consecutive_timeouts
            });
            match (&inner.definition, unresponsive) {
                (Some(def), true) => def.clone(),
                _ => return Ok(None),
            }
        };
        self.stop_locked(&slot, id).await;
        self.start_locked(&slot, &def).await.map(Some)
    }
}

/// Append a host-side note to an instance log.
fn note(log: &Path, message: &str) {
    let line = format!("[kiln {}] {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), message);
    if let Err(e) = fsio::append_line(log, &line) {
        debug!(path = %log.display(), error = %e, "Failed to append to server log");
    }
}

/// Take the process handle (optionally only for `generation`) and ask its
/// monitor to end it. Returns whether there was a process to end.
async fn terminate(
    slot: &ServerSlot,
    generation: Option<u64>,
    graceful: bool,
    grace: Duration,
) -> bool {
    let handle = {
        let mut inner = slot.inner.write().await;
        let matches = inner
            .process
            .as_ref()
            .is_some_and(|p| generation.map_or(true, |g| p.generation == g));
        if matches {
            inner.process.take()
        } else {
            None
        }
    };
    let Some(mut handle) = handle else {
        return false;
    };
    if let Some(tx) = handle.stop_tx.take() {
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx
            .send(StopRequest {
                graceful,
                ack: ack_tx,
            })
            .is_ok()
        {
            let bound = grace + FAULT_DRAIN + Duration::from_secs(2);
            if tokio::time::timeout(bound, ack_rx).await.is_err() {
                warn!(pid = ?handle.pid, "Monitor did not acknowledge stop in time");
            }
        }
    }
    true
}

struct Monitor {
    id: String,
    slot: Arc<ServerSlot>,
    generation: u64,
    log: PathBuf,
    grace: Duration,
}

enum Exit {
    Requested(oneshot::Sender<()>),
    Abandoned,
    Exited(String),
    Fault(String),
}

/// Owns the child: reaps it, and turns faults and unexpected exits into `Crashed`.
async fn monitor(
    ctx: Monitor,
    mut child: Child,
    mut faults: mpsc::UnboundedReceiver<TransportFault>,
    mut stop_rx: oneshot::Receiver<StopRequest>,
) {
    let mut faults_open = true;
    let mut blocked: Option<String> = None;
    let exit = loop {
        tokio::select! {
            biased;
            fault = faults.recv(), if faults_open => match fault {
                Some(TransportFault::ImportBlocked(module)) => {
                    let _ = child.kill().await;
                    let reason = KilnError::RuntimeImportBlocked {
                        id: ctx.id.clone(),
                        module: module.clone(),
                    }
                    .to_string();
                    blocked = Some(module);
                    break Exit::Fault(reason);
                }
                Some(TransportFault::ProtocolViolation(excerpt)) => {
                    let _ = child.kill().await;
                    break Exit::Fault(format!("protocol violation, non-JSON output: {excerpt}"));
                }
                None => faults_open = false,
            },
            request = &mut stop_rx => match request {
                Ok(request) => {
                    shutdown_child(&mut child, request.graceful, ctx.grace).await;
                    break Exit::Requested(request.ack);
                }
                Err(_) => {
                    let _ = child.kill().await;
                    break Exit::Abandoned;
                }
            },
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => format!("process exited unexpectedly ({status})"),
                    Err(e) => format!("process wait failed: {e}"),
                };
                break Exit::Exited(reason);
            }
        }
    };

    // Wait for both pipes to close: the guard's marker may still be in flight
    // and the log is only complete once the stderr task has flushed.
    if faults_open {
        let late = drain_faults(&mut faults).await;
        if blocked.is_none() {
            blocked = late;
        }
    }

    match exit {
        Exit::Requested(ack) => {
            if let Some(module) = blocked {
                let mut inner = ctx.slot.inner.write().await;
                if ctx.slot.generation.load(Ordering::SeqCst) == ctx.generation {
                    inner.blocked_import = Some(module);
                }
            }
            let _ = ack.send(());
        }
        Exit::Abandoned => {}
        Exit::Exited(reason) | Exit::Fault(reason) => {
            let reason = match &blocked {
                Some(module) => KilnError::RuntimeImportBlocked {
                    id: ctx.id.clone(),
                    module: module.clone(),
                }
                .to_string(),
                None => reason,
            };
            mark_crashed(&ctx, reason, blocked).await;
        }
    }
}

/// Read faults until the pipes close (bounded); returns the first blocked import.
async fn drain_faults(faults: &mut mpsc::UnboundedReceiver<TransportFault>) -> Option<String> {
    let deadline = tokio::time::Instant::now() + FAULT_DRAIN;
    let mut blocked = None;
    loop {
        match tokio::time::timeout_at(deadline, faults.recv()).await {
            Ok(Some(TransportFault::ImportBlocked(module))) => {
                blocked.get_or_insert(module);
            }
            Ok(Some(TransportFault::ProtocolViolation(_))) => {}
            Ok(None) | Err(_) => return blocked,
        }
    }
}

async fn mark_crashed(ctx: &Monitor, reason: String, blocked: Option<String>) {
    {
        let mut inner = ctx.slot.inner.write().await;
        // A failed start may already have taken the handle; it still needs the cause.
        if blocked.is_some() && ctx.slot.generation.load(Ordering::SeqCst) == ctx.generation {
            inner.blocked_import.clone_from(&blocked);
        }
        let current = inner
            .process
            .as_ref()
            .is_some_and(|p| p.generation == ctx.generation);
        if !current {
            return;
        }
        inner.process = None;
        inner.last_error = Some(reason.clone());
        ctx.slot.set_state(ServerState::Crashed);
    }
    note(&ctx.log, &format!("crashed: {reason}"));
    error!(server = %ctx.id, reason = %reason, "💥 Server crashed");
}

/// SIGTERM, bounded wait, then SIGKILL. Non-graceful requests kill at once.
async fn shutdown_child(child: &mut Child, graceful: bool, grace: Duration) {
    #[cfg(unix)]
    if graceful {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
            match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                        return;
                    }
                    warn!(pid, "Process ignored SIGTERM, killing");
                }
                Err(nix::errno::Errno::ESRCH) => {
                    let _ = child.wait().await;
                    return;
                }
                Err(e) => debug!(pid, error = %e, "SIGTERM failed, killing"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (graceful, grace);

    if let Err(e) = child.kill().await {
        debug!(error = %e, "Kill failed (process already gone?)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_shared::{Capabilities, Location, ValidationResult, Violation, ViolationRule};

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            start_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(1),
            max_consecutive_timeouts: 2,
            client: ClientOptions::default(),
        }
    }

    fn definition(id: &str, result: &ValidationResult) -> ServerDefinition {
        let now = Utc::now();
        ServerDefinition {
            id: id.to_string(),
            description: String::new(),
            source: "x = 1\n".to_string(),
            capabilities: Capabilities::none(),
            autostart: false,
            created_at: now,
            modified_at: now,
            last_validated_at: now,
            validation: result.to_status(now),
        }
    }

    #[tokio::test]
    async fn test_unknown_server_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(SandboxBuilder::new(dir.path(), "python3"), options());
        assert_eq!(sup.state("ghost"), ServerState::Stopped);
        assert!(!sup.stop("ghost").await.unwrap());
        assert!(sup.find_tool_owner("anything").is_none());
        let err = sup.call_tool("ghost", "t", Value::Null).await.unwrap_err();
        assert!(matches!(err, KilnError::ServerNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_definition_never_starts() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(SandboxBuilder::new(dir.path(), "python3"), options());
        let invalid = ValidationResult::Invalid(vec![Violation::new(
            ViolationRule::DisallowedImport,
            "import of 'subprocess' is not allowed",
            Location::Line { line: 1, column: 1 },
        )]);
        let err = sup.start(&definition("bad", &invalid)).await.unwrap_err();
        assert!(matches!(err, KilnError::InvalidRequest(_)));
        assert_eq!(sup.state("bad"), ServerState::Stopped);
        assert!(!dir.path().join("bad").exists());
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_a_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(
            SandboxBuilder::new(dir.path(), "kiln-no-such-python"),
            options(),
        );
        let mut states = sup.subscribe("calc");
        let err = sup
            .start(&definition("calc", &ValidationResult::Valid))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ProcessStartFailure { .. }), "{err}");
        assert_eq!(sup.state("calc"), ServerState::Crashed);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ServerState::Crashed);

        let info = sup.runtime_info("calc").await;
        assert!(info.last_error.unwrap().contains("failed to start"));
        assert!(info.pid.is_none());

        // Stopping a crashed server only resets its state.
        assert!(!sup.stop("calc").await.unwrap());
        assert_eq!(sup.state("calc"), ServerState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_child_terminates_gracefully() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let started = std::time::Instant::now();
        shutdown_child(&mut child, true, Duration::from_secs(5)).await;
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_child_kills_when_term_is_ignored() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_child(&mut child, true, Duration::from_millis(300)).await;
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
