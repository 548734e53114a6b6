use super::mcp_protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, InitializeParams,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, PROTOCOL_VERSION,
};
use super::mcp_transport::ControlChannel;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("RPC error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("server connection closed")]
    Closed,
    #[error("malformed response: {0}")]
    Malformed(String),
}

type PendingMap = HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>;

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    /// Requests allowed on the wire at once; further calls queue.
    pub max_in_flight: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_in_flight: 1,
        }
    }
}

// ============================================================
// McpClient: JSON-RPC client for a single server
// ============================================================

pub struct McpClient {
    sender: mpsc::Sender<String>,
    pending_requests: Arc<Mutex<PendingMap>>,
    next_id: AtomicI64,
    in_flight: Semaphore,
    consecutive_timeouts: AtomicU32,
    request_timeout: Duration,
    response_task: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Some(handle) = self.response_task.take() {
            handle.abort();
        }
    }
}

impl McpClient {
    const MAX_PENDING_REQUESTS: usize = 100;

    #[must_use]
    pub fn new(channel: ControlChannel, options: ClientOptions) -> Self {
        let ControlChannel { sender, responses } = channel;
        let pending_requests = Arc::new(Mutex::new(PendingMap::new()));
        let response_task = tokio::spawn(response_loop(responses, pending_requests.clone()));
        Self {
            sender,
            pending_requests,
            next_id: AtomicI64::new(1),
            in_flight: Semaphore::new(options.max_in_flight.max(1)),
            consecutive_timeouts: AtomicU32::new(0),
            request_timeout: options.request_timeout,
            response_task: Some(response_task),
        }
    }

    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let deadline = Instant::now() + timeout;

        // Queue behind in-flight requests; the wait counts against the deadline.
        let _permit = tokio::time::timeout_at(deadline, self.in_flight.acquire())
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
            .map_err(|_| RpcError::Closed)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let req_str =
            serde_json::to_string(&request).map_err(|e| RpcError::Malformed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending_requests.lock().await;
            if map.len() >= Self::MAX_PENDING_REQUESTS {
                return Err(RpcError::Malformed(format!(
                    "pending request limit reached ({})",
                    Self::MAX_PENDING_REQUESTS
                )));
            }
            map.insert(id, tx);
        }

        if self.sender.send(req_str).await.is_err() {
            self.pending_requests.lock().await.remove(&id);
            return Err(RpcError::Closed);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => {
                self.consecutive_timeouts.store(0, Ordering::Relaxed);
                result
            }
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.pending_requests.lock().await.remove(&id);
                let count = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(method, count, "Request timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// `initialize` followed by the `notifications/initialized` notification.
    pub async fn initialize(&self) -> Result<Value, RpcError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities {},
            client_info: ClientInfo {
                name: "kiln".to_string(),
                version: kiln_shared::KILN_VERSION.to_string(),
            },
        };
        let params =
            serde_json::to_value(params).map_err(|e| RpcError::Malformed(e.to_string()))?;
        let result = self
            .call("initialize", Some(params), self.request_timeout)
            .await?;
        debug!("MCP Initialized: {:?}", result);

        self.send_notification("notifications/initialized", None)
            .await?;
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult, RpcError> {
        let val = self.call("tools/list", None, self.request_timeout).await?;
        serde_json::from_value(val).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    pub async fn call_tool(&self, name: &str, args: Value) -> Result<CallToolResult, RpcError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: args,
        };
        let params =
            serde_json::to_value(params).map_err(|e| RpcError::Malformed(e.to_string()))?;
        let val = self
            .call("tools/call", Some(params), self.request_timeout)
            .await?;
        serde_json::from_value(val).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    /// Send a JSON-RPC notification (fire-and-forget, no response expected).
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), RpcError> {
        let request = JsonRpcRequest::notification(method, params);
        let req_str =
            serde_json::to_string(&request).map_err(|e| RpcError::Malformed(e.to_string()))?;
        self.sender.send(req_str).await.map_err(|_| RpcError::Closed)
    }

    /// Timeouts since the last answered request.
    #[must_use]
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Check if the underlying transport is still accepting requests.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

async fn response_loop(mut responses: mpsc::Receiver<String>, pending: Arc<Mutex<PendingMap>>) {
    while let Some(line) = responses.recv().await {
        let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&line) else {
            debug!("Received non-response message: {}", line);
            continue;
        };
        let Some(id) = response.id.as_ref().and_then(Value::as_i64) else {
            debug!("Received message without numeric id: {}", line);
            continue;
        };
        let Some(tx) = pending.lock().await.remove(&id) else {
            debug!("Late response for request {} dropped", id);
            continue;
        };
        let outcome = match response.error {
            Some(error) => Err(RpcError::Remote {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        if tx.send(outcome).is_err() {
            debug!("Response receiver dropped for request {}", id);
        }
    }

    info!("MCP Connection closed.");
    let mut map = pending.lock().await;
    let count = map.len();
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(RpcError::Closed));
    }
    if count > 0 {
        error!(
            "Failed {} pending MCP requests due to process termination",
            count
        );
    }
}
