use super::mcp_protocol::McpServerConfig;
use crate::sandbox::{LaunchSpec, BLOCKED_IMPORT_MARKER};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Allowed commands for externally configured servers (security whitelist)
const ALLOWED_COMMANDS: &[&str] = &["npx", "node", "python", "python3", "deno", "bun"];

/// Longest stdout excerpt kept in a protocol-violation report.
const FAULT_EXCERPT_LEN: usize = 200;

/// Validate command against whitelist (bare command names only, no paths)
pub fn validate_command(command: &str) -> Result<String> {
    if command.contains('/') || command.contains('\\') {
        bail!(
            "Command must not contain path separators: '{}'. Use bare command names only.",
            command
        );
    }

    if !ALLOWED_COMMANDS.contains(&command) {
        bail!(
            "Command '{}' not in whitelist. Allowed commands: {:?}",
            command,
            ALLOWED_COMMANDS
        );
    }

    Ok(command.to_string())
}

/// Out-of-band conditions observed on a server's pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// A stdout line that is not a JSON message.
    ProtocolViolation(String),
    /// The runtime import guard refused a module.
    ImportBlocked(String),
}

/// Line-oriented request/response halves of a server's stdin/stdout.
pub struct ControlChannel {
    pub sender: mpsc::Sender<String>,
    pub responses: mpsc::Receiver<String>,
}

enum StderrSink {
    /// Append to the instance log file.
    File(PathBuf),
    /// Forward to the host log under a label.
    Tracing(String),
}

pub struct StdioTransport {
    child: Child,
    channel: ControlChannel,
    faults: mpsc::UnboundedReceiver<TransportFault>,
}

impl StdioTransport {
    /// Spawn a sandboxed server: scrubbed environment, pinned working
    /// directory, stderr appended to the instance log.
    pub fn spawn_sandboxed(spec: &LaunchSpec) -> Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .current_dir(&spec.working_dir);
        Self::spawn(cmd, &spec.program, StderrSink::File(spec.log_path.clone()))
    }

    /// Start an externally configured server with environment variable injection.
    pub fn start(config: &McpServerConfig) -> Result<Self> {
        info!("Starting MCP Server: {} {:?}", config.command, config.args);

        let validated_command =
            validate_command(&config.command).context("Command validation failed")?;

        let mut cmd = Command::new(validated_command);
        cmd.args(&config.args);

        // Inject environment variables (with shell variable expansion)
        for (key, value) in &config.env {
            cmd.env(key, resolve_env_value(value));
        }

        Self::spawn(cmd, &config.command, StderrSink::Tracing(config.id.clone()))
    }

    fn spawn(mut cmd: Command, program: &str, sink: StderrSink) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn server process: {program}"))?;

        let stdin = child.stdin.take().context("Failed to open stdin")?;
        let stdout = child.stdout.take().context("Failed to open stdout")?;
        let stderr = child.stderr.take().context("Failed to open stderr")?;

        let (req_tx, mut req_rx) = mpsc::channel::<String>(100);
        let (res_tx, res_rx) = mpsc::channel::<String>(100);
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        // Writer Task
        tokio::spawn(async move {
            let mut writer = stdin;
            while let Some(msg) = req_rx.recv().await {
                let line = format!("{}\n", msg);
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!("Failed to write to server stdin: {}", e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    debug!("Failed to flush server stdin: {}", e);
                    break;
                }
            }
        });

        // Reader Task (Stdout)
        let stdout_faults = fault_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if serde_json::from_str::<serde_json::Value>(&line).is_err() {
                    let excerpt: String = line.chars().take(FAULT_EXCERPT_LEN).collect();
                    let _ = stdout_faults.send(TransportFault::ProtocolViolation(excerpt));
                    continue;
                }
                if res_tx.send(line).await.is_err() {
                    break;
                }
            }
            debug!("Server stdout closed.");
        });

        // Logger Task (Stderr)
        tokio::spawn(drain_stderr(stderr, sink, fault_tx));

        Ok(Self {
            child,
            channel: ControlChannel {
                sender: req_tx,
                responses: res_rx,
            },
            faults: fault_rx,
        })
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Split into the process handle, the control channel and the fault feed.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        Child,
        ControlChannel,
        mpsc::UnboundedReceiver<TransportFault>,
    ) {
        (self.child, self.channel, self.faults)
    }
}

fn blocked_module(line: &str) -> Option<String> {
    line.find(BLOCKED_IMPORT_MARKER).map(|pos| {
        line[pos + BLOCKED_IMPORT_MARKER.len()..]
            .trim()
            .to_string()
    })
}

async fn drain_stderr(
    stderr: ChildStderr,
    sink: StderrSink,
    faults: mpsc::UnboundedSender<TransportFault>,
) {
    let mut reader = BufReader::new(stderr).lines();
    match sink {
        StderrSink::File(path) => {
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to open server log");
                    None
                }
            };
            while let Ok(Some(line)) = reader.next_line().await {
                if let Some(module) = blocked_module(&line) {
                    let _ = faults.send(TransportFault::ImportBlocked(module));
                }
                if let Some(f) = file.as_mut() {
                    let entry = format!("{line}\n");
                    if let Err(e) = f.write_all(entry.as_bytes()).await {
                        warn!(path = %path.display(), error = %e, "Failed to append to server log");
                        file = None;
                    }
                }
            }
            if let Some(mut f) = file {
                let _ = f.flush().await;
            }
        }
        StderrSink::Tracing(label) => {
            while let Ok(Some(line)) = reader.next_line().await {
                if let Some(module) = blocked_module(&line) {
                    let _ = faults.send(TransportFault::ImportBlocked(module));
                }
                warn!("[MCP:{}] {}", label, line);
            }
        }
    }
}

/// Resolve `${ENV_VAR}` references in a value string to actual environment variables.
fn resolve_env_value(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}
