//! Materialises a server definition on disk and describes how to launch it.
//!
//! Layout of one instance (`<state>/servers/<id>/`):
//!
//! ```text
//! server.py            entry point, the validated source unmodified
//! _sandbox_wrapper.py  runtime import guard, runs server.py
//! sandbox/             private storage, the only location handed to the server
//! server.log           append-only diagnostics (server stderr + host notes)
//! ```

use super::policy;
use crate::fsio;
use crate::validation::is_valid_server_name;
use anyhow::{bail, Context, Result};
use kiln_shared::{Capabilities, ServerDefinition};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const ENTRY_FILE: &str = "server.py";
pub const WRAPPER_FILE: &str = "_sandbox_wrapper.py";
pub const STORAGE_DIR: &str = "sandbox";
pub const LOG_FILE: &str = "server.log";

/// Written to stderr by the runtime guard, followed by the module name.
pub const BLOCKED_IMPORT_MARKER: &str = "kiln-sandbox: blocked import ";

const WRAPPER_TEMPLATE: &str = include_str!("wrapper.py");

/// Host variables forwarded to every server when present.
const PASSTHROUGH_VARS: &[&str] = &["PATH", "LD_LIBRARY_PATH", "VIRTUAL_ENV", "SYSTEMROOT"];

/// Additional host variables forwarded only with the network capability.
const NETWORK_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
    "REQUESTS_CA_BUNDLE",
];

/// Isolated mode, no bytecode files, unbuffered stdio, UTF-8 text I/O.
const INTERPRETER_FLAGS: &[&str] = &["-I", "-B", "-u", "-X", "utf8"];

#[derive(Debug, Clone)]
pub struct SandboxInstance {
    pub id: String,
    pub dir: PathBuf,
    pub capabilities: Capabilities,
}

impl SandboxInstance {
    #[must_use]
    pub fn entry(&self) -> PathBuf {
        self.dir.join(ENTRY_FILE)
    }

    #[must_use]
    pub fn wrapper(&self) -> PathBuf {
        self.dir.join(WRAPPER_FILE)
    }

    #[must_use]
    pub fn storage(&self) -> PathBuf {
        self.dir.join(STORAGE_DIR)
    }

    #[must_use]
    pub fn log(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }
}

/// Everything needed to spawn a sandboxed server process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// The complete environment; the host's own environment is not inherited.
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SandboxBuilder {
    servers_dir: PathBuf,
    python: String,
}

impl SandboxBuilder {
    #[must_use]
    pub fn new(servers_dir: impl Into<PathBuf>, python: impl Into<String>) -> Self {
        Self {
            servers_dir: servers_dir.into(),
            python: python.into(),
        }
    }

    #[must_use]
    pub fn servers_dir(&self) -> &Path {
        &self.servers_dir
    }

    fn instance_dir(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_server_name(id) {
            bail!("Invalid server id '{}'", id);
        }
        Ok(self.servers_dir.join(id))
    }

    /// Write (or rewrite) the instance for `def`. The storage directory and
    /// the log survive a rebuild; entry point and wrapper are replaced.
    pub fn build(&self, def: &ServerDefinition) -> Result<SandboxInstance> {
        let dir = self.instance_dir(&def.id)?;
        std::fs::create_dir_all(dir.join(STORAGE_DIR))
            .with_context(|| format!("Failed to create instance dir {}", dir.display()))?;
        let dir = std::fs::canonicalize(&dir)
            .with_context(|| format!("Failed to resolve instance dir {}", dir.display()))?;

        let instance = SandboxInstance {
            id: def.id.clone(),
            dir,
            capabilities: def.capabilities,
        };

        fsio::write_atomic(&instance.entry(), def.source.as_bytes())
            .context("Failed to write server entry point")?;
        let wrapper = render_wrapper(&instance.entry(), def.capabilities)?;
        fsio::write_atomic(&instance.wrapper(), wrapper.as_bytes())
            .context("Failed to write sandbox wrapper")?;

        debug!(server = %def.id, dir = %instance.dir.display(), caps = %def.capabilities, "Sandbox instance built");
        Ok(instance)
    }

    /// Launch description for a built instance.
    #[must_use]
    pub fn launch_spec(&self, instance: &SandboxInstance) -> LaunchSpec {
        let mut args: Vec<String> = INTERPRETER_FLAGS.iter().map(|f| (*f).to_string()).collect();
        args.push(instance.wrapper().to_string_lossy().into_owned());
        LaunchSpec {
            program: self.python.clone(),
            args,
            env: sandbox_env(&instance.storage(), instance.capabilities, |k| {
                std::env::var(k).ok()
            }),
            working_dir: instance.dir.clone(),
            log_path: instance.log(),
        }
    }

    /// Current source of a server as stored in its entry point.
    pub fn read_source(&self, id: &str) -> Result<String> {
        let path = self.instance_dir(id)?.join(ENTRY_FILE);
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    pub fn log_tail(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        let path = self.instance_dir(id)?.join(LOG_FILE);
        fsio::read_tail(&path, lines).with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Remove the whole instance directory, storage and log included.
    pub fn destroy(&self, id: &str) -> Result<()> {
        let dir = self.instance_dir(id)?;
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
            info!(server = %id, "Sandbox instance removed");
        }
        Ok(())
    }
}

fn render_wrapper(entry: &Path, caps: Capabilities) -> Result<String> {
    let allowed = serde_json::to_string(&policy::runtime_allow_list(caps))?;
    let entry = serde_json::to_string(&entry.to_string_lossy())?;
    Ok(WRAPPER_TEMPLATE
        .replace("__KILN_ALLOWED__", &allowed)
        .replace("__KILN_ENTRY__", &entry))
}

/// Scrubbed environment for a server. `host` looks up host variables so the
/// selection can be tested without touching the process environment.
pub fn sandbox_env<F>(storage: &Path, caps: Capabilities, host: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = BTreeMap::new();
    let forward = |names: &[&str], env: &mut BTreeMap<String, String>| {
        for name in names {
            if let Some(value) = host(name) {
                env.insert((*name).to_string(), value);
            }
        }
    };
    forward(PASSTHROUGH_VARS, &mut env);
    if caps.network {
        forward(NETWORK_VARS, &mut env);
    }

    let storage = storage.to_string_lossy().into_owned();
    env.insert("MCP_SANDBOX_DIR".to_string(), storage.clone());
    env.insert("HOME".to_string(), storage.clone());
    env.insert("TMPDIR".to_string(), storage);
    env
}
