use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Returns the directory containing the running executable.
/// Falls back to CWD if the exe path cannot be determined.
#[must_use]
pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("kiln"))
        .unwrap_or_else(|| exe_dir().join("data"))
}

fn default_python() -> String {
    if cfg!(windows) {
        "python".to_string()
    } else {
        "python3".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root of the manifest and all sandbox instances.
    pub state_dir: PathBuf,
    /// Interpreter used for AI-created servers.
    pub python: String,
    /// Global switch: may any server be granted the network capability.
    pub allow_network: bool,
    /// Optional TOML file with externally configured servers.
    pub mcp_config_path: Option<PathBuf>,
    pub tool_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub stop_grace_secs: u64,
    /// Consecutive call timeouts before the supervisor restarts a server.
    pub max_consecutive_timeouts: u32,
    /// Requests allowed in flight on one control channel at a time.
    pub max_in_flight: usize,
    pub max_code_bytes: usize,
}

fn parse_var<T>(name: &str, default: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse::<T>()
        .with_context(|| format!("Failed to parse {name}"))
}

fn check_range<T>(name: &str, value: T, min: T, max: T) -> anyhow::Result<T>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if value < min || value > max {
        anyhow::bail!("{name} must be between {min} and {max} (got {value})");
    }
    Ok(value)
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let state_dir = env::var("KILN_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_state_dir());

        let python = env::var("KILN_PYTHON").unwrap_or_else(|_| default_python());
        if python.trim().is_empty() {
            anyhow::bail!("KILN_PYTHON must not be empty");
        }

        let allow_network = parse_var::<bool>("KILN_ALLOW_NETWORK", "false")?;

        let mcp_config_path = env::var("KILN_MCP_CONFIG").ok().map(PathBuf::from);

        let tool_timeout_secs = check_range(
            "KILN_TOOL_TIMEOUT_SECS",
            parse_var::<u64>("KILN_TOOL_TIMEOUT_SECS", "30")?,
            1,
            300,
        )?;
        let start_timeout_secs = check_range(
            "KILN_START_TIMEOUT_SECS",
            parse_var::<u64>("KILN_START_TIMEOUT_SECS", "15")?,
            1,
            120,
        )?;
        let stop_grace_secs = check_range(
            "KILN_STOP_GRACE_SECS",
            parse_var::<u64>("KILN_STOP_GRACE_SECS", "5")?,
            1,
            60,
        )?;
        let max_consecutive_timeouts = check_range(
            "KILN_MAX_TIMEOUTS",
            parse_var::<u32>("KILN_MAX_TIMEOUTS", "3")?,
            1,
            20,
        )?;
        let max_in_flight = check_range(
            "KILN_MAX_IN_FLIGHT",
            parse_var::<usize>("KILN_MAX_IN_FLIGHT", "1")?,
            1,
            32,
        )?;
        let max_code_bytes = check_range(
            "KILN_MAX_CODE_BYTES",
            parse_var::<usize>("KILN_MAX_CODE_BYTES", "65536")?,
            1024,
            1_048_576,
        )?;

        if allow_network {
            tracing::warn!("KILN_ALLOW_NETWORK enabled: AI-created servers may request network access");
        }

        Ok(Self {
            state_dir,
            python,
            allow_network,
            mcp_config_path,
            tool_timeout_secs,
            start_timeout_secs,
            stop_grace_secs,
            max_consecutive_timeouts,
            max_in_flight,
            max_code_bytes,
        })
    }

    /// Defaults rooted at `state_dir`, without consulting the environment.
    #[must_use]
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            python: default_python(),
            allow_network: false,
            mcp_config_path: None,
            tool_timeout_secs: 30,
            start_timeout_secs: 15,
            stop_grace_secs: 5,
            max_consecutive_timeouts: 3,
            max_in_flight: 1,
            max_code_bytes: 65_536,
        }
    }

    /// Directory holding one sub-directory per AI-created server.
    #[must_use]
    pub fn servers_dir(&self) -> PathBuf {
        self.state_dir.join("servers")
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.servers_dir().join("manifest.json")
    }

    #[must_use]
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}
