pub mod cli;
pub mod config;
pub mod fsio;
pub mod managers;
pub mod sandbox;
pub mod test_utils;
pub mod validation;

use config::AppConfig;
use managers::{
    AiServers, BuiltinHandler, ExternalServers, ManagementTools, ManifestStore, ProcessSupervisor,
    SupervisorOptions, ToolRouter,
};
use sandbox::{CodeValidator, SandboxBuilder};
use std::sync::Arc;
use tracing::{info, warn};

/// The assembled host: AI-created servers, external servers and the router
/// the chat engine dispatches through.
pub struct KilnHost {
    pub config: AppConfig,
    pub servers: Arc<AiServers>,
    pub external: Arc<ExternalServers>,
    pub router: Arc<ToolRouter>,
}

impl KilnHost {
    /// Wire every component from `config`. Nothing is spawned yet.
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        Self::with_builtins(config, Vec::new())
    }

    /// Like [`KilnHost::new`], with extra built-in handlers owned by the
    /// embedding application. They resolve after the management tools.
    #[must_use]
    pub fn with_builtins(config: AppConfig, extra: Vec<Arc<dyn BuiltinHandler>>) -> Self {
        let options = SupervisorOptions::from_config(&config);
        let supervisor = Arc::new(ProcessSupervisor::new(
            SandboxBuilder::new(config.servers_dir(), config.python.clone()),
            options,
        ));
        let manifest = ManifestStore::load(config.manifest_path());
        let servers = Arc::new(AiServers::new(
            manifest,
            supervisor.clone(),
            CodeValidator::new(config.max_code_bytes),
            config.allow_network,
        ));
        let external = Arc::new(ExternalServers::new(options.client, options.start_timeout));

        let mut builtins: Vec<Arc<dyn BuiltinHandler>> =
            vec![Arc::new(ManagementTools::new(servers.clone()))];
        builtins.extend(extra);
        let router = Arc::new(ToolRouter::new(builtins, external.clone(), supervisor));

        Self {
            config,
            servers,
            external,
            router,
        }
    }

    /// Connect external servers, then autostart AI-created ones. Failures of
    /// individual servers are logged and never abort boot.
    pub async fn boot(&self) {
        if let Some(path) = &self.config.mcp_config_path {
            if let Err(e) = self.external.load_config_file(path).await {
                tracing::error!(error = %format!("{e:#}"), "Failed to load external MCP servers");
            }
        }
        self.servers.boot_autostart().await;
    }

    /// Stop every AI-created and external server.
    pub async fn shutdown(&self) {
        tokio::join!(self.servers.shutdown(), self.external.shutdown());
        info!("All tool servers stopped");
    }
}

/// Run the host until Ctrl-C.
/// Make the state directory owner-only. Failure is logged, not fatal.
fn restrict_state_dir(path: &std::path::Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)) {
            warn!(path = %path.display(), error = %e, "Failed to restrict state directory permissions");
            return false;
        }
    }
    true
}

pub async fn run_host() -> anyhow::Result<()> {
    info!("+---------------------------------------+");
    info!("|              Kiln Tool Host           |");
    info!("|             Version {:<10}        |", env!("CARGO_PKG_VERSION"));
    info!("+---------------------------------------+");

    let config = AppConfig::load()?;
    info!(
        "📍 Loaded Config: STATE_DIR={}, PYTHON={}, NETWORK={}",
        config.state_dir.display(),
        config.python,
        config.allow_network
    );
    std::fs::create_dir_all(config.servers_dir())?;
    restrict_state_dir(&config.state_dir);

    let host = KilnHost::new(config);
    host.boot().await;

    let running = host
        .servers
        .list()
        .await
        .iter()
        .filter(|s| s.state == kiln_shared::ServerState::Running)
        .count();
    info!(
        "🚀 Kiln ready: {} AI server(s) running, {} tool(s) routable",
        running,
        host.router.function_schemas().await.len()
    );

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown requested");
    host.shutdown().await;
    Ok(())
}
