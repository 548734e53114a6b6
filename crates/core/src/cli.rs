use crate::config::AppConfig;
use crate::managers::ManifestStore;
use crate::sandbox::{CodeValidator, SandboxBuilder};
use crate::KilnHost;
use colored::Colorize;
use comfy_table::{presets::NOTHING, ContentArrangement, Table};
use kiln_shared::{Capabilities, ValidationResult};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(clap::Parser)]
#[command(
    name = "kiln_system",
    version = env!("CARGO_PKG_VERSION"),
    about = "Kiln - sandboxed host for AI-authored MCP tool servers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Boot the host, autostart servers and wait for Ctrl-C (default)
    Run,
    /// Check a Python source file against the sandbox policy
    Validate {
        file: PathBuf,
        /// Validate as if the network capability were granted
        #[arg(long)]
        network: bool,
    },
    /// List AI-created servers recorded in the manifest
    List,
    /// Print the tail of a server's log
    Logs {
        name: String,
        #[arg(long, short = 'n', default_value_t = crate::validation::DEFAULT_LOG_LINES)]
        lines: usize,
    },
    /// Boot the host, dispatch one tool call and shut down
    Call {
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

pub async fn dispatch(cmd: Commands) -> anyhow::Result<()> {
    match cmd {
        Commands::Run => crate::run_host().await,
        Commands::Validate { file, network } => validate_command(&file, network),
        Commands::List => list_command().await,
        Commands::Logs { name, lines } => logs_command(&name, lines),
        Commands::Call { tool, args } => call_command(&tool, &args).await,
    }
}

fn validate_command(file: &Path, network: bool) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(file)?;
    let config = AppConfig::load()?;
    let caps = if network {
        Capabilities::with_network()
    } else {
        Capabilities::none()
    };
    match CodeValidator::new(config.max_code_bytes).validate(&source, caps) {
        ValidationResult::Valid => {
            println!("  {} {}", "✓".green().bold(), file.display());
            Ok(())
        }
        ValidationResult::Invalid(violations) => {
            println!("  {} {}", "✗".red().bold(), file.display());
            for v in &violations {
                println!("    {} {}", v.location.to_string().dimmed(), v.message);
            }
            anyhow::bail!("{} violation(s)", violations.len())
        }
    }
}

async fn list_command() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let manifest = ManifestStore::load(config.manifest_path());
    let entries = manifest.list().await;
    if entries.is_empty() {
        println!("  {}", "No AI-created MCP servers.".dimmed());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);
    for entry in entries {
        let valid = if entry.validation_status.valid {
            "valid".green().to_string()
        } else {
            "invalid".red().to_string()
        };
        table.add_row(vec![
            format!("  {}", entry.name.bold()),
            entry.capabilities.to_string().dimmed().to_string(),
            if entry.autostart { "autostart" } else { "manual" }.to_string(),
            valid,
            entry.description.dimmed().to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn logs_command(name: &str, lines: usize) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let builder = SandboxBuilder::new(config.servers_dir(), config.python);
    let lines = lines.clamp(1, crate::validation::MAX_LOG_LINES);
    for line in builder.log_tail(name, lines)? {
        println!("{line}");
    }
    Ok(())
}

async fn call_command(tool: &str, args: &str) -> anyhow::Result<()> {
    let args: serde_json::Value = serde_json::from_str(args)?;
    let host = KilnHost::new(AppConfig::load()?);
    host.boot().await;
    info!("Dispatching '{}'", tool);
    let outcome = host.router.dispatch(tool, args).await;
    host.shutdown().await;
    match outcome {
        Ok(text) => {
            println!("{text}");
            Ok(())
        }
        Err(e) => {
            eprintln!("  {} {}", "ERROR".red().bold(), e);
            Err(e.into())
        }
    }
}
