//! Nexus - MCP Gateway
//!
//! Aggregates upstream MCP servers (JSON-RPC 2.0 over SSE + HTTP POST) into
//! a single management plane and re-exposes operator-defined virtual
//! servers, each a fully conformant MCP server on its own port.

use clap::{Parser, Subcommand};
use nexus_mcp::{config, error, Gateway, Result};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "nexus")]
#[command(about = "MCP gateway with composable virtual servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, env = "NEXUS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "NEXUS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Management port override
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// List configured upstreams and virtual servers
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::Start { port } => {
            let mut config = config::Config::load(cli.config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }

            info!("Nexus v{} starting", env!("CARGO_PKG_VERSION"));
            let gateway = Gateway::new(config)?;
            gateway.bootstrap().await?;

            for upstream in gateway.upstreams() {
                println!(
                    "  upstream {} ({}) [{}]",
                    upstream.name, upstream.url, upstream.status
                );
            }
            for vmcp in gateway.vmcps() {
                println!(
                    "  vmcp {} on port {} [{}]",
                    vmcp.name, vmcp.port, vmcp.status
                );
            }

            tokio::signal::ctrl_c()
                .await
                .map_err(|e| error::Error::Internal(format!("signal handler: {}", e)))?;
            info!("Shutting down gateway gracefully...");
            gateway.shutdown().await;
        },

        Commands::Validate {
            config: config_path,
        } => {
            info!("Validating configuration: {:?}", config_path);
            match config::Config::validate_file(&config_path) {
                Ok(_) => {
                    println!("Configuration valid");
                },
                Err(e) => {
                    eprintln!("Configuration errors found:");
                    eprintln!("{}", e);
                    std::process::exit(1);
                },
            }
        },

        Commands::List => {
            let config = config::Config::load(cli.config.as_deref())?;

            println!("Configured upstream MCP servers:");
            for upstream in &config.mcp_servers {
                let state = if upstream.disabled { "disabled" } else { "enabled" };
                println!("  - {} ({}) [{}]", upstream.name, upstream.url, state);
            }

            println!("Configured virtual servers:");
            for vmcp in &config.vmcps {
                println!(
                    "  - {} on port {} <- {:?}",
                    vmcp.name, vmcp.port, vmcp.source_server_ids
                );
            }
        },
    }

    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();

    Ok(())
}
