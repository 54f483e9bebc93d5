use clap::Parser;
use tracing_subscriber::EnvFilter;

use qrld::config::QrldConfig;
use qrld::node::run_node;

/// Quantum-resistant proof-of-work ledger node
#[derive(Parser, Debug)]
#[command(name = "qrld", version, about)]
struct Cli {
    /// Path to a TOML configuration file (defaults to ./qrld.toml if present)
    #[arg(long)]
    config: Option<String>,

    /// HTTP API port
    #[arg(long)]
    api_port: Option<u16>,

    /// P2P listen port
    #[arg(long)]
    p2p_port: Option<u16>,

    /// Data directory for the state store
    #[arg(long)]
    db_path: Option<String>,

    /// Comma-separated bootstrap peers (host:port)
    #[arg(long)]
    bootstrap: Option<String>,

    /// Enable mining on the configured mining address
    #[arg(long)]
    mine: bool,

    /// Run without networking (local chain only)
    #[arg(long)]
    no_network: bool,

    /// Write the default configuration to the given path and exit
    #[arg(long)]
    init_config: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    if let Some(path) = cli.init_config {
        let config = QrldConfig::default();
        if let Err(err) = config.save(&path) {
            tracing::error!("failed to write {path}: {err}");
            std::process::exit(1);
        }
        tracing::info!("default configuration written to {path}");
        return;
    }

    let config = match QrldConfig::load_with_overrides(
        cli.config,
        cli.api_port,
        cli.p2p_port,
        cli.db_path,
        cli.bootstrap,
        cli.mine,
        cli.no_network,
    ) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run_node(config).await {
        tracing::error!("node terminated: {err}");
        std::process::exit(1);
    }
}
