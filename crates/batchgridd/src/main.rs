//! batchgridd — the batchgrid daemon.
//!
//! # Usage
//!
//! ```text
//! batchgridd run --config /etc/batchgrid/batchgridd.toml
//! batchgridd check-config --config batchgridd.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use batchgridd::DaemonConfig;

const DEFAULT_FILTER: &str = "info,batchgridd=debug,batchgrid=debug";

#[derive(Parser)]
#[command(name = "batchgridd", about = "batchgrid resource-control plane")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until Ctrl-C.
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Parse and validate the configuration, then print it.
    CheckConfig {
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(clap::Args)]
struct Overrides {
    /// Path to batchgridd.toml. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// UDP address heartbeats are received on.
    #[arg(long)]
    heartbeat_addr: Option<SocketAddr>,

    /// Predictor service `host:port`.
    #[arg(long)]
    predictor: Option<String>,
}

impl Overrides {
    fn load(self) -> anyhow::Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)?,
            None => DaemonConfig::default(),
        };
        if let Some(data_dir) = self.data_dir {
            config.store.data_dir = data_dir;
        }
        if let Some(addr) = self.heartbeat_addr {
            config.heartbeat.listen = addr;
        }
        if let Some(endpoint) = self.predictor {
            config.predictor.endpoint = endpoint;
        }
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { overrides } => batchgridd::run(overrides.load()?).await,
        Command::CheckConfig { overrides } => {
            let config = overrides.load()?;
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
