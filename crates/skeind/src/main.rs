//! skeind — the skein daemon.
//!
//! One binary, two roles:
//! - `register`: the register server holding cluster membership
//! - `node`: a worker node serving RPC and keeping itself registered
//!
//! # Usage
//!
//! ```text
//! skeind --config skein.toml register --port 9500
//! skeind --config skein.toml node --port 9601 --register 10.0.0.2:9500
//! ```

mod node_mode;
mod register_mode;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use skein_core::SkeinConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skeind", about = "skein cluster daemon")]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the register server.
    Register {
        /// Address to bind.
        #[arg(long)]
        ip: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Shared key encrypting registration traffic.
        #[arg(long)]
        shared_key: Option<String>,

        /// Keep the membership table on disk under this directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long)]
        workers: Option<usize>,
    },

    /// Run a worker node.
    Node {
        /// RPC listen address of this node.
        #[arg(long)]
        listen: Option<String>,

        /// Advertised RPC port; defaults to the port of `--listen`.
        #[arg(long)]
        port: Option<u16>,

        /// Requested node id.
        #[arg(long)]
        id: Option<i64>,

        #[arg(long)]
        group: Option<String>,

        /// Register server as `ip:port`.
        #[arg(long)]
        register: Option<String>,

        /// Ask the register server for a per-node session key.
        #[arg(long)]
        encrypt: bool,

        #[arg(long)]
        shared_key: Option<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,skeind=debug,skein=debug"));
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

    let mut config = match &cli.config {
        Some(path) => SkeinConfig::from_file(path)?,
        None => SkeinConfig::default(),
    };

    match cli.command {
        Command::Register {
            ip,
            port,
            shared_key,
            data_dir,
            workers,
        } => {
            if let Some(ip) = ip {
                config.register.ip = ip;
            }
            if let Some(port) = port {
                config.register.port = port;
            }
            if shared_key.is_some() {
                config.register.shared_key = shared_key;
            }
            if let Some(dir) = data_dir {
                config.register.data_dir = Some(dir.display().to_string());
            }
            if let Some(workers) = workers {
                config.server.workers = workers;
            }
            register_mode::run(config).await
        }
        Command::Node {
            listen,
            port,
            id,
            group,
            register,
            encrypt,
            shared_key,
        } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if port.is_some() {
                config.node.port = port;
            }
            if id.is_some() {
                config.node.id = id;
            }
            if let Some(group) = group {
                config.node.group = group;
            }
            if let Some(register) = register {
                let (ip, port) = register
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow::anyhow!("--register expects ip:port, got {register}"))?;
                config.register.ip = ip.to_string();
                config.register.port = port.parse()?;
            }
            if encrypt {
                config.node.encrypt = true;
            }
            if shared_key.is_some() {
                config.register.shared_key = shared_key;
            }
            node_mode::run(config).await
        }
    }
}
