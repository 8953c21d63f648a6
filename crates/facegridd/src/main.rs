//! facegridd — the facegrid daemon.
//!
//! One binary, one role per process:
//! - `gateway`: HTTP front door plus response drainer
//! - `worker`: recognition worker
//! - `autoscaler`: EC2 pool controller
//! - `standalone`: everything in one process over in-memory backends
//! - `enroll`: build a recognition gallery from labelled images
//!
//! # Usage
//!
//! ```text
//! facegridd --config facegrid.toml gateway --listen 0.0.0.0:8000
//! facegridd --config facegrid.toml worker
//! facegridd enroll --images faces/ --out gallery.json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use facegrid_core::FacegridConfig;
use facegridd::roles;
use facegridd::standalone::Standalone;

#[derive(Parser)]
#[command(name = "facegridd", about = "facegrid face recognition pipeline daemon")]
struct Cli {
    /// Path to facegrid.toml. Settings may also come from FACEGRID_* variables.
    #[arg(long, global = true, env = "FACEGRID_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway and response drainer.
    Gateway {
        /// Address to listen on (overrides gateway.listen).
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Run a recognition worker.
    Worker,

    /// Run the instance autoscaler.
    Autoscaler,

    /// Run every role in one process with in-memory queues and storage.
    Standalone {
        /// Address to listen on (overrides gateway.listen).
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Build a gallery from a directory of images named after their label.
    Enroll {
        /// Directory of images, e.g. `faces/alice.jpg`.
        #[arg(long)]
        images: PathBuf,

        /// Where to write the gallery JSON.
        #[arg(long, default_value = "gallery.json")]
        out: PathBuf,

        /// Thumbnail side length; must match worker.thumbnail_side.
        #[arg(long, default_value = "16")]
        thumbnail_side: u32,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,facegrid=debug,facegridd=debug".parse().unwrap());

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
    init_tracing(cli.json_logs);

    let load_config = || FacegridConfig::load(cli.config.as_deref());

    match cli.command {
        Command::Gateway { listen } => {
            let mut config = load_config()?;
            if let Some(listen) = listen {
                config.gateway.listen = listen;
            }
            roles::run_gateway(config).await
        }
        Command::Worker => roles::run_worker(load_config()?).await,
        Command::Autoscaler => roles::run_autoscaler(load_config()?).await,
        Command::Standalone { listen } => {
            let mut config = load_config()?;
            if let Some(listen) = listen {
                config.gateway.listen = listen;
            }
            run_standalone(config).await
        }
        Command::Enroll {
            images,
            out,
            thumbnail_side,
        } => roles::run_enroll(&images, &out, thumbnail_side),
    }
}

async fn run_standalone(config: FacegridConfig) -> anyhow::Result<()> {
    let recognizer = roles::load_recognizer(&config)?;
    let standalone = Standalone::new(config, recognizer);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(facegridd::shutdown_on_ctrl_c(shutdown_tx));

    standalone.run(shutdown_rx).await
}
