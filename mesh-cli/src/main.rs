mod config;
mod log;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mesh_core::{MeshNode, OverlayEvent, SidecarOverlay};

use crate::config::FileConfig;

#[derive(Parser)]
#[command(name = "mesh-cli", about = "Run and inspect a mesh-core node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter mesh.toml into a directory.
    Init {
        /// Directory to write mesh.toml into (defaults to the current directory).
        dir: Option<PathBuf>,
    },
    /// Run a node until interrupted.
    Dev {
        /// This device's stable id. Generated if omitted.
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "mesh")]
        prefix: String,
        #[arg(long)]
        sidecar: PathBuf,
        #[arg(long = "state-dir", default_value = "./state")]
        state_dir: PathBuf,
        #[arg(long = "auth-key")]
        auth_key: Option<String>,
        #[arg(long = "type", default_value = "desktop")]
        device_type: String,
    },
    /// Validate a mesh.toml and print what it resolves to.
    Status {
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    log::setup_logger()?;
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Init { dir } => run_init(dir),
        Command::Dev {
            name,
            prefix,
            sidecar,
            state_dir,
            auth_key,
            device_type,
        } => run_dev(name, prefix, sidecar, state_dir, auth_key, device_type).await,
        Command::Status { dir } => run_status(dir),
    };

    match exit_code {
        Ok(()) => Ok(()),
        Err(e) => {
            ::log::error!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn run_init(dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir.unwrap_or_else(|| PathBuf::from("."));
    let path = FileConfig::write_template(&dir)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn run_status(dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir.unwrap_or_else(|| PathBuf::from("."));
    let config = FileConfig::load(&dir)?;
    let node_config = config.into_node_config();
    println!("hostname:    {}", node_config.hostname());
    println!("sidecar:     {}", node_config.sidecar_path);
    println!("state dir:   {}", node_config.state_dir);
    println!("mesh port:   {}", node_config.mesh_port);
    println!(
        "user-designated primary: {}",
        node_config.user_designated_primary
    );
    Ok(())
}

async fn run_dev(
    name: Option<String>,
    prefix: String,
    sidecar: PathBuf,
    state_dir: PathBuf,
    auth_key: Option<String>,
    device_type: String,
) -> anyhow::Result<()> {
    let device_id = name.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    std::fs::create_dir_all(&state_dir)?;

    let mut node_config = mesh_core::NodeConfig::new(
        device_id,
        device_type,
        prefix,
        sidecar.to_string_lossy().to_string(),
        state_dir.to_string_lossy().to_string(),
    );
    node_config.auth_key = auth_key;

    let overlay = SidecarOverlay::new(node_config.sidecar_path.clone());
    let mut overlay_events = overlay.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = overlay_events.recv().await {
            if let OverlayEvent::Error { message } = event {
                ::log::warn!("sidecar reported an error: {message}");
            }
        }
    });

    let node = MeshNode::new(node_config, overlay);
    node.start().await?;

    ::log::info!("node running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
