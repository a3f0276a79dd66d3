use std::path::PathBuf;

use clap::Parser;
use meshd::{identity_store, MeshNode, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "meshd")]
struct Args {
    /// Settings bundle, read at startup.
    #[arg(long, default_value = "./node.toml")]
    config: PathBuf,
    /// Private identity key, created on first run.
    #[arg(long, default_value = "./identity.key")]
    identity: PathBuf,
    /// LXMF message store directory.
    #[arg(long, default_value = "./messages")]
    store: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = match NodeConfig::from_path(&args.config) {
        Ok(config) => config,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::info!("meshd: no config at {:?}, using defaults", args.config);
            NodeConfig::default()
        }
        Err(err) => {
            log::error!("meshd: failed to read {:?}: {err}", args.config);
            std::process::exit(1);
        }
    };

    let identity = match identity_store::load_or_create_identity(&args.identity) {
        Ok(identity) => identity,
        Err(err) => {
            log::error!("meshd: failed to load identity at {:?}: {err}", args.identity);
            std::process::exit(1);
        }
    };

    let node = match MeshNode::new(config, identity, &args.store).await {
        Ok(node) => node,
        Err(err) => {
            log::error!("meshd: failed to start: {err}");
            std::process::exit(1);
        }
    };

    log::info!("meshd: started, entering main loop");
    node.run().await;
}
