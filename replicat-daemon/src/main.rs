use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use replicat_daemon::config::ConfigFile;

/// Multi-node content synchronizer daemon.
#[derive(Parser, Debug)]
#[command(name = "replicat", version, about)]
struct Args {
    /// Directory to track and synchronize
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// Manager address (host:port)
    #[arg(short, long)]
    manager: Option<String>,

    /// Shared cluster credentials as user:password
    #[arg(long)]
    manager_credentials: Option<String>,

    /// Key identifying the cluster to join
    #[arg(long)]
    cluster_key: Option<String>,

    /// Address this node's HTTP surface binds to (host:port)
    #[arg(short, long)]
    address: Option<String>,

    /// Unique name of this node within the cluster
    #[arg(short, long)]
    name: Option<String>,

    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn as_config(&self) -> ConfigFile {
        ConfigFile {
            directory: self.directory.clone(),
            manager: self.manager.clone(),
            manager_credentials: self.manager_credentials.clone(),
            cluster_key: self.cluster_key.clone(),
            address: self.address.clone(),
            name: self.name.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let file = match &args.config {
        Some(path) => ConfigFile::load(path)
            .with_context(|| format!("reading config file {:?}", path))?,
        None => ConfigFile::default(),
    };
    let settings = file.merged(args.as_config()).finalize()?;

    replicat_daemon::run(settings).await?;
    Ok(())
}
