use clap::Parser;
use relay_rs::{Config, Network, Service};
use std::future::Future;
use tokio::signal;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[clap(author, version, name = "relay", about = "run a block auction relay", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[clap(env = "RELAY_CONFIG")]
    config_file: Option<String>,

    /// Network preset, overriding the configuration file
    #[clap(long)]
    network: Option<Network>,

    /// Listen address, overriding the configuration file
    #[clap(long)]
    listen_addr: Option<std::net::SocketAddr>,
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_task_until_signal(task: impl Future<Output = eyre::Result<()>>) -> eyre::Result<()> {
    tokio::select! {
        task = task => task,
        _ = signal::ctrl_c() => Ok(()),
    }
}

async fn run(cli: Cli) -> eyre::Result<()> {
    let mut config = match cli.config_file.as_deref() {
        Some(path) => Config::from_toml_file(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(network) = cli.network {
        config.network = network;
    }
    if let Some(listen_addr) = cli.listen_addr {
        config.listen_addr = listen_addr;
    }

    info!("configured for `{}`", config.network);
    let handle = Service::from(config).spawn().await?;
    Ok(handle.await?)
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    setup_logging();

    run_task_until_signal(run(cli)).await
}
