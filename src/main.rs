use std::path::PathBuf;

use clap::Parser;
use faasgate::config::ServerConfig;
use faasgate::service::Service;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file")]
    config: PathBuf,
}

fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let cli = Cli::parse();
    let config = match cli
        .config
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("config path is not valid utf-8"))
        .and_then(ServerConfig::from_path)
    {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err:#}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.io_worker_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to build runtime: {err}");
            std::process::exit(1);
        }
    };

    let service = Service::new(config);
    if let Err(err) = runtime.block_on(service.start()) {
        error!("gateway exited with error: {err:#}");
        std::process::exit(1);
    }
}
