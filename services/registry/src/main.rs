//! `registry-server`: serve the registry over HTTP.

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;

use image_registry::{Config, LogFormat};

/// Legacy (v1) image registry server
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Storage bucket, overriding the configuration file
    #[arg(short, long)]
    bucket: Option<String>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(bucket) = cli.bucket {
        config.bucket = bucket;
    }

    init_tracing(config.log_format);

    let storage = config
        .storage
        .clone()
        .build()
        .await
        .wrap_err("configuring storage")?;
    tracing::info!(driver = storage.name(), bucket = %config.bucket, "storage ready");

    let app = config.registry(storage).build();

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen))?;
    tracing::info!("registry listening on http://{}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
        })
        .await
        .wrap_err("serving registry")?;

    Ok(())
}
