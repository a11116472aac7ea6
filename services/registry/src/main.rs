//! npm registry server binary.

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use npm_registry::RegistryConfig;
use tracing_subscriber::EnvFilter;

/// A private npm registry
#[derive(Parser, Debug)]
#[command(name = "npm-registry-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "NPM_REGISTRY_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RegistryConfig::load(path)?,
        None => RegistryConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let listen = config.listen;
    let app = config.into_builder().await?.build();

    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("npm registry listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "unable to listen for shutdown signal");
    }
}
