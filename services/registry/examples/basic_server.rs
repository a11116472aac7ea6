//! Basic npm registry server example
//!
//! Run with: cargo run -p npm-registry --features cli --example basic_server

use npm_registry::RegistryBuilder;
use storage::MemoryStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Packages live only as long as the process
    let storage = MemoryStorage::with_buckets(&["registry"]);

    let addr = "127.0.0.1:4873";
    let app = RegistryBuilder::new(storage.into())
        .bucket("registry")
        .url_prefix(format!("http://{addr}/"))
        .build();

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("npm registry listening on http://{}", addr);
    tracing::info!("Try: npm --registry http://{}/ publish", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
