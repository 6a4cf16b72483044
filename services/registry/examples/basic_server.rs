//! Basic bundle registry server example
//!
//! Run with: cargo run -p bundle-registry --example basic_server -- bundle.tar

use bundle_registry::{RegistryBuilder, RegistryServer, ServerConfig};
use bundle_storage::{BundleConfig, StorageConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Serve the bundle archives named on the command line, earliest first
    let archives: Vec<_> = std::env::args().skip(1).map(Into::into).collect();
    let storage = StorageConfig::Bundle(BundleConfig {
        archives,
        repositories_prefix: None,
        max_threads: None,
    })
    .build()
    .await?;

    // Build the registry service; bundles are immutable, so read-only
    let app = RegistryBuilder::new()
        .storage(storage)
        .read_only(true)
        .build();

    // Bind to an ephemeral port and report the resolved address
    let server = RegistryServer::bind(&ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        tls_certificate: None,
        tls_key: None,
    })?;

    tracing::info!("OCI Registry listening on http://{}", server.address());
    tracing::info!("Try: curl http://{}/v2/", server.address());

    // Serve the registry
    server.serve(app).await?;

    Ok(())
}
