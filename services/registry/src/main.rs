//! Command line entry point for the registry server.

use camino::Utf8PathBuf;
use clap::Parser;

use bundle_registry::{RegistryBuilder, RegistryServer, ServerConfig};
use bundle_storage::{BundleConfig, StorageConfig};

/// Serve container images and Helm charts from bundle archives.
#[derive(Debug, Parser)]
#[command(name = "registry-server", version)]
struct Args {
    /// Bundle archives to serve, in priority order
    #[arg(required_unless_present = "root")]
    archives: Vec<Utf8PathBuf>,

    /// Serve a writable filesystem tree instead of bundle archives
    #[arg(long, conflicts_with = "archives")]
    root: Option<Utf8PathBuf>,

    /// Repository prefix to strip from request paths
    #[arg(long)]
    repositories_prefix: Option<String>,

    /// Maximum number of concurrent storage operations
    #[arg(long)]
    max_threads: Option<usize>,

    /// Host or address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on; 0 picks an ephemeral port
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// PEM certificate chain for TLS
    #[arg(long, requires = "tls_key")]
    tls_certificate: Option<Utf8PathBuf>,

    /// PEM private key for TLS
    #[arg(long, requires = "tls_certificate")]
    tls_key: Option<Utf8PathBuf>,

    /// Refuse pushes and deletes even on writable storage
    #[arg(long)]
    read_only: bool,
}

impl Args {
    fn storage_config(&self) -> StorageConfig {
        match &self.root {
            Some(root) => StorageConfig::Filesystem { root: root.clone() },
            None => StorageConfig::Bundle(BundleConfig {
                archives: self.archives.clone(),
                repositories_prefix: self.repositories_prefix.clone(),
                max_threads: self.max_threads,
            }),
        }
    }

    // Bundle archives cannot accept writes, so they force read-only mode.
    fn read_only(&self) -> bool {
        self.read_only || self.root.is_none()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let storage = args.storage_config().build().await?;
    let app = RegistryBuilder::new()
        .storage(storage)
        .read_only(args.read_only())
        .build();

    let server = RegistryServer::bind(&ServerConfig {
        host: args.host.clone(),
        port: args.port,
        tls_certificate: args.tls_certificate.clone(),
        tls_key: args.tls_key.clone(),
    })?;

    tracing::info!(address = %server.address(), read_only = args.read_only(), "serving registry");
    server.serve(app).await?;
    Ok(())
}
