//! # Air-gap OCI registry
//!
//! An OCI Distribution-API server that serves container images and Helm
//! charts straight out of bundle archives, following the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec).
//!
//! ## Features
//!
//! - Manifest and blob retrieval, tag listing
//! - Pluggable storage backend via the `bundle-storage` crate: read-only
//!   bundle archives for serving, a writable filesystem tree for
//!   assembling fresh bundles
//! - Read-only mode that rejects write requests at the HTTP layer
//! - Listener bootstrap with ephemeral-port selection and optional TLS
//!
//! ## Example
//!
//! ```no_run
//! use bundle_registry::{RegistryBuilder, RegistryServer, ServerConfig};
//! use bundle_storage::{BundleConfig, StorageConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = StorageConfig::Bundle(BundleConfig {
//!     archives: vec!["bundle.tar".into()],
//!     repositories_prefix: None,
//!     max_threads: None,
//! })
//! .build()
//! .await?;
//!
//! let app = RegistryBuilder::new()
//!     .storage(storage)
//!     .read_only(true)
//!     .build();
//!
//! let server = RegistryServer::bind(&ServerConfig::default())?;
//! println!("registry available at {}", server.address());
//! server.serve(app).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
mod error;
mod manifest;
mod serve;
mod storage;

pub use api::RegistryBuilder;
pub use error::{RegistryError, RegistryResult};
pub use serve::{RegistryServer, ServeError, ServerConfig};
