//! API server builder and router

use axum::Router;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use serde_json::json;

use crate::storage::RegistryStorage;

/// Registry builder for configuring and creating the registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Option<bundle_storage::Storage>,
    read_only: bool,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            storage: None,
            read_only: false,
        }
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: bundle_storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Serve pulls only, leaving push and delete routes unmounted
    ///
    /// Unmatched methods on matched paths answer with 405, so clients
    /// attempting a push get a clear signal rather than a 404.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let storage = self.storage.expect("storage backend must be configured");
        let registry_storage = RegistryStorage::new(storage);

        Router::new()
            .route("/v2/", get(api_version_check))
            .merge(crate::blob::router(self.read_only))
            .merge(crate::manifest::router(self.read_only))
            .with_state(registry_storage)
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}
