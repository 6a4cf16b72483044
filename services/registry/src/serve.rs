//! Listener bootstrap for the registry
//!
//! The listener is bound eagerly so that callers can learn the actual
//! address before any request is served, which makes port `0` usable for
//! embedding the registry in tests and air-gap provisioning tools.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use camino::Utf8PathBuf;

/// Errors raised while bootstrapping or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The configuration is inconsistent
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    /// The listen address did not resolve
    #[error("could not resolve listen address {0}")]
    Resolve(String),

    /// Binding the listen socket failed
    #[error("could not bind {addr}")]
    Bind {
        /// The address that failed to bind
        addr: SocketAddr,
        /// The underlying socket error
        #[source]
        source: io::Error,
    },

    /// TLS certificate or key material could not be loaded
    #[error("could not load TLS material")]
    Tls(#[source] io::Error),

    /// The server stopped with an error
    #[error("server error")]
    Serve(#[source] io::Error),
}

/// Listener configuration for the registry server.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ServerConfig {
    /// Host or address to listen on.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on. Port `0` asks the kernel for an ephemeral port,
    /// readable from [`RegistryServer::address`] after binding.
    #[serde(default)]
    pub port: u16,

    /// PEM certificate chain path. Requires `tls-key`.
    #[serde(default)]
    pub tls_certificate: Option<Utf8PathBuf>,

    /// PEM private key path. Requires `tls-certificate`.
    #[serde(default)]
    pub tls_key: Option<Utf8PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            tls_certificate: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    /// TLS material comes as a pair or not at all.
    fn tls(&self) -> Result<Option<(&Utf8PathBuf, &Utf8PathBuf)>, ServeError> {
        match (&self.tls_certificate, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some((cert, key))),
            (None, None) => Ok(None),
            (Some(_), None) => Err(ServeError::InvalidConfig(
                "tls-certificate is set but tls-key is missing".to_string(),
            )),
            (None, Some(_)) => Err(ServeError::InvalidConfig(
                "tls-key is set but tls-certificate is missing".to_string(),
            )),
        }
    }
}

/// A bound registry listener, ready to serve a router.
#[derive(Debug)]
pub struct RegistryServer {
    listener: TcpListener,
    address: SocketAddr,
    tls: Option<(Utf8PathBuf, Utf8PathBuf)>,
}

impl RegistryServer {
    /// Validate the configuration and bind the listen socket.
    pub fn bind(config: &ServerConfig) -> Result<Self, ServeError> {
        let tls = config
            .tls()?
            .map(|(cert, key)| (cert.clone(), key.clone()));

        let target = format!("{}:{}", config.host, config.port);
        let addr = target
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ServeError::Resolve(target))?;

        let listener = TcpListener::bind(addr).map_err(|source| ServeError::Bind { addr, source })?;
        listener.set_nonblocking(true).map_err(ServeError::Serve)?;
        let address = listener.local_addr().map_err(ServeError::Serve)?;

        tracing::info!(%address, tls = tls.is_some(), "registry listener bound");
        Ok(Self {
            listener,
            address,
            tls,
        })
    }

    /// The address the listener is actually bound to.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Serve the router on this listener until the server stops.
    pub async fn serve(self, app: Router) -> Result<(), ServeError> {
        match self.tls {
            Some((cert, key)) => {
                let tls = RustlsConfig::from_pem_file(cert.as_std_path(), key.as_std_path())
                    .await
                    .map_err(ServeError::Tls)?;
                axum_server::from_tcp_rustls(self.listener, tls)
                    .serve(app.into_make_service())
                    .await
                    .map_err(ServeError::Serve)
            }
            None => axum_server::from_tcp(self.listener)
                .serve(app.into_make_service())
                .await
                .map_err(ServeError::Serve),
        }
    }
}
