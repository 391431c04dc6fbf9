//! TLS client context for the encrypted upstream variant.
//!
//! Built once at startup from [`UpstreamTlsOptions`] and shared by every
//! bridge.  Trust anchors are the bundled webpki roots plus, optionally, the
//! certificates in a PEM file (handy for brokers with a private CA).

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::domain::{UpstreamTarget, UpstreamTlsOptions};

/// Errors raised while building the TLS context.  All of them are fatal at
/// startup.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("failed to read CA file {path}: {source}")]
    ReadCaFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in CA file {0}")]
    EmptyCaFile(PathBuf),

    #[error("rejected certificate from CA file {path}: {source}")]
    InvalidCertificate {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },

    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),

    #[error("invalid TLS server name '{0}'")]
    InvalidServerName(String),
}

/// Everything the encrypted transport needs to run a handshake.
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsContext {
    /// Builds the context for `upstream`.
    ///
    /// # Errors
    ///
    /// Returns [`TlsSetupError`] if the CA file cannot be read or holds no
    /// usable certificate, or if the verification name is not a valid DNS
    /// name or IP address.
    pub fn from_options(
        options: &UpstreamTlsOptions,
        upstream: &UpstreamTarget,
    ) -> Result<Self, TlsSetupError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &options.ca_file {
            let added = add_pem_certificates(&mut roots, path)?;
            debug!("loaded {added} extra trust anchor(s) from {}", path.display());
        }

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

        let name = options
            .server_name
            .clone()
            .unwrap_or_else(|| upstream.host.clone());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| TlsSetupError::InvalidServerName(name))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Adds every certificate in the PEM file at `path` to `roots`.
fn add_pem_certificates(roots: &mut RootCertStore, path: &Path) -> Result<usize, TlsSetupError> {
    let read_err = |source| TlsSetupError::ReadCaFile {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(read_err)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;

    if certs.is_empty() {
        return Err(TlsSetupError::EmptyCaFile(path.to_path_buf()));
    }

    let count = certs.len();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|source| TlsSetupError::InvalidCertificate {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(count)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
