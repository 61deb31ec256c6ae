//! TLS credentials for the listener

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument};

/// Command that creates a self-signed pair usable for local testing
pub const SELF_SIGNED_COMMAND: &str =
    "openssl req -x509 -newkey rsa:2048 -nodes -keyout key.pem -out cert.pem -days 365";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate file not found: {}", .0.display())]
    MissingCertificate(PathBuf),

    #[error("private key file not found: {}", .0.display())]
    MissingKey(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("invalid certificate or key: {0}")]
    Rustls(#[from] rustls::Error),
}

impl TlsError {
    /// Whether the operator simply has not created the credentials yet
    pub fn is_missing_file(&self) -> bool {
        matches!(
            self,
            TlsError::MissingCertificate(_) | TlsError::MissingKey(_)
        )
    }
}

/// Operator guidance printed when the credentials cannot be loaded
pub fn remediation_hint(cert_path: &Path, key_path: &Path) -> String {
    format!(
        "The server needs a TLS certificate and private key.\n\
         Expected certificate: {}\n\
         Expected private key: {}\n\
         To create a self-signed pair for testing, run:\n\n    {}\n\n\
         Browsers will warn about a self-signed certificate; accept it once by \
         opening https://<host>:<port> before connecting.",
        cert_path.display(),
        key_path.display(),
        SELF_SIGNED_COMMAND
    )
}

async fn read_pem(path: &Path, missing: fn(PathBuf) -> TlsError) -> Result<Vec<u8>, TlsError> {
    tokio::fs::read(path).await.map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            missing(path.to_path_buf())
        } else {
            TlsError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// Load a PEM certificate chain and private key into a rustls server config
#[instrument]
pub async fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let cert_pem = read_pem(cert_path, TlsError::MissingCertificate).await?;
    let key_pem = read_pem(key_path, TlsError::MissingKey).await?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|source| TlsError::Io {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    debug!(chain_len = certs.len(), "Parsed certificate chain");

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    info!(cert = %cert_path.display(), "TLS credentials loaded");
    Ok(Arc::new(config))
}

pub async fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let config = load_server_config(cert_path, key_path).await?;
    Ok(TlsAcceptor::from(config))
}
