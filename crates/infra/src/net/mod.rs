//! Secure WebSocket transport and the connection acceptor

pub mod acceptor;
pub mod tls;
pub mod websocket;

pub use acceptor::{serve_stream, Acceptor, Security};
pub use tls::{load_acceptor, remediation_hint, TlsError};
pub use websocket::WsChannel;

use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures of the listener or of a single connection before its session starts
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("WebSocket upgrade failed: {0}")]
    Upgrade(#[source] tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
