//! Listener that runs one independent session per accepted connection
//!
//! Each connection gets its own task and its own `session` span carrying a
//! sequential id and the peer address. A failed TLS handshake or WebSocket
//! upgrade only drops that connection.

use crate::net::websocket::WsChannel;
use crate::net::ConnectionError;
use audiorelay_core::domain::audio::AudioOutput;
use audiorelay_core::domain::session::{Session, SessionState};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Transport security for accepted connections
#[derive(Clone)]
pub enum Security {
    Tls(TlsAcceptor),
    /// Unencrypted WebSocket, for loopback testing only
    Plaintext,
}

impl Security {
    pub fn is_tls(&self) -> bool {
        matches!(self, Security::Tls(_))
    }
}

pub struct Acceptor {
    listener: TcpListener,
    security: Security,
    output: Arc<dyn AudioOutput>,
}

impl Acceptor {
    #[instrument(skip(security, output))]
    pub async fn bind(
        addr: SocketAddr,
        security: Security,
        output: Arc<dyn AudioOutput>,
    ) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ConnectionError::Bind { addr, source })?;

        info!(
            addr = %listener.local_addr()?,
            tls = security.is_tls(),
            "Listening for connections"
        );
        Ok(Self {
            listener,
            security,
            output,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ConnectionError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` completes
    ///
    /// Sessions still running at shutdown are cancelled, which releases
    /// their output devices.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                }
                accepted = self.listener.accept() => {
                    let (tcp, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    next_id += 1;
                    let span = info_span!("session", id = next_id, peer = %peer);
                    let security = self.security.clone();
                    let output = Arc::clone(&self.output);
                    sessions.spawn(
                        async move {
                            if let Err(e) = serve_connection(tcp, security, output).await {
                                warn!(error = %e, "Connection dropped before the session started");
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }

        info!(active = sessions.len(), "Listener stopped");
        sessions.shutdown().await;
    }
}

async fn serve_connection(
    tcp: TcpStream,
    security: Security,
    output: Arc<dyn AudioOutput>,
) -> Result<SessionState, ConnectionError> {
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(error = %e, "Failed to disable Nagle's algorithm");
    }

    match security {
        Security::Tls(acceptor) => {
            let stream = acceptor
                .accept(tcp)
                .await
                .map_err(ConnectionError::Handshake)?;
            serve_stream(stream, output).await
        }
        Security::Plaintext => serve_stream(tcp, output).await,
    }
}

/// Upgrade `stream` to a WebSocket and run a session on it to completion
///
/// Returns the state the session ended in. The session logs its own outcome.
pub async fn serve_stream<S>(
    stream: S,
    output: Arc<dyn AudioOutput>,
) -> Result<SessionState, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let channel = WsChannel::accept(stream).await?;
    info!("Client connected");

    let mut session = Session::new(channel, output);
    let _ = session.run().await;
    Ok(session.state())
}
