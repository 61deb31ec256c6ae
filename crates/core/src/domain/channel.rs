//! Message-framed connection to one client
//!
//! The session only needs three operations from its transport: receive the
//! next frame, send a text message, and close with an optional reason. The
//! WebSocket-over-TLS implementation lives in the `infra` crate.

use crate::domain::protocol::CloseReason;
use async_trait::async_trait;
use thiserror::Error;

/// One discrete message from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The connection is already closed
    #[error("connection closed")]
    Closed,

    /// The connection failed or the peer went away without a clean close
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

#[async_trait]
pub trait MessageChannel: Send {
    /// Wait for the next frame
    ///
    /// Returns `Ok(None)` once the peer has closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>>;

    /// Send one text message
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Close the connection, optionally telling the peer why
    ///
    /// Closing an already closed channel is not an error.
    async fn close(&mut self, reason: Option<CloseReason>) -> Result<()>;
}
