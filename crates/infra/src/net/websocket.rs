//! WebSocket adapter for the session's message channel

use crate::net::ConnectionError;
use async_trait::async_trait;
use audiorelay_core::domain::channel::{ChannelError, Frame, MessageChannel, Result};
use audiorelay_core::domain::protocol::CloseReason;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

/// Server side of an upgraded WebSocket connection
pub struct WsChannel<S> {
    inner: WebSocketStream<S>,
    closed: bool,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Perform the WebSocket upgrade on an established stream
    pub async fn accept(stream: S) -> std::result::Result<Self, ConnectionError> {
        let inner = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(ConnectionError::Upgrade)?;
        Ok(Self::new(inner))
    }

    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            closed: false,
        }
    }
}

/// Clean closes end the stream; any other close code is a failure
fn close_outcome(frame: Option<CloseFrame<'_>>) -> Result<Option<Frame>> {
    match frame {
        None => Ok(None),
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => Ok(None),
        Some(frame) => Err(ChannelError::Transport(format!(
            "peer closed with code {}: {}",
            u16::from(frame.code),
            frame.reason
        ))),
    }
}

fn map_error(err: WsError) -> ChannelError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ChannelError::Closed,
        other => ChannelError::Transport(other.to_string()),
    }
}

#[async_trait]
impl<S> MessageChannel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            let message = match self.inner.next().await {
                None => return Ok(None),
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
            };

            match message {
                Message::Text(text) => return Ok(Some(Frame::Text(text))),
                Message::Binary(bytes) => return Ok(Some(Frame::Binary(bytes))),
                Message::Close(frame) => return close_outcome(frame),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("skipping control frame");
                }
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.inner.send(Message::Text(text)).await.map_err(map_error)
    }

    async fn close(&mut self, reason: Option<CloseReason>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let frame = reason.map(|reason| CloseFrame {
            code: CloseCode::from(reason.code),
            reason: reason.reason.into(),
        });
        match self.inner.close(frame).await {
            Ok(()) => Ok(()),
            Err(e) => match map_error(e) {
                ChannelError::Closed => Ok(()),
                other => Err(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiorelay_core::domain::protocol::CLOSE_INTERNAL_ERROR;
    use tokio::io::DuplexStream;

    async fn connected() -> (WsChannel<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let (server, client) = tokio::join!(
            WsChannel::accept(server_io),
            tokio_tungstenite::client_async("ws://localhost/", client_io)
        );
        (server.unwrap(), client.unwrap().0)
    }

    #[tokio::test]
    async fn test_text_and_binary_frames() {
        let (mut server, mut client) = connected().await;
        client.send(Message::Text("hello".to_string())).await.unwrap();
        client.send(Message::Ping(vec![1])).await.unwrap();
        client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

        assert_eq!(
            server.recv().await.unwrap(),
            Some(Frame::Text("hello".to_string()))
        );
        assert_eq!(
            server.recv().await.unwrap(),
            Some(Frame::Binary(vec![1, 2, 3]))
        );
    }

    #[tokio::test]
    async fn test_normal_close_ends_stream() {
        let (mut server, mut client) = connected().await;
        client.close(None).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_close_code_is_transport_error() {
        let (mut server, mut client) = connected().await;
        client
            .close(Some(CloseFrame {
                code: CloseCode::Protocol,
                reason: "bad".into(),
            }))
            .await
            .unwrap();
        assert!(matches!(
            server.recv().await,
            Err(ChannelError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_client_is_reported() {
        let (mut server, client) = connected().await;
        drop(client);
        assert!(matches!(
            server.recv().await,
            Err(ChannelError::Transport(_)) | Ok(None)
        ));
    }

    #[tokio::test]
    async fn test_close_with_reason_reaches_client() {
        let (mut server, mut client) = connected().await;
        server.send_text("{}".to_string()).await.unwrap();
        server
            .close(Some(CloseReason::internal_error("device error: gone")))
            .await
            .unwrap();
        server.close(None).await.unwrap();
        assert!(matches!(
            server.send_text("late".to_string()).await,
            Err(ChannelError::Closed)
        ));

        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("{}".to_string())
        );
        match client.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), CLOSE_INTERNAL_ERROR);
                assert_eq!(frame.reason, "device error: gone");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}
