//! Helpers for driving a loopback relay server from WebSocket clients
//!
//! The server runs the real acceptor and WebSocket adapter over plain `ws://`
//! on an ephemeral port, with the in-memory audio output standing in for
//! hardware.

use audiorelay_core::domain::audio::AudioOutput;
use audiorelay_core::testing::MemoryOutput;
use audiorelay_infra::{Acceptor, Security};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub output: MemoryOutput,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(output: MemoryOutput) -> Self {
        let shared: Arc<dyn AudioOutput> = Arc::new(output.clone());
        let acceptor = Acceptor::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Security::Plaintext,
            shared,
        )
        .await
        .expect("bind loopback listener");
        let addr = acceptor.local_addr().expect("listener address");

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(acceptor.run_until(async {
            let _ = stopped.await;
        }));

        Self {
            addr,
            output,
            stop: Some(stop),
            task,
        }
    }

    pub async fn with_devices(names: &[&str]) -> Self {
        Self::start(MemoryOutput::with_devices(names)).await
    }

    pub async fn connect(&self) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/", self.addr))
            .await
            .expect("connect to test server");
        client
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(WAIT, &mut self.task)
            .await
            .expect("server stops in time")
            .expect("server task");
    }
}

pub fn config_message(sample_rate: u32, channels: u16, width: i64, frames_per_buffer: u32) -> Message {
    Message::Text(
        json!({
            "type": "config",
            "data": {
                "sampleRate": sample_rate,
                "channels": channels,
                "sampleWidthBytes": width,
                "framesPerBuffer": frames_per_buffer
            }
        })
        .to_string(),
    )
}

pub fn select_message(index: Value) -> Message {
    Message::Text(json!({"type": "select_device", "data": index}).to_string())
}

/// Next message from the server; `None` once the connection has ended
pub async fn next_message(client: &mut Client) -> Option<Message> {
    match tokio::time::timeout(WAIT, client.next()).await {
        Ok(Some(Ok(message))) => Some(message),
        Ok(Some(Err(_))) | Ok(None) => None,
        Err(_) => panic!("no message from server within {:?}", WAIT),
    }
}

/// Parse the next message as a `devices` list
pub async fn expect_devices(client: &mut Client) -> Value {
    match next_message(client).await {
        Some(Message::Text(text)) => {
            let value: Value = serde_json::from_str(&text).expect("devices message is JSON");
            assert_eq!(value["type"], "devices");
            value["data"].clone()
        }
        other => panic!("expected a devices message, got {:?}", other),
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {:?}",
            WAIT
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
