//! In-memory audio output and message channel
//!
//! These stand in for audio hardware and the network so the session protocol
//! can be exercised deterministically. Everything they receive is recorded and
//! can be inspected after a session has finished.

use crate::domain::audio::{
    AudioConfig, AudioError, AudioOutput, AudioSink, OutputDevice, Result as AudioResult,
};
use crate::domain::channel::{ChannelError, Frame, MessageChannel, Result as ChannelResult};
use crate::domain::protocol::CloseReason;
use async_trait::async_trait;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Arguments of one `open_output` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenCall {
    pub config: AudioConfig,
    pub device_index: u32,
}

#[derive(Debug, Default)]
struct SinkRecord {
    frames: Vec<Vec<u8>>,
    stop_calls: usize,
    close_calls: usize,
}

/// Shared record of everything a [`MemorySink`] was asked to do
#[derive(Debug, Clone, Default)]
pub struct SinkLog(Arc<Mutex<SinkRecord>>);

impl SinkLog {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        lock(&self.0).frames.clone()
    }

    pub fn frame_count(&self) -> usize {
        lock(&self.0).frames.len()
    }

    pub fn stop_calls(&self) -> usize {
        lock(&self.0).stop_calls
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.0).close_calls
    }
}

/// Sink that records written frames instead of playing them
pub struct MemorySink {
    log: SinkLog,
    fail_after: Option<usize>,
    close_gate: Option<std_mpsc::Receiver<()>>,
    closed: bool,
}

#[async_trait]
impl AudioSink for MemorySink {
    async fn write(&mut self, bytes: &[u8]) -> AudioResult<()> {
        if self.closed {
            return Err(AudioError::SinkClosed);
        }
        let mut record = lock(&self.log.0);
        if let Some(limit) = self.fail_after {
            if record.frames.len() >= limit {
                return Err(AudioError::StreamError(
                    "simulated device failure".to_string(),
                ));
            }
        }
        record.frames.push(bytes.to_vec());
        Ok(())
    }

    fn stop(&mut self) -> AudioResult<()> {
        lock(&self.log.0).stop_calls += 1;
        Ok(())
    }

    fn close(&mut self) -> AudioResult<()> {
        if let Some(gate) = self.close_gate.take() {
            gate.recv_timeout(Duration::from_secs(2))
                .map_err(|_| AudioError::OsError("device release timed out".to_string()))?;
        }
        self.closed = true;
        lock(&self.log.0).close_calls += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OutputState {
    devices: Vec<OutputDevice>,
    enumeration_error: Option<String>,
    fail_writes_after: Option<usize>,
    close_gate: Option<std_mpsc::Receiver<()>>,
    opens: Vec<OpenCall>,
    sinks: Vec<SinkLog>,
}

/// Audio output backed by a fixed device list
///
/// Clones share state, so a test can keep one handle and give another to the
/// code under test.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    state: Arc<Mutex<OutputState>>,
}

impl MemoryOutput {
    pub fn new(devices: Vec<OutputDevice>) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutputState {
                devices,
                ..Default::default()
            })),
        }
    }

    /// Devices named in order, indexed from zero
    pub fn with_devices(names: &[&str]) -> Self {
        Self::new(
            names
                .iter()
                .enumerate()
                .map(|(index, name)| OutputDevice {
                    index: index as u32,
                    name: name.to_string(),
                })
                .collect(),
        )
    }

    /// Make every later enumeration fail with `message`
    pub fn fail_enumeration(&self, message: impl Into<String>) {
        lock(&self.state).enumeration_error = Some(message.into());
    }

    /// Make sinks opened from now on fail once they hold `frames` frames
    pub fn fail_writes_after(&self, frames: usize) {
        lock(&self.state).fail_writes_after = Some(frames);
    }

    /// Make the next opened sink's `close` block until `gate` fires
    ///
    /// A close still waiting after two seconds fails and is not counted.
    pub fn hold_next_close(&self, gate: std_mpsc::Receiver<()>) {
        lock(&self.state).close_gate = Some(gate);
    }

    pub fn open_calls(&self) -> Vec<OpenCall> {
        lock(&self.state).opens.clone()
    }

    /// Logs of every sink opened so far, in opening order
    pub fn sinks(&self) -> Vec<SinkLog> {
        lock(&self.state).sinks.clone()
    }
}

impl AudioOutput for MemoryOutput {
    fn list_output_devices(&self) -> AudioResult<Vec<OutputDevice>> {
        let state = lock(&self.state);
        match &state.enumeration_error {
            Some(message) => Err(AudioError::OsError(message.clone())),
            None => Ok(state.devices.clone()),
        }
    }

    fn open_output(
        &self,
        config: &AudioConfig,
        device_index: u32,
    ) -> AudioResult<Box<dyn AudioSink>> {
        let mut state = lock(&self.state);
        state.opens.push(OpenCall {
            config: *config,
            device_index,
        });

        if !state.devices.iter().any(|d| d.index == device_index) {
            return Err(AudioError::DeviceNotFound(format!(
                "no output device at index {}",
                device_index
            )));
        }

        let log = SinkLog::default();
        state.sinks.push(log.clone());
        Ok(Box::new(MemorySink {
            log,
            fail_after: state.fail_writes_after,
            close_gate: state.close_gate.take(),
            closed: false,
        }))
    }
}

/// What the server side of a [`MemoryChannel`] sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(Option<CloseReason>),
}

/// Server side of an in-memory connection
pub struct MemoryChannel {
    incoming: mpsc::UnboundedReceiver<ChannelResult<Frame>>,
    outgoing: mpsc::UnboundedSender<Outbound>,
    closed: bool,
}

/// Client side of an in-memory connection
pub struct ClientEnd {
    to_server: Option<mpsc::UnboundedSender<ChannelResult<Frame>>>,
    from_server: mpsc::UnboundedReceiver<Outbound>,
}

/// Create a connected server/client pair
pub fn channel_pair() -> (MemoryChannel, ClientEnd) {
    let (to_server, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_server) = mpsc::unbounded_channel();
    (
        MemoryChannel {
            incoming,
            outgoing,
            closed: false,
        },
        ClientEnd {
            to_server: Some(to_server),
            from_server,
        },
    )
}

impl ClientEnd {
    fn push(&self, item: ChannelResult<Frame>) {
        if let Some(tx) = &self.to_server {
            let _ = tx.send(item);
        }
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.push(Ok(Frame::Text(text.into())));
    }

    pub fn send_json(&self, value: &serde_json::Value) {
        self.send_text(value.to_string());
    }

    pub fn send_binary(&self, bytes: impl Into<Vec<u8>>) {
        self.push(Ok(Frame::Binary(bytes.into())));
    }

    /// Queue a transport failure after the frames already sent
    pub fn fail(&self, reason: impl Into<String>) {
        self.push(Err(ChannelError::Transport(reason.into())));
    }

    /// Close cleanly; the server sees the end of the stream after any queued frames
    pub fn close(&mut self) {
        self.to_server = None;
    }

    /// Everything the server has sent so far
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        let mut sent = Vec::new();
        while let Ok(item) = self.from_server.try_recv() {
            sent.push(item);
        }
        sent
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn recv(&mut self) -> ChannelResult<Option<Frame>> {
        match self.incoming.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn send_text(&mut self, text: String) -> ChannelResult<()> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.outgoing
            .send(Outbound::Text(text))
            .map_err(|_| ChannelError::Transport("client end dropped".to_string()))
    }

    async fn close(&mut self, reason: Option<CloseReason>) -> ChannelResult<()> {
        if !self.closed {
            self.closed = true;
            let _ = self.outgoing.send(Outbound::Close(reason));
        }
        Ok(())
    }
}
