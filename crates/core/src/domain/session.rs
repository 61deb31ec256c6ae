//! Per-connection session state machine
//!
//! A session walks one client through three phases: it negotiates an
//! [`AudioConfig`], answers with the current device list, opens the device the
//! client selects, and then relays binary frames into that device until the
//! connection ends.
//!
//! ```text
//! AwaitingConfig -> AwaitingSelection -> Streaming -> Closed
//!        \                 \                 \
//!         +-----------------+-----------------+-----> Failed
//! ```
//!
//! The open sink is held in a [`SinkGuard`], so it is stopped and closed
//! exactly once whichever way the session ends. There is no timeout on any
//! phase: a client that never sends its configuration keeps its session
//! waiting until the connection drops.

use crate::domain::audio::{AudioConfig, AudioError, AudioOutput, AudioSink};
use crate::domain::channel::{Frame, MessageChannel};
use crate::domain::protocol::{self, ClientMessage, CloseReason, ServerMessage};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    AwaitingConfig,
    AwaitingSelection,
    Streaming,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Ways a session can end other than a clean close during streaming
#[derive(Debug, Error)]
pub enum SessionError {
    /// Configuration fields are missing, not integers, or out of range
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Undecodable message, or a message of the wrong type for the phase
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The client went away before streaming started
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    /// The client sent a selection that could not be read as a device index
    #[error("session abandoned: {0}")]
    Abandoned(String),

    /// Device enumeration or opening failed
    #[error("device error: {0}")]
    Device(#[from] AudioError),

    /// Sending to the client, reading from it while streaming, or writing
    /// to the sink failed
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Whether this is an ordinary way for a client to leave
    ///
    /// Expected endings are logged at info level and leave the session
    /// `Closed` rather than `Failed`.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            SessionError::PeerDisconnected(_) | SessionError::Abandoned(_)
        )
    }
}

/// Exclusive owner of an open sink
///
/// Releasing stops the transfer and then closes the device. It runs at most
/// once, either explicitly through [`SinkGuard::release`] or on drop.
pub struct SinkGuard {
    sink: Option<Box<dyn AudioSink>>,
}

impl SinkGuard {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), AudioError> {
        match self.sink.as_mut() {
            Some(sink) => sink.write(bytes).await,
            None => Err(AudioError::SinkClosed),
        }
    }

    /// Stop and close the sink
    ///
    /// Returns `true` if this call released it, `false` if it was already
    /// released. Errors from the sink are logged, never raised.
    pub fn release(&mut self) -> bool {
        let Some(mut sink) = self.sink.take() else {
            return false;
        };

        if let Err(e) = sink.stop() {
            warn!(error = %e, "failed to stop output stream");
        }
        if let Err(e) = sink.close() {
            warn!(error = %e, "failed to close output device");
        }
        true
    }

    pub fn is_released(&self) -> bool {
        self.sink.is_none()
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// One client connection's handshake and stream
pub struct Session<C: MessageChannel> {
    channel: C,
    output: Arc<dyn AudioOutput>,
    state: SessionState,
    config: Option<AudioConfig>,
    selected_device: Option<u32>,
    sink: Option<SinkGuard>,
    frames_written: u64,
    bytes_written: u64,
}

impl<C: MessageChannel> Session<C> {
    pub fn new(channel: C, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            channel,
            output,
            state: SessionState::AwaitingConfig,
            config: None,
            selected_device: None,
            sink: None,
            frames_written: 0,
            bytes_written: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> Option<&AudioConfig> {
        self.config.as_ref()
    }

    pub fn selected_device(&self) -> Option<u32> {
        self.selected_device
    }

    pub fn has_sink(&self) -> bool {
        self.sink.as_ref().is_some_and(|guard| !guard.is_released())
    }

    /// Binary frames written to the sink so far
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Drive the session until the connection ends
    ///
    /// A clean close while streaming returns `Ok(())`. Every other ending is
    /// returned as an error; check [`SessionError::is_expected`] to tell an
    /// ordinary departure from a failure. The sink is released before this
    /// returns.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        loop {
            if self.step().await?.is_terminal() {
                return Ok(());
            }
        }
    }

    /// Run the current phase to completion and return the new state
    ///
    /// When the phase ends the session, the sink is released and the
    /// connection closed before returning.
    pub async fn step(&mut self) -> Result<SessionState, SessionError> {
        let outcome = match self.state {
            SessionState::AwaitingConfig => self.await_config().await,
            SessionState::AwaitingSelection => self.await_selection().await,
            SessionState::Streaming => self.stream().await,
            SessionState::Closed | SessionState::Failed => {
                return Err(SessionError::ProtocolViolation(format!(
                    "session already ended ({:?})",
                    self.state
                )));
            }
        };

        match outcome {
            Ok(next) if next.is_terminal() => {
                info!(
                    frames = self.frames_written,
                    bytes = self.bytes_written,
                    "client closed the stream"
                );
                self.finish(next).await;
                Ok(self.state)
            }
            Ok(next) => {
                self.state = next;
                Ok(next)
            }
            Err(e) => {
                let terminal = if e.is_expected() {
                    info!(reason = %e, state = ?self.state, "session ended by client");
                    SessionState::Closed
                } else if self.state == SessionState::Streaming {
                    error!(error = %e, frames = self.frames_written, "streaming failed");
                    SessionState::Failed
                } else {
                    warn!(error = %e, state = ?self.state, "handshake failed");
                    SessionState::Failed
                };
                self.finish(terminal).await;
                Err(e)
            }
        }
    }

    /// Release the sink if one is held
    ///
    /// Returns `true` only for the call that actually released it. Safe to
    /// call any number of times, including before a sink was opened.
    pub fn teardown(&mut self) -> bool {
        let released = self
            .sink
            .take()
            .map(|mut guard| guard.release())
            .unwrap_or(false);
        if released {
            debug!(frames = self.frames_written, "output sink released");
        }
        released
    }

    /// Release the sink on the blocking pool
    ///
    /// Closing a device can wait on the audio backend; other sessions keep
    /// running meanwhile.
    async fn release_sink(&mut self) -> bool {
        let Some(mut guard) = self.sink.take() else {
            return false;
        };
        match tokio::task::spawn_blocking(move || guard.release()).await {
            Ok(released) => {
                if released {
                    debug!(frames = self.frames_written, "output sink released");
                }
                released
            }
            Err(e) => {
                warn!(error = %e, "output sink release did not complete");
                false
            }
        }
    }

    async fn finish(&mut self, terminal: SessionState) {
        self.release_sink().await;
        self.state = terminal;
        if let Err(e) = self.channel.close(None).await {
            trace!(error = %e, "connection already gone");
        }
    }

    /// Close with 1011 and the error's description, then hand the error back
    async fn abort(&mut self, error: SessionError) -> SessionError {
        let reason = CloseReason::internal_error(error.to_string());
        if let Err(e) = self.channel.close(Some(reason)).await {
            debug!(error = %e, "failed to send close reason");
        }
        error
    }

    #[instrument(level = "debug", skip(self))]
    async fn await_config(&mut self) -> Result<SessionState, SessionError> {
        let text = match self.channel.recv().await {
            Ok(Some(Frame::Text(text))) => text,
            Ok(Some(Frame::Binary(bytes))) => {
                let error = SessionError::ProtocolViolation(format!(
                    "expected a config message, got {} binary bytes",
                    bytes.len()
                ));
                return Err(self.abort(error).await);
            }
            Ok(None) => {
                return Err(SessionError::PeerDisconnected(
                    "closed before sending a configuration".to_string(),
                ))
            }
            Err(e) => return Err(SessionError::PeerDisconnected(e.to_string())),
        };

        let payload = match protocol::decode_client_message(&text) {
            Ok(ClientMessage::Config(payload)) => payload,
            Ok(other) => {
                return Err(SessionError::ProtocolViolation(format!(
                    "expected `config`, got `{}`",
                    other.kind()
                )));
            }
            Err(e) => {
                return Err(self
                    .abort(SessionError::ProtocolViolation(e.to_string()))
                    .await)
            }
        };

        let config = match payload.into_config() {
            Ok(config) => config,
            Err(e) => return Err(self.abort(SessionError::ConfigInvalid(e.to_string())).await),
        };

        info!(
            rate_hz = config.sample_rate_hz,
            channels = config.channels,
            format = %config.format,
            frames_per_buffer = config.frames_per_buffer,
            "audio configuration accepted"
        );
        self.config = Some(config);

        let devices =
            match run_blocking(Arc::clone(&self.output), |output| output.list_output_devices())
                .await
            {
                Ok(devices) => devices,
                Err(e) => return Err(self.abort(SessionError::Device(e)).await),
            };
        let count = devices.len();

        let message = match ServerMessage::Devices(devices).to_json() {
            Ok(message) => message,
            Err(e) => {
                let error = SessionError::Transport(format!("failed to encode device list: {}", e));
                return Err(self.abort(error).await);
            }
        };
        if let Err(e) = self.channel.send_text(message).await {
            return Err(self.abort(SessionError::Transport(e.to_string())).await);
        }

        info!(count, "device list sent");
        Ok(SessionState::AwaitingSelection)
    }

    #[instrument(level = "debug", skip(self))]
    async fn await_selection(&mut self) -> Result<SessionState, SessionError> {
        let text = match self.channel.recv().await {
            Ok(Some(Frame::Text(text))) => text,
            Ok(Some(Frame::Binary(bytes))) => {
                return Err(SessionError::Abandoned(format!(
                    "expected a device selection, got {} binary bytes",
                    bytes.len()
                )))
            }
            Ok(None) => {
                return Err(SessionError::PeerDisconnected(
                    "closed before selecting a device".to_string(),
                ))
            }
            Err(e) => return Err(SessionError::PeerDisconnected(e.to_string())),
        };

        let data = match protocol::decode_client_message(&text) {
            Ok(ClientMessage::SelectDevice(data)) => data,
            Ok(other) => {
                return Err(SessionError::ProtocolViolation(format!(
                    "expected `select_device`, got `{}`",
                    other.kind()
                )));
            }
            Err(e) => return Err(SessionError::Abandoned(e.to_string())),
        };

        let requested = protocol::parse_integer(&data).ok_or_else(|| {
            SessionError::Abandoned(format!("device index is not an integer: {}", data))
        })?;
        let index = match u32::try_from(requested) {
            Ok(index) => index,
            Err(_) => {
                let error = SessionError::Device(AudioError::DeviceNotFound(format!(
                    "no output device at index {}",
                    requested
                )));
                return Err(self.abort(error).await);
            }
        };

        let Some(config) = self.config else {
            return Err(self
                .abort(SessionError::ProtocolViolation(
                    "device selected before configuration".to_string(),
                ))
                .await);
        };
        self.selected_device = Some(index);

        let sink = match run_blocking(Arc::clone(&self.output), move |output| {
            output.open_output(&config, index)
        })
        .await
        {
            Ok(sink) => sink,
            Err(e) => return Err(self.abort(SessionError::Device(e)).await),
        };

        info!(device_index = index, "output device opened, streaming");
        self.sink = Some(SinkGuard::new(sink));
        Ok(SessionState::Streaming)
    }

    async fn stream(&mut self) -> Result<SessionState, SessionError> {
        loop {
            let bytes = match self.channel.recv().await {
                Ok(Some(Frame::Binary(bytes))) => bytes,
                Ok(Some(Frame::Text(text))) => {
                    trace!(len = text.len(), "ignoring text frame while streaming");
                    continue;
                }
                Ok(None) => return Ok(SessionState::Closed),
                Err(e) => return Err(SessionError::Transport(e.to_string())),
            };

            let written = match self.sink.as_mut() {
                Some(guard) => guard.write(&bytes).await,
                None => Err(AudioError::SinkClosed),
            };
            if let Err(e) = written {
                let error = SessionError::Transport(format!("sink write failed: {}", e));
                return Err(self.abort(error).await);
            }

            self.frames_written += 1;
            self.bytes_written += bytes.len() as u64;
        }
    }
}

impl<C: MessageChannel> Drop for Session<C> {
    /// A session cancelled mid-stream still gives its device back
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Run a backend call on the blocking pool
async fn run_blocking<T, F>(output: Arc<dyn AudioOutput>, op: F) -> Result<T, AudioError>
where
    T: Send + 'static,
    F: FnOnce(&dyn AudioOutput) -> Result<T, AudioError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&*output))
        .await
        .map_err(|e| AudioError::OsError(format!("audio backend task failed: {}", e)))?
}
