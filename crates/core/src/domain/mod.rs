//! Domain entities and business rules

pub mod audio;
pub mod channel;
pub mod config;
pub mod pcm;
pub mod protocol;
pub mod session;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{AudioConfig, AudioError, AudioOutput, AudioSink, OutputDevice, SampleFormat};
pub use channel::{ChannelError, Frame, MessageChannel};
pub use config::{AudioSettings, ConfigError, ServerConfig, TlsConfig};
pub use pcm::PcmDecoder;
pub use protocol::{ClientMessage, CloseReason, ProtocolError, ServerMessage};
pub use session::{Session, SessionError, SessionState, SinkGuard};
