//! Platform layer: CPAL playback, TLS and the WebSocket listener

pub mod audio;
pub mod net;

pub use audio::{CpalOutput, CpalSink};
pub use net::{Acceptor, ConnectionError, Security, TlsError, WsChannel};
