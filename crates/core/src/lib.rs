//! Core of the audio relay: wire protocol, session state machine and the
//! capability traits implemented by the platform layer.

pub mod domain;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use domain::*;
