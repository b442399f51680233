//! The `utils` module provides definitions shared across `autobahn`: the
//! error taxonomy and the tracing initialization.

pub mod error;
pub mod logging;

pub use error::{DecodeError, EncodeError, Error, Result, TransportError};
