//! Transport adapters
//!
//! The connection state machine is generic over `AsyncRead + AsyncWrite`;
//! this module adapts non-TCP transports to that interface.

mod websocket;

pub use websocket::WsStream;
