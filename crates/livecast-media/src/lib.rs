//! Livecast Media Server Library
//!
//! Accepts browser media streams over WebSocket and forwards them to a
//! broadcast endpoint through one encoder subprocess per stream:
//! - Readiness checks of the downstream endpoint
//! - Encoder subprocess supervision
//! - Bounded relay from socket payloads to encoder stdin
//! - Session registry and lifecycle management
//! - HTTP control API and stream metadata

pub mod readiness;
pub mod relay;
pub mod server;
pub mod session;
pub mod streams;
pub mod transcoder;
