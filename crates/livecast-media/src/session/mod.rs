//! Ingest session management.
//!
//! One session per producer connection: readiness gate, encoder subprocess,
//! relay pipe, and a single idempotent teardown.

mod connection;
mod manager;
mod registry;
mod state;

pub use connection::{
    ChannelConnection, ChannelProducer, CloseReason, ConnectionCloser, InboundConnection,
    InboundEvents, TransportError,
};
pub use manager::{ManagerConfig, ManagerError, SessionManager};
pub use registry::{RegistryError, SessionRegistry};
pub use state::{Session, SessionSnapshot, SessionState, TerminalTrigger};
