//! Domain layer for wsproxy.
//!
//! Pure types with no I/O: the immutable proxy configuration and the session
//! lifecycle state machine.  Nothing in here knows about sockets, files, or
//! the async runtime, so every rule can be unit tested directly.
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, or `WebSocket` types
//! - File I/O or environment variable reading
//! - Anything that could block or fail due to external state

pub mod config;
pub mod session;

pub use config::{
    parse_source, parse_target, ConfigError, ConfigOverrides, ProxyConfig, TargetAddr, TlsPaths,
};
pub use session::{transition, Effect, SessionEvent, SessionMachine, SessionState};
