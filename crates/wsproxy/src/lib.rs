//! wsproxy library crate.
//!
//! A WebSocket-to-TCP bridge: each browser WebSocket session gets its own TCP
//! connection to a fixed backend (typically a VNC server), bytes are relayed
//! both ways unchanged, and every session can be recorded to a replayable
//! log file.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Browser (binary/text over WebSocket)
//!         ↕
//! [wsproxy]
//!   ├── domain/           ProxyConfig, session state machine
//!   ├── application/      Authentication gate
//!   └── infrastructure/
//!         ├── listener    Accept loop, TLS, upgrade dispatch
//!         ├── session     Per-session relay actor
//!         ├── recorder    Recording files (format from wsproxy-core)
//!         └── ...         HTTP head parsing, static files, target dialing
//!         ↕
//! Backend TCP service
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` only.
//! - `infrastructure` depends on all other layers plus `tokio`,
//!   `tokio-tungstenite` and `tokio-rustls`.

/// Domain layer: configuration and session lifecycle (no I/O).
pub mod domain;

/// Application layer: the pre-upgrade authentication gate.
pub mod application;

/// Infrastructure layer: sockets, files, TLS.
pub mod infrastructure;
