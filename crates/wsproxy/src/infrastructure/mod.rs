//! Infrastructure layer for wsproxy.
//!
//! Everything that touches the outside world lives here.
//!
//! # Responsibilities
//!
//! - Binding the listener, accepting connections, optional TLS
//! - Reading HTTP request heads and answering the WebSocket upgrade
//! - Serving static files for plain HTTP requests
//! - Dialing the backend TCP target for each session
//! - Running the per-session relay actor
//! - Writing session recordings to disk
//! - Loading the TOML config file
//!
//! # What does NOT belong here?
//!
//! - Session lifecycle rules (that is `domain::session`)
//! - The accept/reject policy for upgrades (that is the application layer)
//! - The recording line format and escaping (that is `wsproxy-core`)

pub mod config_file;
pub mod http;
pub mod listener;
pub mod recorder;
pub mod session;
pub mod static_files;
pub mod target_conn;
pub mod tls;

pub use listener::{run_server, ProxyServer};
