//! TCP connection to the backend.
//!
//! Each WebSocket session gets its own TCP connection to the configured
//! target.  The proxy never looks inside the stream: whatever the backend
//! writes is relayed to the browser as-is, and vice versa.
//!
//! # Portability note
//!
//! This module uses only the `tokio::net::TcpStream` API, which works
//! identically on Windows, Linux, and macOS.

use anyhow::Context;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::domain::TargetAddr;

/// Size of the buffer used for each read from the backend.
///
/// Every successful read becomes one binary WebSocket message and one
/// recording entry.
pub const READ_BUF_SIZE: usize = 64 * 1024;

/// A connected backend, split so the session actor can read and write
/// independently.
pub struct TargetConnection {
    /// Read half of the backend TCP stream.
    pub read_half: OwnedReadHalf,
    /// Write half of the backend TCP stream.
    pub write_half: OwnedWriteHalf,
}

impl TargetConnection {
    /// Opens a new TCP connection to `target`.
    ///
    /// The host is resolved on every call, so a DNS change takes effect for
    /// the next session without a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if name resolution fails or the TCP connection cannot
    /// be established (backend down, wrong address, firewall).
    ///
    /// # Example
    ///
    /// ```no_run
    /// use wsproxy::domain::TargetAddr;
    /// use wsproxy::infrastructure::target_conn::TargetConnection;
    ///
    /// # async fn example() -> anyhow::Result<()> {
    /// let conn = TargetConnection::connect(&TargetAddr::new("127.0.0.1", 5900)).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(target: &TargetAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .with_context(|| format!("failed to connect to target {target}"))?;

        // Relayed chunks are often tiny (key presses, pointer events).
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY on target connection: {e}");
        }

        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            read_half,
            write_half,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
