//! Pre-upgrade authentication gate.
//!
//! Every HTTP Upgrade request is handed to an [`Authenticator`] exactly once,
//! before the WebSocket handshake is answered and before any backend
//! connection is dialed.  Plain HTTP requests (static files) never reach it.
//!
//! ```text
//! Upgrade request ──▶ Authenticator::authenticate ──▶ Accept  ──▶ 101, new session
//!                                                 └─▶ Reject  ──▶ 401, socket closed
//! ```
//!
//! The proxy ships two policies:
//!
//! - [`AllowAll`] – the default; accepts everything.
//! - [`TokenAuthenticator`] – requires `?token=<secret>` in the request URI.
//!
//! Deployers with other needs (cookies, an external auth service) implement
//! the trait themselves and pass it to
//! [`ProxyServer::bind`](crate::infrastructure::listener::ProxyServer::bind).

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_tungstenite::tungstenite::http::{HeaderMap, Request, Uri};

/// The upgrade request as seen by the gate.
#[derive(Debug)]
pub struct UpgradeRequest {
    peer_addr: SocketAddr,
    request: Request<()>,
}

impl UpgradeRequest {
    pub fn new(peer_addr: SocketAddr, request: Request<()>) -> Self {
        Self { peer_addr, request }
    }

    /// Remote address of the client socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    /// Returns the raw (not percent-decoded) value of query parameter `name`.
    ///
    /// A parameter given without `=` yields `Some("")`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.uri().query()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }

    pub fn into_request(self) -> Request<()> {
        self.request
    }
}

/// Outcome of the gate for one upgrade attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    /// `reason` is logged; the client only ever sees a bare 401.
    Reject { reason: String },
}

impl AuthDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        AuthDecision::Reject {
            reason: reason.into(),
        }
    }
}

/// Pluggable authentication policy.
///
/// Implementations must be cheap to share: one instance serves every
/// connection through an `Arc<dyn Authenticator>`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Decides whether `request` may be upgraded to a session.
    async fn authenticate(&self, request: &UpgradeRequest) -> AuthDecision;
}

/// Accepts every upgrade request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _request: &UpgradeRequest) -> AuthDecision {
        AuthDecision::Accept
    }
}

/// Accepts only requests whose URI carries `token=<expected>`.
///
/// noVNC-style clients pass it as `ws://host:port/websockify?token=...`.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    expected: String,
}

impl TokenAuthenticator {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, request: &UpgradeRequest) -> AuthDecision {
        match request.query_param("token") {
            None => AuthDecision::reject("missing token"),
            Some(presented) if tokens_match(presented.as_bytes(), self.expected.as_bytes()) => {
                AuthDecision::Accept
            }
            Some(_) => AuthDecision::reject("invalid token"),
        }
    }
}

/// Compares in time independent of where the first mismatch is.
fn tokens_match(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

// ── Tests ─────────────────────────────────────────────────────────────────────
