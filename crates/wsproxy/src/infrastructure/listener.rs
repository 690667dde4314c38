//! Listener: accept loop, request dispatch and WebSocket upgrade.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured source address.
//! 2. Accepting connections and spawning one Tokio task per connection.
//! 3. Optionally terminating TLS on each connection.
//! 4. Reading the HTTP request head and routing it:
//!    - **Plain request** → static file collaborator, then close.
//!    - **Upgrade request** → authentication gate → `101 Switching
//!      Protocols` → session actor bound to the configured target.
//! 5. Stopping the accept loop when the `running` flag is cleared.
//!
//! An error in one connection is logged and never reaches the accept loop or
//! any other connection.

use std::io;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::http::{Method, Request, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::application::{AuthDecision, Authenticator, UpgradeRequest};
use crate::domain::ProxyConfig;
use crate::infrastructure::http::{
    is_upgrade_request, parse_request_head, read_request_head, switching_protocols_response,
    write_response, HandshakeError, HttpResponse, UNAUTHORIZED_RESPONSE,
};
use crate::infrastructure::session::{run_session, SessionContext};
use crate::infrastructure::{static_files, tls};

/// How often the accept loop wakes up to check the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound for the TLS handshake plus the request head.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by every connection task.
struct Shared {
    config: ProxyConfig,
    authenticator: Arc<dyn Authenticator>,
    tls: Option<TlsAcceptor>,
}

/// A bound listener, ready to serve.
pub struct ProxyServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl ProxyServer {
    /// Loads TLS material (if configured) and binds `config.bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate or key cannot be loaded, or the
    /// port cannot be bound (already in use, no permission).
    pub async fn bind(
        config: ProxyConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> anyhow::Result<Self> {
        // Bad TLS material is a startup error, not a per-connection one.
        let tls = match &config.tls {
            Some(paths) => Some(tls::load_acceptor(paths).with_context(|| {
                format!("failed to load TLS material from {}", paths.cert.display())
            })?),
            None => None,
        };

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind listener on {}", config.bind_addr))?;

        // One allocation shared by every connection task for the life of
        // the listener.
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                authenticator,
                tls,
            }),
        })
    }

    /// Address actually bound; differs from the configured one for port `0`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until `running` is set to `false`.
    ///
    /// Sessions already in progress are not interrupted.
    pub async fn serve(self, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        let local_addr = self.local_addr().context("listener has no local address")?;
        info!(
            "listening on {local_addr} ({})",
            if self.shared.tls.is_some() { "TLS" } else { "plain" }
        );

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            // Bounded wait so a cleared flag is noticed even with no traffic.
            match timeout(ACCEPT_POLL_INTERVAL, self.listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    debug!("new connection from {peer_addr}");
                    // Each connection runs in its own task, so a slow or
                    // failing peer never blocks the loop.
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(
                        handle_connection(stream, peer_addr, shared)
                            .instrument(info_span!("conn", peer = %peer_addr)),
                    );
                }
                Ok(Err(e)) => {
                    // Transient (e.g. out of file descriptors); keep accepting.
                    error!("accept error: {e}");
                }
                // Poll interval elapsed.
                Err(_) => {}
            }
        }

        Ok(())
    }
}

/// Binds the listener and serves until `running` is cleared.
///
/// # Errors
///
/// See [`ProxyServer::bind`].
pub async fn run_server(
    config: ProxyConfig,
    authenticator: Arc<dyn Authenticator>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    ProxyServer::bind(config, authenticator)
        .await?
        .serve(running)
        .await
}

// ── Per-connection handling ───────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, shared: Arc<Shared>) {
    match serve_connection(stream, peer_addr, &shared).await {
        Ok(()) => debug!("connection closed"),
        Err(e) => info!("connection closed with error: {e:#}"),
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: &Shared,
) -> anyhow::Result<()> {
    // Relayed chunks are often tiny protocol messages.
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not set TCP_NODELAY: {e}");
    }

    match &shared.tls {
        Some(acceptor) => {
            let tls_stream = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                .await
                .context("TLS handshake timed out")?
                .context("TLS handshake failed")?;
            serve_stream(tls_stream, peer_addr, shared).await
        }
        None => serve_stream(stream, peer_addr, shared).await,
    }
}

/// Reads one request from `stream` and routes it.
async fn serve_stream<S>(stream: S, peer_addr: SocketAddr, shared: &Shared) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    let head = match timeout(HANDSHAKE_TIMEOUT, read_request_head(&mut stream)).await {
        Ok(Ok(head)) => head,
        Ok(Err(HandshakeError::ConnectionClosed)) => {
            debug!("client left before sending a request");
            return Ok(());
        }
        Ok(Err(e)) => return bad_request(&mut stream, e).await,
        Err(_) => anyhow::bail!("timed out waiting for the request head"),
    };
    let request = match parse_request_head(&head) {
        Ok(request) => request,
        Err(e) => return bad_request(&mut stream, e).await,
    };

    // Anything that does not ask for a WebSocket is a static file request.
    if !is_upgrade_request(&request) {
        return serve_static(&mut stream, &request, shared).await;
    }

    // ── Authentication gate ───────────────────────────────────────────────────
    // Runs before the 101 is written and before the target is dialed.
    let upgrade = UpgradeRequest::new(peer_addr, request);
    if let AuthDecision::Reject { reason } = shared.authenticator.authenticate(&upgrade).await {
        info!("upgrade rejected: {reason}");
        stream.write_all(UNAUTHORIZED_RESPONSE).await?;
        stream.flush().await?;
        let _ = stream.shutdown().await;
        return Ok(());
    }
    let request = upgrade.into_request();

    // ── Handshake ─────────────────────────────────────────────────────────────
    let response = match switching_protocols_response(&request) {
        Ok(response) => response,
        Err(e) => return bad_request(&mut stream, e).await,
    };
    stream
        .write_all(response.as_bytes())
        .await
        .context("failed to send 101 Switching Protocols")?;
    stream.flush().await?;

    debug!("upgraded {} to WebSocket", request.uri());

    // Any bytes the client sent after the head are still in the BufReader.
    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    let ctx = SessionContext {
        session_id: Uuid::new_v4(),
        peer_addr,
        target: shared.config.target.clone(),
        record_dir: shared.config.record_dir.clone(),
    };
    run_session(ws, ctx).await;
    Ok(())
}

async fn serve_static<S>(
    stream: &mut S,
    request: &Request<()>,
    shared: &Shared,
) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = static_files::serve(
        shared.config.web_root.as_deref(),
        request.method(),
        request.uri().path(),
    )
    .await;
    info!(
        "{} {} {}",
        request.method(),
        request.uri().path(),
        response.status.as_u16()
    );

    // HEAD gets the same headers with no body.
    write_response(stream, &response, request.method() == Method::HEAD).await?;
    // One request per connection.
    let _ = stream.shutdown().await;
    Ok(())
}

async fn bad_request<S>(stream: &mut S, e: HandshakeError) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if e.warrants_bad_request() {
        let response = HttpResponse::text(StatusCode::BAD_REQUEST, "400 Bad Request");
        // Best effort; the error below is what gets logged.
        let _ = write_response(stream, &response, false).await;
        let _ = stream.shutdown().await;
    }
    Err(anyhow::Error::new(e).context("bad request"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
