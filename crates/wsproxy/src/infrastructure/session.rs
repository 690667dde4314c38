//! Session actor: owns one WebSocket client, one backend TCP connection and an
//! optional recorder, and relays bytes between them.
//!
//! The actor is a single task.  It waits on both endpoints with
//! `tokio::select!`, turns whatever arrives into a [`SessionEvent`], and lets
//! [`SessionMachine`] decide which [`Effect`]s to perform.  Because one task
//! processes every event in arrival order, a recorded entry is always written
//! before its chunk is forwarded, and no endpoint is touched after it has been
//! released.
//!
//! ```text
//!             ┌────────────────────── session task ───────────────────────┐
//! WebSocket ──┤ ws.next()       ─▶ ClientData ─▶ Record(}) ─▶ WriteToTarget ├──▶ backend
//!   client  ◀─┤ SendToClient ◀─ Record({) ◀─ TargetData ◀─ read_half.read() ├─── TCP
//!             └───────────────────────────────────────────────────────────┘
//! ```

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::domain::{Effect, SessionEvent, SessionMachine, SessionState, TargetAddr};
use crate::infrastructure::recorder::Recorder;
use crate::infrastructure::target_conn::{TargetConnection, READ_BUF_SIZE};

/// Everything a session needs to know before it starts.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub peer_addr: SocketAddr,
    pub target: TargetAddr,
    /// Directory for the session recording; `None` disables recording.
    pub record_dir: Option<PathBuf>,
}

/// What happened during a session, returned once it has terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub final_state: SessionState,
    /// Bytes read from the backend and delivered to the client.
    pub bytes_to_client: u64,
    /// Bytes received from the client and written to the backend.
    pub bytes_to_target: u64,
    /// Entries appended to the recording.
    pub recorded_entries: usize,
    /// Recording file, if one was created.
    pub recording: Option<PathBuf>,
}

/// Runs one session to completion.
///
/// `ws` must already have completed the opening handshake.  The backend is
/// dialed here; if that fails the client is closed and the session
/// terminates without ever becoming active.
///
/// Never returns an error: every failure is an ordinary way for a session to
/// end and is logged inside the `session` span.
pub async fn run_session<S>(ws: WebSocketStream<S>, ctx: SessionContext) -> SessionSummary
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let span = info_span!("session", session_id = %ctx.session_id, peer = %ctx.peer_addr);
    drive_session(ws, ctx).instrument(span).await
}

async fn drive_session<S>(ws: WebSocketStream<S>, ctx: SessionContext) -> SessionSummary
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // A recording that cannot be created only costs the recording.
    let recorder = ctx.record_dir.as_deref().and_then(|dir| {
        match Recorder::create(dir, Utc::now()) {
            Ok(recorder) => {
                info!("recording session to {}", recorder.path().display());
                Some(recorder)
            }
            Err(e) => {
                warn!("{e}; continuing without recording");
                None
            }
        }
    });
    relay_session(ws, &ctx.target, recorder).await
}

/// Dials `target` and relays until the session terminates, recording into
/// `recorder` while it keeps accepting writes.
async fn relay_session<S, W>(
    ws: WebSocketStream<S>,
    target: &TargetAddr,
    recorder: Option<Recorder<W>>,
) -> SessionSummary
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: Write,
{
    let started = Instant::now();
    let recording = recorder.as_ref().map(|r| r.path().to_path_buf());

    let mut actor = SessionActor {
        machine: SessionMachine::new(),
        ws,
        target_write: None,
        recorder,
        started,
        client_closed: false,
        target_shut: false,
        bytes_to_client: 0,
        bytes_to_target: 0,
        recorded_entries: 0,
    };

    match TargetConnection::connect(target).await {
        Ok(conn) => {
            info!("connected to target {target}");
            // The write half lives in the actor; the read half is polled by
            // the relay loop alongside the WebSocket.
            actor.target_write = Some(conn.write_half);
            actor.dispatch(SessionEvent::TargetConnected, None).await;
            actor.relay(conn.read_half).await;
        }
        Err(e) => {
            warn!("{e:#}");
            actor.dispatch(SessionEvent::TargetConnectFailed, None).await;
        }
    }

    let summary = SessionSummary {
        final_state: actor.machine.state(),
        bytes_to_client: actor.bytes_to_client,
        bytes_to_target: actor.bytes_to_target,
        recorded_entries: actor.recorded_entries,
        recording,
    };
    info!(
        "session ended after {} ms: {} bytes to client, {} bytes to target",
        started.elapsed().as_millis(),
        summary.bytes_to_client,
        summary.bytes_to_target
    );
    summary
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct SessionActor<S, W: Write> {
    machine: SessionMachine,
    ws: WebSocketStream<S>,
    target_write: Option<OwnedWriteHalf>,
    /// Dropped on the first failed write; relaying carries on without it.
    recorder: Option<Recorder<W>>,
    started: Instant,
    client_closed: bool,
    target_shut: bool,
    bytes_to_client: u64,
    bytes_to_target: u64,
    recorded_entries: usize,
}

impl<S, W> SessionActor<S, W>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: Write,
{
    /// Relays until either side ends, then releases both endpoints.
    async fn relay<R>(&mut self, mut target_read: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        while !self.machine.is_finished() {
            // Whichever endpoint is ready first produces the next event; the
            // other future is dropped and polled again on the next turn.
            let (event, chunk) = tokio::select! {
                read = target_read.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("target closed the connection");
                        (SessionEvent::TargetClosed, None)
                    }
                    Ok(n) => (SessionEvent::TargetData, Some(buf[..n].to_vec())),
                    Err(e) => {
                        warn!("target read error: {e}");
                        (SessionEvent::TargetFailed, None)
                    }
                },
                msg = self.ws.next() => match msg {
                    Some(Ok(WsMessage::Binary(bytes))) => (SessionEvent::ClientData, Some(bytes)),
                    Some(Ok(WsMessage::Text(text))) => {
                        (SessionEvent::ClientData, Some(text.into_bytes()))
                    }
                    // Control frames are answered by tungstenite itself.
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                        continue;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!("client sent close: {frame:?}");
                        (SessionEvent::ClientClosed, None)
                    }
                    Some(Err(
                        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Protocol(_),
                    )) => {
                        debug!("client connection closed");
                        (SessionEvent::ClientClosed, None)
                    }
                    Some(Err(e)) => {
                        warn!("client WebSocket error: {e}");
                        (SessionEvent::ClientFailed, None)
                    }
                    None => {
                        debug!("client stream ended");
                        (SessionEvent::ClientClosed, None)
                    }
                },
            };

            self.dispatch(event, chunk).await;
        }

        // Closing: both endpoints go, whichever side ended first.
        self.close_client().await;
        self.shutdown_target().await;
        drop(target_read);
        self.dispatch(SessionEvent::EndpointsReleased, None).await;
    }

    /// Feeds `event` to the state machine and performs the resulting effects
    /// in order.  A failed send or write becomes the next event.
    async fn dispatch(&mut self, event: SessionEvent, mut chunk: Option<Vec<u8>>) {
        let mut next = Some(event);
        // A follow-up event replaces the rest of the current effect list.
        while let Some(event) = next.take() {
            for effect in self.machine.handle(event) {
                if let Some(follow_up) = self.perform(*effect, &mut chunk).await {
                    next = Some(follow_up);
                    break;
                }
            }
        }
    }

    async fn perform(
        &mut self,
        effect: Effect,
        chunk: &mut Option<Vec<u8>>,
    ) -> Option<SessionEvent> {
        match effect {
            Effect::Record(direction) => {
                let (Some(recorder), Some(bytes)) = (self.recorder.as_mut(), chunk.as_deref())
                else {
                    return None;
                };
                let elapsed_ms =
                    u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
                match recorder.append(direction, elapsed_ms, bytes) {
                    Ok(()) => self.recorded_entries += 1,
                    Err(e) => {
                        warn!("{e}; recording stopped");
                        self.recorder = None;
                    }
                }
                None
            }
            Effect::SendToClient => {
                // Last use of the chunk on this path, so it can be moved.
                let bytes = chunk.take()?;
                let len = bytes.len() as u64;
                match self.ws.send(WsMessage::Binary(bytes)).await {
                    Ok(()) => {
                        self.bytes_to_client += len;
                        None
                    }
                    Err(e) => {
                        debug!("send to client failed: {e}");
                        Some(SessionEvent::ClientSendFailed)
                    }
                }
            }
            Effect::WriteToTarget => {
                let (Some(write_half), Some(bytes)) =
                    (self.target_write.as_mut(), chunk.as_deref())
                else {
                    return None;
                };
                match write_half.write_all(bytes).await {
                    Ok(()) => {
                        self.bytes_to_target += bytes.len() as u64;
                        None
                    }
                    Err(e) => {
                        warn!("target write error: {e}");
                        Some(SessionEvent::TargetWriteFailed)
                    }
                }
            }
            Effect::CloseClient => {
                self.close_client().await;
                None
            }
            Effect::ShutdownTarget => {
                self.shutdown_target().await;
                None
            }
            Effect::FinalizeRecording => {
                if let Some(mut recorder) = self.recorder.take() {
                    match recorder.finish() {
                        Ok(()) => debug!("recording finished: {}", recorder.path().display()),
                        Err(e) => warn!("{e}"),
                    }
                }
                None
            }
        }
    }

    async fn close_client(&mut self) {
        if self.client_closed {
            return;
        }
        self.client_closed = true;
        // Fails if the peer already went away; nothing left to do then.
        if let Err(e) = self.ws.close(None).await {
            debug!("client close: {e}");
        }
    }

    async fn shutdown_target(&mut self) {
        if self.target_shut {
            return;
        }
        self.target_shut = true;
        // Half-close: the backend reads EOF.
        if let Some(mut write_half) = self.target_write.take() {
            if let Err(e) = write_half.shutdown().await {
                debug!("target shutdown: {e}");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use wsproxy_core::parse_recording;

    const WAIT: Duration = Duration::from_secs(5);

    /// A handshaken WebSocket pair over an in-memory pipe.
    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    async fn backend() -> (TcpListener, TargetAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, TargetAddr::new("127.0.0.1", port))
    }

    fn context(target: TargetAddr, record_dir: Option<PathBuf>) -> SessionContext {
        SessionContext {
            session_id: Uuid::new_v4(),
            peer_addr: "127.0.0.1:40000".parse().unwrap(),
            target,
            record_dir,
        }
    }

    async fn next_binary(client: &mut WebSocketStream<DuplexStream>) -> Vec<u8> {
        loop {
            match timeout(WAIT, client.next()).await.unwrap() {
                Some(Ok(WsMessage::Binary(bytes))) => return bytes,
                Some(Ok(_)) => continue,
                other => panic!("expected a binary message, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_relays_both_directions_and_records() {
        // Arrange
        let (server_ws, mut client) = ws_pair().await;
        let (listener, target) = backend().await;
        let dir = tempfile::tempdir().unwrap();
        let session = tokio::spawn(run_session(
            server_ws,
            context(target, Some(dir.path().to_path_buf())),
        ));
        let (mut backend_conn, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        // Act: client -> backend
        client.send(WsMessage::Binary(vec![0xde, 0xad])).await.unwrap();
        let mut received = [0u8; 2];
        timeout(WAIT, backend_conn.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();

        // Act: backend -> client
        backend_conn.write_all(b"ok_1\x07").await.unwrap();
        let relayed = next_binary(&mut client).await;

        // Act: backend hangs up
        drop(backend_conn);
        let summary = timeout(WAIT, session).await.unwrap().unwrap();

        // Assert
        assert_eq!(received, [0xde, 0xad]);
        assert_eq!(relayed, b"ok_1\x07");
        assert_eq!(summary.final_state, SessionState::Terminated);
        assert_eq!(summary.bytes_to_target, 2);
        assert_eq!(summary.bytes_to_client, 5);
        assert_eq!(summary.recorded_entries, 2);

        let text = std::fs::read_to_string(summary.recording.unwrap()).unwrap();
        let recording = parse_recording(&text).unwrap();
        assert!(recording.finished);
        assert_eq!(recording.entries.len(), 2);
        assert_eq!(recording.entries[0].payload, vec![0xde, 0xad]);
        assert_eq!(recording.entries[1].payload, b"ok_1\x07".to_vec());
        assert!(text.contains("\\xde\\xad"));
        assert!(text.contains("ok_1\\x07"));
    }

    #[tokio::test]
    async fn test_text_message_is_forwarded_as_bytes() {
        let (server_ws, mut client) = ws_pair().await;
        let (listener, target) = backend().await;
        let session = tokio::spawn(run_session(server_ws, context(target, None)));
        let (mut backend_conn, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        client.send(WsMessage::Text("hello".to_string())).await.unwrap();
        let mut received = [0u8; 5];
        timeout(WAIT, backend_conn.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(&received, b"hello");
        drop(client);
        let summary = timeout(WAIT, session).await.unwrap().unwrap();
        assert_eq!(summary.final_state, SessionState::Terminated);
        assert_eq!(summary.recording, None);
    }

    #[tokio::test]
    async fn test_client_close_shuts_down_target() {
        // Arrange
        let (server_ws, mut client) = ws_pair().await;
        let (listener, target) = backend().await;
        let session = tokio::spawn(run_session(server_ws, context(target, None)));
        let (mut backend_conn, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        // Act
        client.close(None).await.unwrap();

        // Assert: the backend sees EOF.
        let mut buf = [0u8; 16];
        let n = timeout(WAIT, backend_conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        let summary = timeout(WAIT, session).await.unwrap().unwrap();
        assert_eq!(summary.final_state, SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_unreachable_target_closes_client_and_finishes_recording() {
        // Arrange: a port with nothing listening.
        let target = {
            let (listener, target) = backend().await;
            drop(listener);
            target
        };
        let (server_ws, mut client) = ws_pair().await;
        let dir = tempfile::tempdir().unwrap();

        // Act
        let summary = timeout(
            WAIT,
            run_session(server_ws, context(target, Some(dir.path().to_path_buf()))),
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(summary.final_state, SessionState::Terminated);
        assert_eq!(summary.bytes_to_target, 0);
        let text = std::fs::read_to_string(summary.recording.unwrap()).unwrap();
        assert_eq!(text, "var VNC_frame_data = [\n'EOF'];\n");
        match timeout(WAIT, client.next()).await.unwrap() {
            Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => {}
            other => panic!("expected the client to be closed, got {other:?}"),
        }
    }

    /// Accepts `ok_writes` writes, then fails every write after that.
    struct FailingWriter {
        ok_writes: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.ok_writes == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            self.ok_writes -= 1;
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_recording_write_failure_stops_recording_but_not_relay() {
        // Arrange: the header and one entry succeed, the second entry fails.
        let (server_ws, mut client) = ws_pair().await;
        let (listener, target) = backend().await;
        let recorder =
            Recorder::from_writer(PathBuf::from("failing"), FailingWriter { ok_writes: 2 })
                .unwrap();
        let session = tokio::spawn(async move {
            relay_session(server_ws, &target, Some(recorder)).await
        });
        let (mut backend_conn, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        // Act: recorded
        backend_conn.write_all(b"RFB").await.unwrap();
        let first = next_binary(&mut client).await;

        // Act: the recording write fails here
        client.send(WsMessage::Binary(vec![0x01])).await.unwrap();
        let mut received = [0u8; 1];
        timeout(WAIT, backend_conn.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();

        // Act: relayed without a recorder
        backend_conn.write_all(b"ok").await.unwrap();
        let second = next_binary(&mut client).await;
        drop(backend_conn);
        let summary = timeout(WAIT, session).await.unwrap().unwrap();

        // Assert
        assert_eq!(first, b"RFB");
        assert_eq!(received, [0x01]);
        assert_eq!(second, b"ok");
        assert_eq!(summary.final_state, SessionState::Terminated);
        assert_eq!(summary.bytes_to_client, 5);
        assert_eq!(summary.bytes_to_target, 1);
        assert_eq!(summary.recorded_entries, 1);
        assert_eq!(summary.recording, Some(PathBuf::from("failing")));
    }

    #[tokio::test]
    async fn test_missing_record_dir_does_not_stop_relay() {
        let (server_ws, mut client) = ws_pair().await;
        let (listener, target) = backend().await;
        let missing = tempfile::tempdir().unwrap().path().join("gone");
        let session = tokio::spawn(run_session(server_ws, context(target, Some(missing))));
        let (mut backend_conn, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        backend_conn.write_all(b"RFB 003.008\n").await.unwrap();
        let relayed = next_binary(&mut client).await;

        assert_eq!(relayed, b"RFB 003.008\n");
        drop(backend_conn);
        let summary = timeout(WAIT, session).await.unwrap().unwrap();
        assert_eq!(summary.recording, None);
        assert_eq!(summary.recorded_entries, 0);
    }
}
