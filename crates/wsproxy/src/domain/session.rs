//! Session lifecycle state machine.
//!
//! Every bridged session moves through four states:
//!
//! ```text
//!              TargetConnected            close / error on either side
//! Connecting ──────────────────▶ Active ──────────────────────────────▶ Closing
//!     │                           │  ▲                                     │
//!     │ TargetConnectFailed       └──┘ TargetData / ClientData             │ EndpointsReleased
//!     ▼                                                                    ▼
//! Terminated ◀─────────────────────────────────────────────────────── Terminated
//! ```
//!
//! [`transition`] is a pure function: it returns the next state plus the list
//! of [`Effect`]s the session actor must perform, in order.  The actor in
//! [`crate::infrastructure::session`] owns the sockets and carries the effects
//! out; this module never touches I/O.
//!
//! Events that arrive in a state that does not expect them (a second close
//! after the first, data after close) produce no effects.  That is what makes
//! concurrent close on both sides safe: whichever event is observed first wins
//! and the other is absorbed.

use wsproxy_core::Direction;

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Backend TCP dial in flight.
    Connecting,
    /// Both endpoints open; data is relayed.
    Active,
    /// One side closed; the other is being released.
    Closing,
    /// Both endpoints released.
    Terminated,
}

/// Something the session actor observed on one of its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    TargetConnected,
    TargetConnectFailed,
    /// Bytes were read from the backend.
    TargetData,
    /// A data message arrived from the WebSocket client.
    ClientData,
    /// The backend sent EOF.
    TargetClosed,
    /// Reading from the backend failed.
    TargetFailed,
    /// Writing client data to the backend failed.
    TargetWriteFailed,
    /// The client sent a close frame or the stream ended.
    ClientClosed,
    /// The WebSocket stream reported an error.
    ClientFailed,
    /// Forwarding backend data to the client failed.
    ClientSendFailed,
    /// The actor finished closing both endpoints.
    EndpointsReleased,
}

/// Work the session actor must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Append the current chunk to the recording, if one is attached.
    Record(Direction),
    /// Send the current chunk to the client as a binary message.
    SendToClient,
    /// Write the current chunk to the backend.
    WriteToTarget,
    /// Close the WebSocket endpoint (no-op if already closed).
    CloseClient,
    /// Shut down the backend TCP endpoint (no-op if already closed).
    ShutdownTarget,
    /// Write the recording trailer and release the file.
    FinalizeRecording,
}

const NONE: &[Effect] = &[];
const RELAY_TO_CLIENT: &[Effect] = &[
    Effect::Record(Direction::TargetToClient),
    Effect::SendToClient,
];
const RELAY_TO_TARGET: &[Effect] = &[
    Effect::Record(Direction::ClientToTarget),
    Effect::WriteToTarget,
];
const TARGET_GONE: &[Effect] = &[Effect::CloseClient, Effect::FinalizeRecording];
const CLIENT_GONE: &[Effect] = &[Effect::ShutdownTarget, Effect::FinalizeRecording];

/// Computes the next state and the effects to perform for `event`.
pub fn transition(state: SessionState, event: SessionEvent) -> (SessionState, &'static [Effect]) {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Connecting, E::TargetConnected) => (S::Active, NONE),
        (S::Connecting, E::TargetConnectFailed) => (S::Terminated, TARGET_GONE),

        (S::Active, E::TargetData) => (S::Active, RELAY_TO_CLIENT),
        (S::Active, E::ClientData) => (S::Active, RELAY_TO_TARGET),

        (S::Active, E::TargetClosed | E::TargetFailed | E::TargetWriteFailed) => {
            (S::Closing, TARGET_GONE)
        }
        (S::Active, E::ClientClosed | E::ClientFailed | E::ClientSendFailed) => {
            (S::Closing, CLIENT_GONE)
        }

        (S::Closing, E::EndpointsReleased) => (S::Terminated, NONE),

        (state, _) => (state, NONE),
    }
}

/// Holds the current [`SessionState`] and applies [`transition`] to it.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
}

impl SessionMachine {
    /// A machine in [`SessionState::Connecting`].
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns `true` once the session can never relay data again.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Terminated)
    }

    /// Applies `event` and returns the effects to perform.
    pub fn handle(&mut self, event: SessionEvent) -> &'static [Effect] {
        let (next, effects) = transition(self.state, event);
        self.state = next;
        effects
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
