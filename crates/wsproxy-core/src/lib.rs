//! # wsproxy-core
//!
//! Shared library for wsproxy containing the frame codec and the session
//! recording format.
//!
//! This crate has zero dependencies on sockets, files, or async runtimes.  The
//! bridge binary uses it to write session logs; replay and debugging tools use
//! it to read them back.
//!
//! # Architecture overview
//!
//! wsproxy relays raw bytes between a browser WebSocket and a TCP backend such
//! as a VNC server.  When recording is enabled, every relayed chunk is written
//! to a per-session log as one quoted string literal, so the log can be loaded
//! directly as a script by a replay player.
//!
//! - **`frame_codec`** – How a chunk of arbitrary bytes becomes a string that is
//!   safe inside a single-quoted literal, and how it is turned back into bytes.
//!
//! - **`recording`** – The line format of a session log: header, one entry per
//!   relayed chunk tagged with direction and elapsed time, and the `'EOF'`
//!   trailer.

pub mod frame_codec;
pub mod recording;

// Re-export the most-used items at the crate root so callers can write
// `wsproxy_core::encode` instead of `wsproxy_core::frame_codec::encode`.
pub use frame_codec::{decode, encode, encoded_len, CodecError};
pub use recording::{
    format_entry, parse_recording, Direction, Recording, RecordingEntry, RecordingError,
    RECORDING_HEADER, RECORDING_TRAILER,
};
