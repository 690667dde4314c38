//! Session recording format.
//!
//! A recording is a JavaScript array literal, one relayed chunk per line, so a
//! browser-side player can load it with a plain `<script>` tag:
//!
//! ```text
//! var VNC_frame_data = [
//! '{12{RFB\x20003\x2e008\x0a',        ← target → client, 12 ms after start
//! '}40}RFB\x20003\x2e008\x0a',        ← client → target, 40 ms after start
//! 'EOF'];
//! ```
//!
//! The direction marker (`{` or `}`) both opens the entry and separates the
//! elapsed milliseconds from the [`frame_codec`](crate::frame_codec) payload.

use thiserror::Error;

use crate::frame_codec::{self, CodecError};

/// First line of every recording.
pub const RECORDING_HEADER: &str = "var VNC_frame_data = [\n";

/// Sentinel entry that closes every finished recording.
pub const RECORDING_TRAILER: &str = "'EOF'];\n";

/// Which way a recorded chunk travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes read from the TCP backend and sent to the WebSocket client.
    TargetToClient,
    /// Bytes received from the WebSocket client and written to the backend.
    ClientToTarget,
}

impl Direction {
    /// The marker character that tags entries of this direction.
    pub fn marker(self) -> char {
        match self {
            Direction::TargetToClient => '{',
            Direction::ClientToTarget => '}',
        }
    }

    fn from_marker(marker: char) -> Option<Self> {
        match marker {
            '{' => Some(Direction::TargetToClient),
            '}' => Some(Direction::ClientToTarget),
            _ => None,
        }
    }
}

/// One decoded line of a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingEntry {
    pub direction: Direction,
    /// Milliseconds between session start and the moment the chunk was relayed.
    pub elapsed_ms: u64,
    /// The raw relayed bytes.
    pub payload: Vec<u8>,
}

/// A parsed recording file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recording {
    /// Entries in the order they were written.
    pub entries: Vec<RecordingEntry>,
    /// `false` when the `'EOF'` trailer is missing, e.g. the process was killed
    /// mid-session.
    pub finished: bool,
}

/// Errors that can occur while parsing a recording.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordingError {
    /// The file does not start with [`RECORDING_HEADER`].
    #[error("missing recording header")]
    MissingHeader,

    /// A line is not a well-formed entry.
    #[error("malformed entry on line {line}: {reason}")]
    MalformedEntry { line: usize, reason: String },

    /// An entry's payload is not valid codec output.
    #[error("undecodable payload on line {line}: {source}")]
    Payload {
        line: usize,
        #[source]
        source: CodecError,
    },

    /// Text follows the `'EOF'` trailer.
    #[error("unexpected content after EOF trailer on line {line}")]
    TrailingContent { line: usize },
}

/// Formats one recording line, including the trailing `,\n`.
///
/// # Examples
///
/// ```rust
/// use wsproxy_core::recording::{format_entry, Direction};
///
/// assert_eq!(
///     format_entry(Direction::TargetToClient, 7, b"ok_1\x07"),
///     "'{7{ok_1\\x07',\n"
/// );
/// ```
pub fn format_entry(direction: Direction, elapsed_ms: u64, payload: &[u8]) -> String {
    let marker = direction.marker();
    format!(
        "'{marker}{elapsed_ms}{marker}{}',\n",
        frame_codec::encode(payload)
    )
}

/// Parses a complete recording back into its entries.
///
/// A recording without the `'EOF'` trailer still parses; [`Recording::finished`]
/// reports whether the trailer was present.
///
/// # Errors
///
/// Returns [`RecordingError`] if the header is missing or a line is malformed.
pub fn parse_recording(text: &str) -> Result<Recording, RecordingError> {
    let body = text
        .strip_prefix(RECORDING_HEADER)
        .ok_or(RecordingError::MissingHeader)?;

    let mut recording = Recording::default();

    // Line 1 is the header.
    for (index, line) in body.lines().enumerate() {
        let line_no = index + 2;

        if recording.finished {
            if line.trim().is_empty() {
                continue;
            }
            return Err(RecordingError::TrailingContent { line: line_no });
        }

        if line == RECORDING_TRAILER.trim_end() {
            recording.finished = true;
            continue;
        }

        recording.entries.push(parse_entry(line, line_no)?);
    }

    Ok(recording)
}

fn parse_entry(line: &str, line_no: usize) -> Result<RecordingEntry, RecordingError> {
    let malformed = |reason: &str| RecordingError::MalformedEntry {
        line: line_no,
        reason: reason.to_string(),
    };

    let inner = line
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix("',"))
        .ok_or_else(|| malformed("entry must be a quoted string followed by a comma"))?;

    let mut chars = inner.chars();
    let marker = chars.next().ok_or_else(|| malformed("empty entry"))?;
    let direction =
        Direction::from_marker(marker).ok_or_else(|| malformed("unknown direction marker"))?;

    let rest = chars.as_str();
    let (elapsed, payload) = rest
        .split_once(marker)
        .ok_or_else(|| malformed("missing elapsed-time terminator"))?;
    let elapsed_ms = elapsed
        .parse::<u64>()
        .map_err(|_| malformed("elapsed time is not a non-negative integer"))?;

    let payload = frame_codec::decode(payload).map_err(|source| RecordingError::Payload {
        line: line_no,
        source,
    })?;

    Ok(RecordingEntry {
        direction,
        elapsed_ms,
        payload,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_entry_target_to_client_uses_open_brace() {
        assert_eq!(
            format_entry(Direction::TargetToClient, 0, b"RFB"),
            "'{0{RFB',\n"
        );
    }

    #[test]
    fn test_format_entry_client_to_target_uses_close_brace() {
        assert_eq!(
            format_entry(Direction::ClientToTarget, 1500, &[0xde, 0xad]),
            "'}1500}\\xde\\xad',\n"
        );
    }

    #[test]
    fn test_format_entry_empty_payload() {
        assert_eq!(format_entry(Direction::ClientToTarget, 3, &[]), "'}3}',\n");
    }

    #[test]
    fn test_parse_recording_reads_entries_in_order() {
        // Arrange
        let text = format!(
            "{RECORDING_HEADER}{}{}{RECORDING_TRAILER}",
            format_entry(Direction::TargetToClient, 4, b"ok_1\x07"),
            format_entry(Direction::ClientToTarget, 9, &[0x00, 0x01]),
        );

        // Act
        let recording = parse_recording(&text).unwrap();

        // Assert
        assert!(recording.finished);
        assert_eq!(
            recording.entries,
            vec![
                RecordingEntry {
                    direction: Direction::TargetToClient,
                    elapsed_ms: 4,
                    payload: b"ok_1\x07".to_vec(),
                },
                RecordingEntry {
                    direction: Direction::ClientToTarget,
                    elapsed_ms: 9,
                    payload: vec![0x00, 0x01],
                },
            ]
        );
    }

    #[test]
    fn test_parse_recording_without_trailer_is_unfinished() {
        let text = format!(
            "{RECORDING_HEADER}{}",
            format_entry(Direction::TargetToClient, 1, b"a")
        );
        let recording = parse_recording(&text).unwrap();
        assert!(!recording.finished);
        assert_eq!(recording.entries.len(), 1);
    }

    #[test]
    fn test_parse_recording_empty_session() {
        let text = format!("{RECORDING_HEADER}{RECORDING_TRAILER}");
        let recording = parse_recording(&text).unwrap();
        assert!(recording.finished);
        assert!(recording.entries.is_empty());
    }

    #[test]
    fn test_parse_recording_requires_header() {
        assert_eq!(
            parse_recording("'{0{a',\n"),
            Err(RecordingError::MissingHeader)
        );
    }

    #[test]
    fn test_parse_recording_rejects_unknown_marker() {
        let text = format!("{RECORDING_HEADER}'[0[a',\n");
        assert!(matches!(
            parse_recording(&text),
            Err(RecordingError::MalformedEntry { line: 2, .. })
        ));
    }

    #[test]
    fn test_parse_recording_rejects_bad_elapsed_time() {
        let text = format!("{RECORDING_HEADER}'{{x{{a',\n");
        assert!(matches!(
            parse_recording(&text),
            Err(RecordingError::MalformedEntry { line: 2, .. })
        ));
    }

    #[test]
    fn test_parse_recording_rejects_bad_payload() {
        let text = format!("{RECORDING_HEADER}'{{0{{a b',\n");
        assert!(matches!(
            parse_recording(&text),
            Err(RecordingError::Payload { line: 2, .. })
        ));
    }

    #[test]
    fn test_parse_recording_reads_legacy_literal_punctuation() {
        // Older writers left 0x3A..=0x40 unescaped.
        let text = "var VNC_frame_data = [\n'{5{RFB\\x20003\\x2e008:@',\n'EOF'];\n";

        let recording = parse_recording(text).unwrap();

        assert!(recording.finished);
        assert_eq!(
            recording.entries,
            vec![RecordingEntry {
                direction: Direction::TargetToClient,
                elapsed_ms: 5,
                payload: b"RFB 003.008:@".to_vec(),
            }]
        );
    }

    #[test]
    fn test_parse_recording_rejects_content_after_trailer() {
        let text = format!("{RECORDING_HEADER}{RECORDING_TRAILER}'{{0{{a',\n");
        assert_eq!(
            parse_recording(&text),
            Err(RecordingError::TrailingContent { line: 3 })
        );
    }
}
