//! Per-session recording file.
//!
//! A [`Recorder`] owns one file for the whole life of one session.  It writes
//! the [`RECORDING_HEADER`] on creation, one line per relayed chunk via
//! [`Recorder::append`], and the `'EOF'` trailer on [`Recorder::finish`].
//!
//! The file is named after the session start time, e.g.
//! `2024-05-01T12_30_45.123Z` (colons are not allowed in file names on every
//! platform).  If two sessions start in the same millisecond the later one
//! gets a `-1`, `-2`, ... suffix instead of overwriting the first.
//!
//! Any [`Write`] can back a recorder through [`Recorder::from_writer`]; the
//! file-backed one from [`Recorder::create`] is the default type.
//!
//! Writes are buffered and synchronous: entries are small, and keeping the
//! file handle outside the async runtime lets `Drop` finalize the file on
//! every exit path, including task cancellation.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::warn;

use wsproxy_core::recording::{format_entry, Direction, RECORDING_HEADER, RECORDING_TRAILER};

/// Give up looking for a free file name after this many collisions.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Errors from the recording file.
///
/// None of these are fatal to the session; the caller logs them and keeps
/// relaying.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to create recording in {dir}: {source}")]
    Create {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write recording {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An open recording for one session.
pub struct Recorder<W: Write = BufWriter<File>> {
    path: PathBuf,
    /// `None` once the trailer has been written.
    writer: Option<W>,
}

impl Recorder {
    /// Creates a new recording in `dir` for a session that started at
    /// `started_at` and writes the header.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::Create`] if the directory is missing or not
    /// writable.
    pub fn create(dir: &Path, started_at: DateTime<Utc>) -> Result<Self, RecorderError> {
        let base = file_name_for(started_at);
        let create_err = |source| RecorderError::Create {
            dir: dir.to_path_buf(),
            source,
        };

        let mut attempt = 0;
        let (path, file) = loop {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{base}-{attempt}")
            };
            let path = dir.join(name);

            // `create_new` fails instead of truncating an existing recording.
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(e)
                    if e.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS =>
                {
                    attempt += 1;
                }
                Err(e) => return Err(create_err(e)),
            }
        };

        Self::from_writer(path, BufWriter::new(file))
    }
}

impl<W: Write> Recorder<W> {
    /// Starts a recording on an already open `writer` and writes the header.
    /// `path` names the recording in errors and in [`path`](Self::path).
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::Write`] if the header cannot be written.
    pub fn from_writer(path: PathBuf, writer: W) -> Result<Self, RecorderError> {
        let mut recorder = Self {
            path,
            writer: Some(writer),
        };
        recorder.write(RECORDING_HEADER.as_bytes())?;
        Ok(recorder)
    }

    /// Appends one relayed chunk.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::Write`] if the write fails.  Appending after
    /// [`finish`](Self::finish) is silently ignored.
    pub fn append(
        &mut self,
        direction: Direction,
        elapsed_ms: u64,
        bytes: &[u8],
    ) -> Result<(), RecorderError> {
        if self.writer.is_none() {
            return Ok(());
        }
        let line = format_entry(direction, elapsed_ms, bytes);
        self.write(line.as_bytes())
    }

    /// Writes the trailer, flushes, and closes the file.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::Write`] if the trailer cannot be written or
    /// flushed.  The file handle is released either way.
    pub fn finish(&mut self) -> Result<(), RecorderError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer
            .write_all(RECORDING_TRAILER.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|source| RecorderError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Location of the recording file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.writer.is_none()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), RecorderError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(bytes).map_err(|source| RecorderError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

impl<W: Write> Drop for Recorder<W> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("{e}");
        }
    }
}

/// Recording file name for a session that started at `started_at`.
pub fn file_name_for(started_at: DateTime<Utc>) -> String {
    started_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "_")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
