//! TOML configuration file support (`--config FILE`).
//!
//! The file uses the same keys as the long command-line options:
//!
//! ```toml
//! source = "6080"
//! target = "127.0.0.1:5900"
//! web = "/usr/share/novnc"
//! cert = "/etc/wsproxy/self.pem"
//! record = "/var/log/wsproxy"
//! auth_token = "change-me"
//! ```
//!
//! Values from the file only fill in what the command line and environment
//! left unset.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::ConfigOverrides;

/// Error type for configuration file loading.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed, or contains an unknown key.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Reads and parses the config file at `path`.
///
/// Unlike a settings file the proxy writes itself, an explicitly named config
/// file must exist.
///
/// # Errors
///
/// Returns [`ConfigFileError::Io`] if the file cannot be read and
/// [`ConfigFileError::Parse`] if the TOML is malformed.
pub fn load_overrides(path: &Path) -> Result<ConfigOverrides, ConfigFileError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
