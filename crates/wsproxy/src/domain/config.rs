//! Proxy configuration types.
//!
//! [`ProxyConfig`] is the single source of truth for all runtime settings.  It
//! is built once at startup from [`ConfigOverrides`] (CLI arguments,
//! environment variables and an optional TOML file, merged in that order of
//! precedence) and then shared read-only with every connection task.
//!
//! # Address syntax
//!
//! ```text
//! source   [host:]port     host defaults to 0.0.0.0; IP literal or `localhost`
//! target   host:port       host may be a DNS name; resolved on every dial
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while turning raw settings into a [`ProxyConfig`].
///
/// Every variant is fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing source address: expected [source_addr:]source_port")]
    MissingSource,

    #[error("missing target address: expected target_addr:target_port")]
    MissingTarget,

    #[error("target must be host:port, got '{0}'")]
    TargetWithoutPort(String),

    #[error("target host must not be empty in '{0}'")]
    EmptyTargetHost(String),

    #[error("illegal port in '{0}'")]
    IllegalPort(String),

    #[error("source host must be an IP address or 'localhost', got '{0}'")]
    InvalidSourceHost(String),

    #[error("--key given without --cert")]
    KeyWithoutCert,
}

/// Host and port of the TCP backend every session dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// PEM files that switch the listener to TLS (`wss://`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    /// Certificate chain.
    pub cert: PathBuf,
    /// Private key.  May be the same file as `cert` (combined PEM).
    pub key: PathBuf,
}

/// All runtime configuration for the proxy.
///
/// Build this struct once at startup and hand it to
/// [`ProxyServer::bind`](crate::infrastructure::listener::ProxyServer::bind),
/// which wraps it in an `Arc` for the connection tasks.
///
/// # Example
///
/// ```rust
/// use wsproxy::domain::ProxyConfig;
///
/// let cfg = ProxyConfig::default();
/// assert_eq!(cfg.target.port, 5900);
/// assert!(cfg.record_dir.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind_addr: SocketAddr,

    /// Backend dialed once per accepted session.
    pub target: TargetAddr,

    /// Root directory for plain HTTP requests.  `None` answers every plain
    /// request with 403.
    pub web_root: Option<PathBuf>,

    /// Certificate and key.  `None` means plaintext `ws://`.
    pub tls: Option<TlsPaths>,

    /// Directory that receives one recording per session.  `None` disables
    /// recording entirely.
    pub record_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    /// | Field        | Default          |
    /// |--------------|------------------|
    /// | bind_addr    | `0.0.0.0:6080`   |
    /// | target       | `127.0.0.1:5900` |
    /// | web_root     | none             |
    /// | tls          | none             |
    /// | record_dir   | none             |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 6080),
            target: TargetAddr::new("127.0.0.1", 5900),
            web_root: None,
            tls: None,
            record_dir: None,
        }
    }
}

// ── Raw settings ──────────────────────────────────────────────────────────────

/// Unvalidated settings from one configuration source.
///
/// The same shape is filled from the command line and deserialized from the
/// TOML config file, so both can be merged with [`ConfigOverrides::or`].
///
/// ```toml
/// source = "0.0.0.0:6080"
/// target = "vnc.internal:5900"
/// web = "/usr/share/novnc"
/// record = "/var/log/wsproxy"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub source: Option<String>,
    pub target: Option<String>,
    pub web: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub record: Option<PathBuf>,
    pub auth_token: Option<String>,
}

impl ConfigOverrides {
    /// Fills every field missing from `self` with the value from `fallback`.
    pub fn or(self, fallback: Self) -> Self {
        Self {
            source: self.source.or(fallback.source),
            target: self.target.or(fallback.target),
            web: self.web.or(fallback.web),
            cert: self.cert.or(fallback.cert),
            key: self.key.or(fallback.key),
            record: self.record.or(fallback.record),
            auth_token: self.auth_token.or(fallback.auth_token),
        }
    }

    /// Validates the merged settings.
    ///
    /// `auth_token` is not part of [`ProxyConfig`]; take it out before calling
    /// this if the caller needs it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a missing or malformed source/target, or a
    /// key without a certificate.
    pub fn into_config(self) -> Result<ProxyConfig, ConfigError> {
        let bind_addr = parse_source(self.source.as_deref().ok_or(ConfigError::MissingSource)?)?;
        let target = parse_target(self.target.as_deref().ok_or(ConfigError::MissingTarget)?)?;

        let tls = match (self.cert, self.key) {
            (Some(cert), key) => Some(TlsPaths {
                key: key.unwrap_or_else(|| cert.clone()),
                cert,
            }),
            (None, Some(_)) => return Err(ConfigError::KeyWithoutCert),
            (None, None) => None,
        };

        Ok(ProxyConfig {
            bind_addr,
            target,
            web_root: self.web,
            tls,
            record_dir: self.record,
        })
    }
}

// ── Address parsing ───────────────────────────────────────────────────────────

/// Parses `[host:]port` into the listener address.
///
/// # Errors
///
/// Returns [`ConfigError::IllegalPort`] if the port is not a `u16`, or
/// [`ConfigError::InvalidSourceHost`] if the host is neither an IP literal
/// nor `localhost`.
pub fn parse_source(arg: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = arg.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let (host, port) = match arg.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("", arg),
    };
    let port = parse_port(port, arg)?;

    let ip = match strip_brackets(host) {
        "" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        literal => literal
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidSourceHost(host.to_string()))?,
    };

    Ok(SocketAddr::new(ip, port))
}

/// Parses `host:port` into the backend address.
///
/// # Errors
///
/// Returns [`ConfigError`] if the colon, host, or a valid port is missing.
pub fn parse_target(arg: &str) -> Result<TargetAddr, ConfigError> {
    let (host, port) = arg
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::TargetWithoutPort(arg.to_string()))?;

    let host = strip_brackets(host);
    if host.is_empty() {
        return Err(ConfigError::EmptyTargetHost(arg.to_string()));
    }

    let port = parse_port(port, arg)?;
    if port == 0 {
        return Err(ConfigError::IllegalPort(arg.to_string()));
    }

    Ok(TargetAddr::new(host, port))
}

fn parse_port(port: &str, arg: &str) -> Result<u16, ConfigError> {
    port.trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::IllegalPort(arg.to_string()))
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
