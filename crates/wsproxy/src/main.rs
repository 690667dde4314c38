//! wsproxy: WebSocket-to-TCP bridge, entry point.
//!
//! Browsers cannot open raw TCP sockets.  This binary accepts WebSocket
//! connections and relays each one to a fixed TCP backend, so a web client
//! such as noVNC can talk to a plain VNC server.
//!
//! # Usage
//!
//! ```text
//! wsproxy [OPTIONS] [SOURCE_HOST:]SOURCE_PORT TARGET_HOST:TARGET_PORT
//!
//! Options:
//!   --web <DIR>           Serve static files from DIR
//!   --cert <FILE>         TLS certificate (PEM); enables wss:// and https://
//!   --key <FILE>          TLS private key (PEM) [default: same as --cert]
//!   --record <DIR>        Write one recording file per session to DIR
//!   --auth-token <TOKEN>  Require ?token=TOKEN on every WebSocket upgrade
//!   --config <FILE>       Read defaults from a TOML file
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable             | Same as          |
//! |----------------------|------------------|
//! | `WSPROXY_SOURCE`     | first positional |
//! | `WSPROXY_TARGET`     | second positional|
//! | `WSPROXY_WEB`        | `--web`          |
//! | `WSPROXY_CERT`       | `--cert`         |
//! | `WSPROXY_KEY`        | `--key`          |
//! | `WSPROXY_RECORD`     | `--record`       |
//! | `WSPROXY_AUTH_TOKEN` | `--auth-token`   |
//! | `WSPROXY_CONFIG`     | `--config`       |
//!
//! Command-line arguments beat environment variables, which beat the config
//! file.
//!
//! # Exit status
//!
//! - `2`: invalid arguments (nothing was started)
//! - `1`: the listener could not be bound or the TLS files could not be loaded

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use wsproxy::application::{AllowAll, Authenticator, TokenAuthenticator};
use wsproxy::domain::{ConfigOverrides, ProxyConfig};
use wsproxy::infrastructure::config_file::load_overrides;
use wsproxy::infrastructure::run_server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// WebSocket-to-TCP bridge.
///
/// Accepts WebSocket connections and relays each one to a TCP backend,
/// optionally serving static files and recording every session.
#[derive(Debug, Parser)]
#[command(name = "wsproxy", about = "WebSocket-to-TCP bridge", version)]
struct Cli {
    /// Listen address.  A bare port listens on all interfaces.
    #[arg(value_name = "[SOURCE_HOST:]SOURCE_PORT", env = "WSPROXY_SOURCE")]
    source: Option<String>,

    /// Backend every session is relayed to.
    #[arg(value_name = "TARGET_HOST:TARGET_PORT", env = "WSPROXY_TARGET")]
    target: Option<String>,

    /// Directory to serve static files from for plain HTTP requests.
    #[arg(long, value_name = "DIR", env = "WSPROXY_WEB")]
    web: Option<PathBuf>,

    /// PEM certificate chain; enables TLS on the listener.
    #[arg(long, value_name = "FILE", env = "WSPROXY_CERT")]
    cert: Option<PathBuf>,

    /// PEM private key.  Defaults to the --cert file.
    #[arg(long, value_name = "FILE", env = "WSPROXY_KEY")]
    key: Option<PathBuf>,

    /// Directory to write session recordings to.
    #[arg(long, value_name = "DIR", env = "WSPROXY_RECORD")]
    record: Option<PathBuf>,

    /// Shared secret clients must pass as `?token=` when upgrading.
    #[arg(long, value_name = "TOKEN", env = "WSPROXY_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// TOML file with defaults for any of the settings above.
    #[arg(long, value_name = "FILE", env = "WSPROXY_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            source: self.source.clone(),
            target: self.target.clone(),
            web: self.web.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            record: self.record.clone(),
            auth_token: self.auth_token.clone(),
        }
    }

    /// Merges the command line with the config file and validates the result.
    ///
    /// Returns the proxy configuration plus the auth token, if any.
    ///
    /// # Errors
    ///
    /// Returns a message suitable for a usage error if the config file cannot
    /// be loaded or the merged settings are invalid.
    fn resolve(&self) -> Result<(ProxyConfig, Option<String>), String> {
        let file = match &self.config {
            Some(path) => load_overrides(path).map_err(|e| e.to_string())?,
            None => ConfigOverrides::default(),
        };

        let mut merged = self.overrides().or(file);
        let auth_token = merged.auth_token.take();
        let config = merged.into_config().map_err(|e| e.to_string())?;
        Ok((config, auth_token))
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let (config, auth_token) = match cli.resolve() {
        Ok(resolved) => resolved,
        // Prints usage and exits with status 2.
        Err(message) => Cli::command().error(ErrorKind::ValueValidation, message).exit(),
    };

    info!(
        "wsproxy starting: source={}, target={}",
        config.bind_addr, config.target
    );
    match &config.web_root {
        Some(dir) => info!("serving static files from {}", dir.display()),
        None => info!("static file serving disabled"),
    }
    match &config.tls {
        Some(tls) => info!(
            "TLS enabled: cert={}, key={}",
            tls.cert.display(),
            tls.key.display()
        ),
        None => info!("TLS disabled"),
    }
    if let Some(dir) = &config.record_dir {
        info!("recording sessions to {}", dir.display());
    }

    let authenticator: Arc<dyn Authenticator> = match auth_token {
        Some(token) => {
            info!("upgrade requests require a token");
            Arc::new(TokenAuthenticator::new(token))
        }
        None => Arc::new(AllowAll),
    };

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_server(config, authenticator, running).await?;

    info!("wsproxy stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
