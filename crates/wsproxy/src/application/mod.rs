//! Application layer for wsproxy.
//!
//! Policy that sits between the listener and the sessions.  Today that is the
//! authentication gate; it decides *whether* a session may form, while the
//! infrastructure layer decides *how* bytes move once it has.

pub mod auth;

pub use auth::{AllowAll, AuthDecision, Authenticator, TokenAuthenticator, UpgradeRequest};
