//! Connection context
//!
//! Transient state of one ingest connection between connect and close.

use crate::auth::Captures;

/// Placeholder name carrying the publishing identity
pub const USERNAME_VAR: &str = "username";

/// Placeholder name carrying the application name
pub const APP_VAR: &str = "app";

/// State of one ingest connection after a successful connect
///
/// Owned by that connection's handler and dropped on close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Unique connection ID
    pub connection_id: u64,

    /// Application name (from connect)
    pub app: String,

    /// Raw connect target, e.g. `rtmp://host/live/test/alice`
    pub target: String,

    vars: Captures,
}

impl ConnectionContext {
    /// Create a new context from an authorized connect
    pub fn new(connection_id: u64, app: impl Into<String>, target: impl Into<String>, vars: Captures) -> Self {
        Self {
            connection_id,
            app: app.into(),
            target: target.into(),
            vars,
        }
    }

    /// Get a captured variable
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Copy of all captured variables
    pub fn vars(&self) -> Captures {
        self.vars.clone()
    }

    /// Captured variables by reference
    pub fn captures(&self) -> &Captures {
        &self.vars
    }

    /// Captured `username`, if the matching pattern had one
    pub fn username(&self) -> Option<&str> {
        self.var(USERNAME_VAR)
    }

    /// Captured `app`, falling back to the application name from connect
    pub fn app_name(&self) -> &str {
        self.var(APP_VAR).unwrap_or(&self.app)
    }
}
