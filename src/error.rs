//! Error types
//!
//! Each layer has its own error enum; the crate-level [`Error`] wraps them
//! and attaches the publishing identity where the failure belongs to a
//! session.

use std::path::PathBuf;
use std::process::ExitStatus;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("session '{identity}': {source}")]
    Session {
        identity: String,
        #[source]
        source: SessionError,
    },

    #[error("muxing for '{identity}' failed: {source}")]
    Mux {
        identity: String,
        #[source]
        source: MuxError,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("play requests are not accepted by this server")]
    PlayRejected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a session error with the identity it belongs to
    pub fn session(identity: impl Into<String>, source: SessionError) -> Self {
        Error::Session {
            identity: identity.into(),
            source,
        }
    }

    /// Wrap a muxing error with the identity it belongs to
    pub fn mux(identity: impl Into<String>, source: MuxError) -> Self {
        Error::Mux {
            identity: identity.into(),
            source,
        }
    }

    /// Whether this error came from authorization
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}

/// Authorization failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("target '{0}' matches no authorized pattern")]
    NoMatchingPattern(String),

    #[error("empty publishing identity")]
    EmptyIdentity,

    #[error("captured {name} '{captured}' does not match publishing identity '{identity}'")]
    IdentityMismatch {
        name: String,
        captured: String,
        identity: String,
    },

    #[error("publish received before an authorized connect")]
    NotConnected,
}

/// Failures creating or driving a session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to create output directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn transcoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder {0} pipe was not available")]
    MissingPipe(&'static str),

    #[error("identity is not usable as a directory name")]
    InvalidIdentity,

    #[error("stream already has a publisher (connection {0})")]
    AlreadyPublishing(u64),

    #[error("session is no longer active")]
    NotActive,

    #[error("registry is shut down")]
    RegistryClosed,
}

/// Failures writing or reading FLV data
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("payload of {0} bytes exceeds the 24-bit tag size field")]
    PayloadTooLarge(usize),

    #[error("sink is closed")]
    Closed,

    #[error("unknown tag type {0}")]
    UnknownTagType(u8),

    #[error("not an FLV header")]
    InvalidHeader,

    #[error("truncated data: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("previous tag size {actual} does not match expected {expected}")]
    TrailerMismatch { expected: u32, actual: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transcoder exited unsuccessfully. Logged, never retried.
#[derive(Debug, thiserror::Error)]
#[error("transcoder for '{identity}' exited with {status}")]
pub struct ProcessExitError {
    pub identity: String,
    pub status: ExitStatus,
}

/// Configuration loading failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid address '{0}'")]
    InvalidAddr(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_carries_identity() {
        let err = Error::session("alice", SessionError::RegistryClosed);
        assert_eq!(err.to_string(), "session 'alice': registry is shut down");
    }

    #[test]
    fn test_auth_conversion() {
        let err: Error = AuthError::EmptyIdentity.into();
        assert!(err.is_auth());
        assert!(!Error::PlayRejected.is_auth());
    }

    #[test]
    fn test_mismatch_message() {
        let err = AuthError::IdentityMismatch {
            name: "username".into(),
            captured: "johndoe".into(),
            identity: "alice".into(),
        };
        assert_eq!(
            err.to_string(),
            "captured username 'johndoe' does not match publishing identity 'alice'"
        );
    }
}
