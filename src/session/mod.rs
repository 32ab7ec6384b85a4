//! Per-connection state

pub mod context;

pub use context::{ConnectionContext, APP_VAR, USERNAME_VAR};
