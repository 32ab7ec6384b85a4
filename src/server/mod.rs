//! Server side of the ingest pipeline
//!
//! - [`IngestHandler`]: the event sink a protocol adapter drives per connection
//! - [`PublishHandler`]: authorizes publishers and feeds the registry
//! - [`StreamServer`]: owns the shared state and the delivery router

pub mod config;
pub mod handler;
pub mod listener;

pub use config::{ServerConfig, DEFAULT_PATTERN};
pub use handler::{IngestHandler, PublishHandler};
pub use listener::StreamServer;
