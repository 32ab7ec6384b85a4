//! Multi-publisher live ingest with per-stream HLS transcoding
//!
//! A protocol adapter decodes the ingest wire protocol and drives one
//! [`IngestHandler`] per connection. Publishers are authorized against
//! path patterns, and their frames are muxed as FLV into one transcoder
//! process per identity, which writes HLS into `<output_dir>/<identity>/`.
//!
//! ```text
//!   adapter ──connect──► Authorizer ── captures ──┐
//!           ──publish──► PublishHandler ◄─────────┘
//!                             │ get_or_create(identity)
//!                             ▼
//!                      SessionRegistry ──► Session ──FLV──► transcoder ──► HLS
//!                                                                           │
//!   player ◄──────────────── delivery router ◄──────────────────────────────┘
//! ```
//!
//! When a publisher disconnects its session survives for a grace period, so a
//! quick reconnect keeps the same transcoder and output directory.
//!
//! # Example
//!
//! ```no_run
//! use rtmp_hls::{FlvTag, IngestHandler, ServerConfig, StreamServer};
//!
//! # async fn run() -> rtmp_hls::Result<()> {
//! let server = StreamServer::new(ServerConfig::default());
//!
//! // One handler per accepted ingest connection
//! let mut conn = server.handler();
//! conn.on_connect("live", "rtmp://localhost/live/test/johndoe").await?;
//! conn.on_publish("johndoe").await?;
//! conn.on_frame(FlvTag::video(0, vec![0x17, 0x00].into())).await?;
//! conn.on_close().await;
//!
//! server.run_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod delivery;
pub mod error;
pub mod media;
pub mod registry;
pub mod server;
pub mod session;

pub use auth::Authorizer;
pub use error::{Error, Result};
pub use media::{FlvTag, FlvTagType, TagMuxer};
pub use registry::{RegistryConfig, Session, SessionRegistry, TranscoderConfig};
pub use server::{IngestHandler, PublishHandler, ServerConfig, StreamServer};
pub use session::ConnectionContext;
