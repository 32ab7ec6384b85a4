//! Session registry
//!
//! The registry owns one transcoding session per publishing identity and is
//! the only place sessions are created or released.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<SessionRegistry>
//!                   ┌────────────────────────────┐
//!                   │ slots: HashMap<identity,   │
//!                   │   Slot {                   │
//!                   │     create: async lock,    │
//!                   │     current: Arc<Session>, │
//!                   │   }                        │
//!                   │ >                          │
//!                   └─────────────┬──────────────┘
//!                                 │
//!              ┌──────────────────┼──────────────────┐
//!              ▼                  ▼                  ▼
//!         [Session]          [Session]          [Session]
//!         TagMuxer ──stdin──► transcoder ──► <output_dir>/<identity>/
//!              │
//!         supervisor task: reap or kill, release entry, remove directory
//! ```
//!
//! Callers for different identities never wait on each other; callers for the
//! same identity serialize on the slot's creation lock so only one transcoder
//! is ever spawned per identity.

pub mod config;
pub mod session;
pub mod store;
pub mod transcoder;

pub use config::RegistryConfig;
pub use session::{Session, SessionState};
pub use store::SessionRegistry;
pub use transcoder::{SpawnedTranscoder, TranscoderConfig, OUTPUT_DIR_PLACEHOLDER};
