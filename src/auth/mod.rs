//! Publish authorization
//!
//! Connect targets are authorized against an ordered list of path patterns
//! with `{name}` placeholders. The variables captured at connect time are
//! checked again when the connection publishes:
//!
//! ```text
//! connect  rtmp://host/live/test/johndoe
//!            │
//!            ▼  path "/live/test/johndoe"
//!          /live/{app}/{username}  ──►  {app: "test", username: "johndoe"}
//!
//! publish  "johndoe"  ──►  UsernameRule: username == identity
//! ```

pub mod authorizer;
pub mod pattern;

pub use authorizer::{target_path, Authorizer, CaptureRule, UsernameRule};
pub use pattern::{Captures, PathPattern};
