//! Media framing for the transcoder input
//!
//! This module provides:
//! - FLV tag encoding and decoding
//! - A tag muxer that serializes concurrent frame writers onto one sink

pub mod flv;
pub mod muxer;

pub use flv::{FlvTag, FlvTagType, FLV_HEADER, MAX_TAG_DATA_SIZE};
pub use muxer::TagMuxer;
