//! FLV tag muxer
//!
//! Serializes frames onto a single byte sink, normally the stdin pipe of a
//! transcoder process. Writes from audio, video and metadata callbacks may
//! race; every tag is written whole under the sink lock so tags never
//! interleave.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::MuxError;

use super::flv::{encode_tag, FlvTag, FlvTagType, FLV_HEADER, MAX_TAG_DATA_SIZE};

struct SinkState<W> {
    /// `None` once closed
    sink: Option<W>,
    header_written: bool,
    buf: BytesMut,
}

/// Thread-safe FLV writer over an async sink
pub struct TagMuxer<W> {
    state: Mutex<SinkState<W>>,
    tags_written: AtomicU64,
    bytes_written: AtomicU64,
}

impl<W> TagMuxer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(sink: W) -> Self {
        Self {
            state: Mutex::new(SinkState {
                sink: Some(sink),
                header_written: false,
                buf: BytesMut::with_capacity(64 * 1024),
            }),
            tags_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Write the FLV file header if it has not been written yet
    pub async fn write_header(&self) -> Result<(), MuxError> {
        let mut state = self.state.lock().await;
        self.ensure_header(&mut state).await
    }

    /// Write one tag, preceded by the file header on first use
    pub async fn write_tag(
        &self,
        tag_type: FlvTagType,
        timestamp: u32,
        data: &[u8],
    ) -> Result<(), MuxError> {
        if data.len() > MAX_TAG_DATA_SIZE {
            return Err(MuxError::PayloadTooLarge(data.len()));
        }

        let mut state = self.state.lock().await;
        self.ensure_header(&mut state).await?;

        let SinkState { sink, buf, .. } = &mut *state;
        let sink = sink.as_mut().ok_or(MuxError::Closed)?;

        buf.clear();
        encode_tag(buf, tag_type, timestamp, data)?;
        let written = match sink.write_all(&buf[..]).await {
            Ok(()) => sink.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // A partial tag leaves the stream unparseable
            state.sink = None;
            return Err(e.into());
        }

        self.tags_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(buf.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    /// Write a parsed tag
    pub async fn write(&self, tag: &FlvTag) -> Result<(), MuxError> {
        self.write_tag(tag.tag_type, tag.timestamp, &tag.data).await
    }

    pub async fn write_audio(&self, timestamp: u32, data: &[u8]) -> Result<(), MuxError> {
        self.write_tag(FlvTagType::Audio, timestamp, data).await
    }

    pub async fn write_video(&self, timestamp: u32, data: &[u8]) -> Result<(), MuxError> {
        self.write_tag(FlvTagType::Video, timestamp, data).await
    }

    pub async fn write_script(&self, timestamp: u32, data: &[u8]) -> Result<(), MuxError> {
        self.write_tag(FlvTagType::Script, timestamp, data).await
    }

    /// Shut the sink down, signalling end-of-stream to the reader
    ///
    /// Returns the sink so callers can inspect what was written. Later writes
    /// fail with [`MuxError::Closed`].
    pub async fn close(&self) -> Option<W> {
        let mut state = self.state.lock().await;
        let mut sink = state.sink.take()?;

        if let Err(e) = sink.shutdown().await {
            tracing::debug!(error = %e, "Sink shutdown failed");
        }
        Some(sink)
    }

    /// Whether the sink has been closed
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.sink.is_none()
    }

    /// Number of tags written so far
    pub fn tags_written(&self) -> u64 {
        self.tags_written.load(Ordering::Relaxed)
    }

    /// Number of tag bytes written so far (header excluded)
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    async fn ensure_header(&self, state: &mut SinkState<W>) -> Result<(), MuxError> {
        if state.header_written {
            return Ok(());
        }
        let sink = state.sink.as_mut().ok_or(MuxError::Closed)?;

        if let Err(e) = sink.write_all(&FLV_HEADER).await {
            state.sink = None;
            return Err(e.into());
        }
        state.header_written = true;
        Ok(())
    }
}
