//! Per-identity transcoding session
//!
//! A session owns one transcoder process, the FLV muxer over its stdin and
//! the output directory the transcoder writes into.
//!
//! ```text
//!   Active ──stop()──► Stopping ──exit / kill──► Terminated
//!     │                                              ▲
//!     └──────────── transcoder exits on its own ─────┘
//! ```
//!
//! The supervisor task spawned at creation is the only owner of the child
//! process. It reaps (or kills) the child, releases the registry entry and
//! schedules directory removal, so each of those happens exactly once.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::process::{Child, ChildStdin};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{MuxError, ProcessExitError, SessionError};
use crate::media::{FlvTag, TagMuxer};

use super::config::RegistryConfig;
use super::store::SessionRegistry;
use super::transcoder::forward_output;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transcoder running, accepting frames
    Active,
    /// Teardown started, waiting for the transcoder to exit
    Stopping,
    /// Transcoder reaped
    Terminated,
}

/// A live transcoding session for one identity
pub struct Session {
    identity: String,
    output_dir: PathBuf,
    pid: Option<u32>,
    muxer: TagMuxer<ChildStdin>,
    cancel: CancellationToken,
    active: AtomicBool,
    killed: AtomicBool,
    terminated: watch::Receiver<bool>,
    /// Connection currently publishing into this session
    publisher: Mutex<Option<u64>>,
    grace_timer: Mutex<Option<(u64, AbortHandle)>>,
    grace_seq: AtomicU64,
    created_at: Instant,
}

impl Session {
    /// Create the output directory, spawn the transcoder and start supervising it
    pub(super) async fn start(
        identity: &str,
        config: &RegistryConfig,
        registry: Weak<SessionRegistry>,
    ) -> Result<Arc<Self>, SessionError> {
        let output_dir = config.output_dir.join(identity);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| SessionError::CreateDir {
                path: output_dir.clone(),
                source: e,
            })?;

        let mut spawned = config.transcoder.spawn(&output_dir)?;

        if let Some(stdout) = spawned.child.stdout.take() {
            forward_output(identity.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = spawned.child.stderr.take() {
            forward_output(identity.to_string(), "stderr", stderr);
        }

        let (done_tx, done_rx) = watch::channel(false);

        let session = Arc::new(Self {
            identity: identity.to_string(),
            output_dir,
            pid: spawned.pid,
            muxer: TagMuxer::new(spawned.stdin),
            cancel: CancellationToken::new(),
            active: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            terminated: done_rx,
            publisher: Mutex::new(None),
            grace_timer: Mutex::new(None),
            grace_seq: AtomicU64::new(0),
            created_at: Instant::now(),
        });

        tracing::info!(
            identity = %session.identity,
            pid = ?session.pid,
            output_dir = %session.output_dir.display(),
            "Transcoder started"
        );

        tokio::spawn(supervise(
            spawned.child,
            Arc::clone(&session),
            registry,
            done_tx,
            config.termination_timeout,
            config.cleanup_delay,
        ));

        Ok(session)
    }

    /// Publishing identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Directory the transcoder writes into
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Transcoder process ID
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the session is still accepting frames
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        if *self.terminated.borrow() {
            SessionState::Terminated
        } else if self.is_active() {
            SessionState::Active
        } else {
            SessionState::Stopping
        }
    }

    /// Whether the transcoder had to be killed after the termination timeout
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Time since the session was created
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// The FLV muxer feeding the transcoder
    pub fn muxer(&self) -> &TagMuxer<ChildStdin> {
        &self.muxer
    }

    /// Mux one frame into the transcoder input
    pub async fn write(&self, tag: &FlvTag) -> Result<(), MuxError> {
        self.muxer.write(tag).await
    }

    /// Attach a publishing connection
    ///
    /// Cancels a pending grace stop. Fails if another connection is already
    /// publishing or the session is no longer active.
    pub fn attach(&self, connection_id: u64) -> Result<(), SessionError> {
        let mut publisher = self.publisher.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.is_active() {
            return Err(SessionError::NotActive);
        }
        match *publisher {
            Some(current) if current != connection_id => {
                Err(SessionError::AlreadyPublishing(current))
            }
            _ => {
                *publisher = Some(connection_id);
                self.cancel_grace_stop();
                Ok(())
            }
        }
    }

    /// Detach a publishing connection; returns whether it was attached
    pub fn detach(&self, connection_id: u64) -> bool {
        let mut publisher = self.publisher.lock().unwrap_or_else(PoisonError::into_inner);

        if *publisher == Some(connection_id) {
            *publisher = None;
            true
        } else {
            false
        }
    }

    /// Connection currently publishing, if any
    pub fn publisher(&self) -> Option<u64> {
        *self.publisher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop the session after `delay` unless a publisher attaches first
    ///
    /// Replaces any grace stop already pending.
    pub fn schedule_grace_stop(self: &Arc<Self>, delay: Duration) {
        let seq = self.grace_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(session) = session.upgrade() else {
                return;
            };
            // Disarm ourselves so stop() does not abort this task
            {
                let mut timer = session
                    .grace_timer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let armed = matches!(timer.as_ref(), Some((current, _)) if *current == seq);
                if !armed {
                    return;
                }
                *timer = None;
            }

            if session.publisher().is_none() && session.is_active() {
                tracing::info!(
                    identity = %session.identity,
                    grace_ms = delay.as_millis() as u64,
                    "No reconnection within grace period, stopping stream"
                );
                session.stop().await;
            }
        });

        let previous = self
            .grace_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((seq, handle.abort_handle()));
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    /// Cancel a pending grace stop; returns whether one was pending
    pub fn cancel_grace_stop(&self) -> bool {
        let pending = self
            .grace_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match pending {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a grace stop is pending
    pub fn grace_stop_pending(&self) -> bool {
        self.grace_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the session and wait until it is terminated
    ///
    /// Only the first caller performs the teardown and gets `true`; every
    /// caller returns once the transcoder has been reaped.
    pub async fn stop(&self) -> bool {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.wait_terminated().await;
            return false;
        }

        tracing::info!(identity = %self.identity, "Stopping stream");

        self.cancel_grace_stop();
        // Cancel before closing: a writer blocked on a stalled pipe holds the
        // muxer lock until the supervisor kills the transcoder.
        self.cancel.cancel();
        self.muxer.close().await;

        self.wait_terminated().await;
        true
    }

    /// Wait until the transcoder has been reaped
    pub async fn wait_terminated(&self) {
        let mut terminated = self.terminated.clone();
        // Err means the supervisor is gone, which only happens after it finished
        let _ = terminated.wait_for(|done| *done).await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("pid", &self.pid)
            .field("output_dir", &self.output_dir)
            .field("state", &self.state())
            .finish()
    }
}

/// Wait for the transcoder to exit, then release everything the session holds
async fn supervise(
    mut child: Child,
    session: Arc<Session>,
    registry: Weak<SessionRegistry>,
    done: watch::Sender<bool>,
    termination_timeout: Duration,
    cleanup_delay: Duration,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = session.cancel.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => match tokio::time::timeout(termination_timeout, child.wait()).await {
            Ok(status) => {
                tracing::info!(identity = %session.identity, "Transcoder exited cleanly");
                status
            }
            Err(_) => {
                tracing::warn!(
                    identity = %session.identity,
                    timeout_ms = termination_timeout.as_millis() as u64,
                    "Transcoder did not exit in time, forcing termination"
                );
                session.killed.store(true, Ordering::Release);
                if let Err(e) = child.start_kill() {
                    tracing::error!(identity = %session.identity, error = %e, "Failed to kill transcoder");
                }
                child.wait().await
            }
        },
    };

    // Exit without a stop request: tear down from here
    if session.active.swap(false, Ordering::AcqRel) {
        session.cancel_grace_stop();
        session.cancel.cancel();
        session.muxer.close().await;
    }

    match status {
        Ok(status) if status.success() => {
            tracing::info!(identity = %session.identity, "Transcoder exited normally");
        }
        Ok(status) => {
            let err = ProcessExitError {
                identity: session.identity.clone(),
                status,
            };
            tracing::warn!(error = %err, "Transcoder exited unsuccessfully");
        }
        Err(e) => {
            tracing::error!(identity = %session.identity, error = %e, "Failed to wait for transcoder");
        }
    }

    tracing::info!(
        identity = %session.identity,
        tags = session.muxer.tags_written(),
        bytes = session.muxer.bytes_written(),
        uptime_secs = session.uptime().as_secs(),
        "Stream ended"
    );

    match registry.upgrade() {
        Some(registry) => {
            registry.release(&session, cleanup_delay).await;
        }
        None => {
            let identity = session.identity.clone();
            let dir = session.output_dir.clone();
            tokio::spawn(async move {
                tokio::time::sleep(cleanup_delay).await;
                remove_output_dir(&identity, &dir).await;
            });
        }
    }

    let _ = done.send(true);
}

/// Best-effort removal of a session output directory
pub(super) async fn remove_output_dir(identity: &str, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            tracing::info!(identity = %identity, "Cleaned up stream directory");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                identity = %identity,
                dir = %dir.display(),
                error = %e,
                "Failed to clean up stream directory"
            );
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use bytes::Bytes;

    use super::*;
    use crate::media::FLV_HEADER;
    use crate::registry::transcoder::TranscoderConfig;

    fn registry(base: &Path, transcoder: TranscoderConfig) -> Arc<SessionRegistry> {
        let config = RegistryConfig::default()
            .output_dir(base)
            .termination_timeout(Duration::from_millis(100))
            .cleanup_delay(Duration::ZERO)
            .transcoder(transcoder);
        Arc::new(SessionRegistry::with_config(config))
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_frames_reach_transcoder() {
        let base = tempfile::tempdir().unwrap();
        // Write outside the session directory, which is removed after exit
        let capture = base.path().join("capture.flv");
        let transcoder = TranscoderConfig::new(
            "sh",
            ["-c", "cat > {output_dir}/../capture.flv"],
        );
        let registry = registry(base.path(), transcoder);

        let session = registry.get_or_create("alice").await.unwrap();
        assert_eq!(session.state(), SessionState::Active);

        session.write(&FlvTag::video(0, Bytes::from_static(&[0x17, 0x00]))).await.unwrap();
        session.write(&FlvTag::audio(23, Bytes::from_static(&[0xAF, 0x01]))).await.unwrap();
        assert!(session.stop().await);

        let bytes = std::fs::read(&capture).unwrap();
        assert_eq!(&bytes[..13], &FLV_HEADER);
        assert_eq!(bytes.len(), 13 + (11 + 2 + 4) * 2);
        assert_eq!(bytes[13], 9);
        assert_eq!(bytes[13 + 17], 8);
        assert!(!session.was_killed());
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_double_stop_tears_down_once() {
        let base = tempfile::tempdir().unwrap();
        // Ignores its closed stdin, so it has to be killed
        let transcoder = TranscoderConfig::new("sh", ["-c", "exec sleep 30"]);
        let registry = registry(base.path(), transcoder);

        let session = registry.get_or_create("alice").await.unwrap();
        let dir = session.output_dir().to_path_buf();

        let (a, b) = tokio::join!(session.stop(), session.stop());

        assert!(a ^ b);
        assert!(session.was_killed());
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(registry.get("alice").is_none());
        assert!(eventually(|| !dir.exists()).await);

        assert!(!session.stop().await);
    }

    #[tokio::test]
    async fn test_write_after_stop_fails() {
        let base = tempfile::tempdir().unwrap();
        let transcoder = TranscoderConfig::new("sh", ["-c", "exec cat > /dev/null"]);
        let registry = registry(base.path(), transcoder);

        let session = registry.get_or_create("alice").await.unwrap();
        session.stop().await;

        let result = session.write(&FlvTag::video(0, Bytes::from_static(&[0x17]))).await;
        assert!(matches!(result, Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let base = tempfile::tempdir().unwrap();
        let transcoder = TranscoderConfig::new("sh", ["-c", "exec cat > /dev/null"]);
        let registry = registry(base.path(), transcoder);

        let session = registry.get_or_create("alice").await.unwrap();

        session.attach(1).unwrap();
        session.attach(1).unwrap();
        assert!(matches!(session.attach(2), Err(SessionError::AlreadyPublishing(1))));
        assert_eq!(session.publisher(), Some(1));

        assert!(!session.detach(2));
        assert!(session.detach(1));
        assert_eq!(session.publisher(), None);

        session.stop().await;
        assert!(matches!(session.attach(3), Err(SessionError::NotActive)));
    }

    #[tokio::test]
    async fn test_grace_stop_fires_without_publisher() {
        let base = tempfile::tempdir().unwrap();
        let transcoder = TranscoderConfig::new("sh", ["-c", "exec cat > /dev/null"]);
        let registry = registry(base.path(), transcoder);

        let session = registry.get_or_create("alice").await.unwrap();
        session.schedule_grace_stop(Duration::from_millis(50));
        assert!(session.grace_stop_pending());

        tokio::time::timeout(Duration::from_secs(5), session.wait_terminated())
            .await
            .unwrap();

        assert!(!session.grace_stop_pending());
        assert!(registry.get("alice").is_none());
    }

    #[tokio::test]
    async fn test_attach_cancels_grace_stop() {
        let base = tempfile::tempdir().unwrap();
        let transcoder = TranscoderConfig::new("sh", ["-c", "exec cat > /dev/null"]);
        let registry = registry(base.path(), transcoder);

        let session = registry.get_or_create("alice").await.unwrap();
        session.schedule_grace_stop(Duration::from_millis(50));
        session.attach(7).unwrap();
        assert!(!session.grace_stop_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(session.is_active());

        session.stop().await;
    }

    #[tokio::test]
    async fn test_reschedule_replaces_grace_stop() {
        let base = tempfile::tempdir().unwrap();
        let transcoder = TranscoderConfig::new("sh", ["-c", "exec cat > /dev/null"]);
        let registry = registry(base.path(), transcoder);

        let session = registry.get_or_create("alice").await.unwrap();
        session.schedule_grace_stop(Duration::from_millis(50));
        session.schedule_grace_stop(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(session.is_active());
        assert!(session.grace_stop_pending());

        assert!(session.cancel_grace_stop());
        assert!(!session.cancel_grace_stop());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_organic_exit_removes_directory() {
        let base = tempfile::tempdir().unwrap();
        let transcoder = TranscoderConfig::new("sh", ["-c", "exit 3"]);
        let registry = registry(base.path(), transcoder);

        let session = registry.get_or_create("alice").await.unwrap();
        let dir = session.output_dir().to_path_buf();

        session.wait_terminated().await;
        assert!(!session.is_active());
        assert!(!session.was_killed());
        assert!(eventually(|| !dir.exists()).await);
    }
}
