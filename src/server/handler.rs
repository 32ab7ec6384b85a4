//! Ingest event handling
//!
//! The protocol adapter decodes the wire protocol and drives one handler per
//! connection through `connect → publish → frame* → close`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Authorizer;
use crate::error::{AuthError, Error, MuxError, Result, SessionError};
use crate::media::FlvTag;
use crate::registry::{Session, SessionRegistry};
use crate::session::ConnectionContext;

/// Attempts to attach when a session retires between lookup and attach
const ATTACH_ATTEMPTS: usize = 3;

/// Handler for ingest connection events
///
/// One instance per connection; the adapter calls the methods in order and
/// never concurrently. Implementations may use `async fn`.
pub trait IngestHandler: Send {
    /// Called when a client connects to `app` with the full connect target
    ///
    /// Returning an error rejects the connection.
    fn on_connect(&mut self, app: &str, target: &str) -> impl Future<Output = Result<()>> + Send;

    /// Called when the client starts publishing as `identity`
    fn on_publish(&mut self, identity: &str) -> impl Future<Output = Result<()>> + Send;

    /// Called for every audio, video or script frame
    fn on_frame(&mut self, tag: FlvTag) -> impl Future<Output = Result<()>> + Send;

    /// Called when the client asks to play a stream
    ///
    /// Rejected by default.
    fn on_play(&mut self, stream: &str) -> impl Future<Output = Result<()>> + Send {
        tracing::debug!(stream = stream, "Play request rejected");
        async { Err(Error::PlayRejected) }
    }

    /// Called once when the connection closes
    fn on_close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Authorizes publishers and feeds their frames into registry sessions
pub struct PublishHandler {
    connection_id: u64,
    authorizer: Arc<Authorizer>,
    registry: Arc<SessionRegistry>,
    reconnect_grace: Duration,
    context: Option<ConnectionContext>,
    session: Option<Arc<Session>>,
    frames: u64,
}

impl PublishHandler {
    pub fn new(
        connection_id: u64,
        authorizer: Arc<Authorizer>,
        registry: Arc<SessionRegistry>,
        reconnect_grace: Duration,
    ) -> Self {
        Self {
            connection_id,
            authorizer,
            registry,
            reconnect_grace,
            context: None,
            session: None,
            frames: 0,
        }
    }

    /// Unique connection ID
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Context of an authorized connect, until close
    pub fn context(&self) -> Option<&ConnectionContext> {
        self.context.as_ref()
    }

    /// Session this connection is publishing into
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Frames forwarded since publish
    pub fn frames(&self) -> u64 {
        self.frames
    }

    async fn attach(&self, identity: &str) -> std::result::Result<Arc<Session>, SessionError> {
        let mut attempt = 1;
        loop {
            let session = self.registry.get_or_create(identity).await?;
            match session.attach(self.connection_id) {
                Ok(()) => return Ok(session),
                // Grace expiry or exit raced us; the registry replaces it
                Err(SessionError::NotActive) if attempt < ATTACH_ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Detach from the current session and start its grace period
    fn release_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        if session.detach(self.connection_id) && session.is_active() {
            tracing::debug!(
                connection_id = self.connection_id,
                identity = %session.identity(),
                grace_ms = self.reconnect_grace.as_millis() as u64,
                "Publisher left, starting grace period"
            );
            session.schedule_grace_stop(self.reconnect_grace);
        }
    }
}

impl IngestHandler for PublishHandler {
    async fn on_connect(&mut self, app: &str, target: &str) -> Result<()> {
        self.release_session();
        self.context = None;

        match self.authorizer.authorize(target) {
            Ok(vars) => {
                tracing::info!(
                    connection_id = self.connection_id,
                    app = app,
                    target = target,
                    "Connection authorized"
                );
                self.context = Some(ConnectionContext::new(self.connection_id, app, target, vars));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = self.connection_id,
                    target = target,
                    error = %e,
                    "Connection rejected"
                );
                Err(e.into())
            }
        }
    }

    async fn on_publish(&mut self, identity: &str) -> Result<()> {
        let ctx = self.context.as_ref().ok_or(AuthError::NotConnected)?;

        if let Err(e) = self.authorizer.validate_authentication(ctx.captures(), identity) {
            tracing::warn!(
                connection_id = self.connection_id,
                identity = identity,
                error = %e,
                "Publish rejected"
            );
            return Err(e.into());
        }
        let app = ctx.app_name().to_string();

        if let Some(current) = &self.session {
            if current.identity() == identity && current.is_active() {
                return Ok(());
            }
            self.release_session();
        }

        let session = self
            .attach(identity)
            .await
            .map_err(|e| Error::session(identity, e))?;

        tracing::info!(
            connection_id = self.connection_id,
            identity = identity,
            app = %app,
            pid = ?session.pid(),
            "Publishing started"
        );

        self.session = Some(session);
        self.frames = 0;
        Ok(())
    }

    async fn on_frame(&mut self, tag: FlvTag) -> Result<()> {
        let Some(session) = &self.session else {
            tracing::trace!(connection_id = self.connection_id, "Frame before publish ignored");
            return Ok(());
        };

        match session.write(&tag).await {
            Ok(()) => {
                self.frames += 1;
                Ok(())
            }
            Err(e) if !ends_stream(&e) => {
                let identity = session.identity().to_string();
                tracing::warn!(
                    connection_id = self.connection_id,
                    identity = %identity,
                    error = %e,
                    "Frame rejected"
                );
                Err(Error::mux(identity, e))
            }
            Err(e) => {
                let identity = session.identity().to_string();
                tracing::warn!(
                    connection_id = self.connection_id,
                    identity = %identity,
                    error = %e,
                    "Muxing failed, ending stream"
                );

                if let Some(session) = self.session.take() {
                    session.detach(self.connection_id);
                    tokio::spawn(async move {
                        session.stop().await;
                    });
                }

                Err(Error::mux(identity, e))
            }
        }
    }

    async fn on_close(&mut self) {
        tracing::debug!(
            connection_id = self.connection_id,
            frames = self.frames,
            "Connection closed"
        );
        self.release_session();
        self.context = None;
    }
}

/// Whether a write error leaves the transcoder pipe unusable
fn ends_stream(error: &MuxError) -> bool {
    matches!(error, MuxError::Io(_) | MuxError::Closed)
}

impl Drop for PublishHandler {
    fn drop(&mut self) {
        // Closed without on_close; grace timers need a runtime
        if self.session.is_some() && tokio::runtime::Handle::try_current().is_ok() {
            self.release_session();
        }
    }
}

impl std::fmt::Debug for PublishHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishHandler")
            .field("connection_id", &self.connection_id)
            .field("context", &self.context)
            .field("session", &self.session.as_ref().map(|s| s.identity()))
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::registry::{RegistryConfig, TranscoderConfig};

    struct Fixture {
        _dir: tempfile::TempDir,
        authorizer: Arc<Authorizer>,
        registry: Arc<SessionRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = RegistryConfig::default()
                .output_dir(dir.path())
                .termination_timeout(Duration::from_millis(200))
                .cleanup_delay(Duration::ZERO)
                .transcoder(TranscoderConfig::new("sh", ["-c", "exec cat > /dev/null"]));

            Self {
                _dir: dir,
                authorizer: Arc::new(Authorizer::new(["/live/{app}/{username}"])),
                registry: Arc::new(SessionRegistry::with_config(config)),
            }
        }

        fn handler(&self, connection_id: u64, grace: Duration) -> PublishHandler {
            PublishHandler::new(
                connection_id,
                Arc::clone(&self.authorizer),
                Arc::clone(&self.registry),
                grace,
            )
        }
    }

    #[tokio::test]
    async fn test_unauthorized_connect_rejected() {
        let fx = Fixture::new();
        let mut handler = fx.handler(1, Duration::from_secs(5));

        let err = handler.on_connect("live", "rtmp://host/other/path").await.unwrap_err();

        assert!(err.is_auth());
        assert!(handler.context().is_none());
    }

    #[tokio::test]
    async fn test_publish_without_connect_rejected() {
        let fx = Fixture::new();
        let mut handler = fx.handler(1, Duration::from_secs(5));

        let err = handler.on_publish("johndoe").await.unwrap_err();

        assert!(matches!(err, Error::Auth(AuthError::NotConnected)));
        assert!(fx.registry.active_identities().is_empty());
    }

    #[tokio::test]
    async fn test_identity_mismatch_rejected() {
        let fx = Fixture::new();
        let mut handler = fx.handler(1, Duration::from_secs(5));

        handler.on_connect("live", "rtmp://host/live/test/johndoe").await.unwrap();
        let err = handler.on_publish("alice").await.unwrap_err();

        assert!(matches!(err, Error::Auth(AuthError::IdentityMismatch { .. })));
        assert!(fx.registry.active_identities().is_empty());
    }

    #[tokio::test]
    async fn test_publish_and_frames() {
        let fx = Fixture::new();
        let mut handler = fx.handler(1, Duration::from_secs(5));

        handler.on_connect("live", "rtmp://host/live/test/johndoe").await.unwrap();
        assert_eq!(handler.context().unwrap().username(), Some("johndoe"));

        // Ignored, nothing to publish into yet
        handler.on_frame(FlvTag::video(0, Bytes::from_static(&[0x17]))).await.unwrap();
        assert_eq!(handler.frames(), 0);

        handler.on_publish("johndoe").await.unwrap();
        assert_eq!(fx.registry.active_identities(), vec!["johndoe".to_string()]);
        assert_eq!(handler.session().unwrap().publisher(), Some(1));

        handler.on_frame(FlvTag::script(0, Bytes::from_static(b"meta"))).await.unwrap();
        handler.on_frame(FlvTag::video(0, Bytes::from_static(&[0x17, 0x00]))).await.unwrap();
        handler.on_frame(FlvTag::audio(10, Bytes::from_static(&[0xAF]))).await.unwrap();
        assert_eq!(handler.frames(), 3);
        assert_eq!(handler.session().unwrap().muxer().tags_written(), 3);

        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_play_rejected() {
        let fx = Fixture::new();
        let mut handler = fx.handler(1, Duration::from_secs(5));

        handler.on_connect("live", "rtmp://host/live/test/johndoe").await.unwrap();
        let err = handler.on_play("johndoe").await.unwrap_err();

        assert!(matches!(err, Error::PlayRejected));
    }

    #[tokio::test]
    async fn test_second_publisher_rejected() {
        let fx = Fixture::new();
        let mut first = fx.handler(1, Duration::from_secs(5));
        let mut second = fx.handler(2, Duration::from_secs(5));

        first.on_connect("live", "rtmp://host/live/test/johndoe").await.unwrap();
        first.on_publish("johndoe").await.unwrap();

        second.on_connect("live", "rtmp://host/live/test/johndoe").await.unwrap();
        let err = second.on_publish("johndoe").await.unwrap_err();

        assert!(matches!(
            err,
            Error::Session {
                source: SessionError::AlreadyPublishing(1),
                ..
            }
        ));

        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_starts_grace_period() {
        let fx = Fixture::new();
        let mut handler = fx.handler(1, Duration::from_secs(30));

        handler.on_connect("live", "rtmp://host/live/test/johndoe").await.unwrap();
        handler.on_publish("johndoe").await.unwrap();
        let session = Arc::clone(handler.session().unwrap());

        handler.on_close().await;

        assert!(handler.context().is_none());
        assert!(handler.session().is_none());
        assert_eq!(session.publisher(), None);
        assert!(session.grace_stop_pending());
        assert!(session.is_active());

        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_without_close_starts_grace_period() {
        let fx = Fixture::new();
        let mut handler = fx.handler(1, Duration::from_secs(30));

        handler.on_connect("live", "rtmp://host/live/test/johndoe").await.unwrap();
        handler.on_publish("johndoe").await.unwrap();
        let session = Arc::clone(handler.session().unwrap());

        drop(handler);

        assert_eq!(session.publisher(), None);
        assert!(session.grace_stop_pending());

        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_frame_after_session_stopped_fails() {
        let fx = Fixture::new();
        let mut handler = fx.handler(1, Duration::from_secs(5));

        handler.on_connect("live", "rtmp://host/live/test/johndoe").await.unwrap();
        handler.on_publish("johndoe").await.unwrap();
        handler.session().unwrap().stop().await;

        let err = handler
            .on_frame(FlvTag::video(0, Bytes::from_static(&[0x17])))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Mux { ref identity, .. } if identity == "johndoe"));
        assert!(handler.session().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_keeps_session() {
        let fx = Fixture::new();
        let mut handler = fx.handler(1, Duration::from_secs(5));

        handler.on_connect("live", "rtmp://host/live/test/johndoe").await.unwrap();
        handler.on_publish("johndoe").await.unwrap();
        let session = Arc::clone(handler.session().unwrap());

        let oversized = Bytes::from(vec![0u8; crate::media::MAX_TAG_DATA_SIZE + 1]);
        let err = handler.on_frame(FlvTag::video(0, oversized)).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Mux {
                source: MuxError::PayloadTooLarge(_),
                ..
            }
        ));
        assert!(session.is_active());
        assert_eq!(session.publisher(), Some(1));
        assert!(handler.session().is_some());

        handler.on_frame(FlvTag::video(0, Bytes::from_static(&[0x17]))).await.unwrap();
        assert_eq!(handler.frames(), 1);

        fx.registry.shutdown().await;
    }
}
