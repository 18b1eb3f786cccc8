//! # Device Session
//!
//! One `Session` per live device connection. It owns the connection's queues and
//! background loops and moves through a single, one-way lifecycle:
//!
//! ```text
//! Connecting --start()--> Active --close()--> Closing --write loop done--> Closed
//!      \_________________________close()_______________________________/
//! ```
//!
//! ## Loops started by `start()`:
//! - **read**: device frames in, text to the conversation, audio to transcription
//! - **write**: the only task that writes to the device
//! - **keepalive**: asks the write loop for a ping when the device goes quiet
//! - **conversation**: runs the orchestrator for this user
//! - **relay**: wraps conversation replies as `DeviceReply` JSON and queues them
//!
//! Every loop watches the session's cancellation token. `close()` is the only
//! thing that cancels it, and it only does so once.

mod pumps;
pub mod reply;

use crate::config::SessionConfig;
use crate::conversation::ConversationOrchestrator;
use crate::error::GatewayError;
use crate::transcription::Transcriber;
use crate::transport::Transport;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

pub use reply::DeviceReply;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_DEVICE_ID: &str = "x-device-id";
pub const HEADER_DEVICE_VERSION: &str = "x-device-version";

/// Who is on the other end of a connection. Fixed for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: Uuid,
    pub user_id: u64,
    pub device_id: String,
    pub device_version: String,
}

impl SessionIdentity {
    pub fn new(user_id: u64, device_id: impl Into<String>, device_version: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            device_id: device_id.into(),
            device_version: device_version.into(),
        }
    }

    /// Build an identity from the headers set by the upstream auth layer.
    ///
    /// `lookup` receives lowercase header names. The device version is optional
    /// and defaults to `unknown`.
    pub fn from_headers<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let user_id = lookup(HEADER_USER_ID)
            .ok_or_else(|| "missing X-User-Id header".to_string())?
            .trim()
            .parse::<u64>()
            .map_err(|_| "X-User-Id must be a positive integer".to_string())?;

        let device_id = lookup(HEADER_DEVICE_ID)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| "missing X-Device-Id header".to_string())?;

        let device_version = lookup(HEADER_DEVICE_VERSION)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self::new(user_id, device_id, device_version))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Queue sizes and timing for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    pub reply_capacity: usize,
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_message_size: usize,
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            outbound_capacity: config.outbound_queue_capacity.max(1),
            inbound_capacity: config.inbound_queue_capacity.max(1),
            reply_capacity: config.reply_queue_capacity.max(1),
            ping_period: Duration::from_secs(config.ping_period_secs),
            pong_wait: Duration::from_secs(config.pong_wait_secs),
            write_wait: Duration::from_secs(config.write_wait_secs),
            max_message_size: config.max_message_size,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Collaborators every session needs.
#[derive(Clone)]
pub struct SessionServices {
    pub orchestrator: ConversationOrchestrator,
    pub transcriber: Arc<dyn Transcriber>,
}

struct Lifecycle {
    state: SessionState,
    outbound: Option<mpsc::Sender<String>>,
}

/// Receivers created with the session and handed to the loops on `start()`.
struct PendingChannels {
    outbound_rx: mpsc::Receiver<String>,
    inbound_rx: mpsc::Receiver<String>,
}

pub struct Session {
    identity: SessionIdentity,
    settings: SessionSettings,
    services: SessionServices,
    lifecycle: Mutex<Lifecycle>,
    inbound_tx: mpsc::Sender<String>,
    pending: Mutex<Option<PendingChannels>>,
    cancel: CancellationToken,
    span: tracing::Span,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(identity: SessionIdentity, settings: SessionSettings, services: SessionServices) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity);
        let span = tracing::info_span!(
            "session",
            session_id = %identity.session_id,
            user_id = identity.user_id,
            device_id = %identity.device_id,
        );

        Arc::new(Self {
            identity,
            settings,
            services,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Connecting,
                outbound: Some(outbound_tx),
            }),
            inbound_tx,
            pending: Mutex::new(Some(PendingChannels { outbound_rx, inbound_rx })),
            cancel: CancellationToken::new(),
            span,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn state(&self) -> SessionState {
        self.lock_lifecycle().state
    }

    /// True once `close()` has run, even if the loops are still winding down.
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the session loops over `transport`. Can only succeed once.
    pub fn start<T: Transport>(self: &Arc<Self>, transport: T) -> Result<SessionHandle, GatewayError> {
        {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.state != SessionState::Connecting {
                return Err(GatewayError::Closed);
            }
            lifecycle.state = SessionState::Active;
        }

        let Some(channels) = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Err(GatewayError::Closed);
        };

        let (reader, writer) = transport.split();
        let (ping_tx, ping_rx) = mpsc::channel(1);
        let (probe_tx, probe_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = mpsc::channel(self.settings.reply_capacity);

        let mut tasks = JoinSet::new();
        tasks.spawn(pumps::read_loop(self.clone(), reader, ping_tx).instrument(self.span.clone()));
        tasks.spawn(pumps::write_loop(self.clone(), writer, channels.outbound_rx, probe_rx).instrument(self.span.clone()));
        tasks.spawn(pumps::keepalive_loop(self.clone(), ping_rx, probe_tx).instrument(self.span.clone()));
        tasks.spawn(pumps::relay_loop(self.clone(), reply_rx).instrument(self.span.clone()));

        let session = self.clone();
        let orchestrator = self.services.orchestrator.clone();
        let user_id = self.identity.user_id;
        let cancel = self.cancel.clone();
        tasks.spawn(
            async move {
                if let Err(e) = orchestrator.execute(user_id, channels.inbound_rx, reply_tx, cancel).await {
                    error!(error = %e, "Conversation failed to start");
                    session.close();
                }
            }
            .instrument(self.span.clone()),
        );

        info!(parent: &self.span, device_version = %self.identity.device_version, "Session started");
        Ok(SessionHandle { tasks })
    }

    /// Queue `payload` for the device without waiting.
    ///
    /// A full outbound queue means the device is not keeping up; the session is
    /// closed and `QueueFull` returned.
    pub fn send(&self, payload: String) -> Result<(), GatewayError> {
        let sender = {
            let lifecycle = self.lock_lifecycle();
            match lifecycle.state {
                SessionState::Closing | SessionState::Closed => return Err(GatewayError::Closed),
                _ => lifecycle.outbound.clone(),
            }
        };
        let Some(sender) = sender else {
            return Err(GatewayError::Closed);
        };

        match sender.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(parent: &self.span, "Outbound queue full, closing session");
                self.close();
                Err(GatewayError::QueueFull(self.identity.device_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GatewayError::Closed),
        }
    }

    /// Hand text to this session's conversation. Dropped if the queue is full.
    pub fn forward_inbound(&self, text: String) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        match self.inbound_tx.try_send(text) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(parent: &self.span, "Conversation input queue full, message dropped");
                Err(GatewayError::QueueFull(self.identity.device_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GatewayError::Closed),
        }
    }

    /// Begin shutting the session down. Returns `false` if it was already closed.
    ///
    /// Releases the outbound queue and cancels every loop. The write loop sends
    /// the close frame and then marks the session `Closed`.
    pub fn close(&self) -> bool {
        let started = {
            let mut lifecycle = self.lock_lifecycle();
            match lifecycle.state {
                SessionState::Closing | SessionState::Closed => return false,
                SessionState::Connecting => lifecycle.state = SessionState::Closed,
                SessionState::Active => lifecycle.state = SessionState::Closing,
            }
            lifecycle.outbound = None;
            lifecycle.state == SessionState::Closing
        };

        self.cancel.cancel();
        if !started {
            self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        }
        debug!(parent: &self.span, "Session closing");
        true
    }

    fn mark_closed(&self) {
        self.lock_lifecycle().state = SessionState::Closed;
        info!(parent: &self.span, "Session closed");
    }
}

/// Resolves once every loop of a started session has finished.
pub struct SessionHandle {
    tasks: JoinSet<()>,
}

impl SessionHandle {
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Session task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_transport, stalled_transport, test_services, MemoryHistoryStore, StubTranscriber};
    use crate::transport::Frame;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::timeout;

    fn quick_settings() -> SessionSettings {
        SessionSettings {
            outbound_capacity: 4,
            inbound_capacity: 4,
            reply_capacity: 4,
            ping_period: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(1),
            max_message_size: 1024,
        }
    }

    fn new_session(settings: SessionSettings) -> (Arc<Session>, Arc<MemoryHistoryStore>) {
        let store = Arc::new(MemoryHistoryStore::default());
        let services = test_services(store.clone(), Arc::new(StubTranscriber::text("dari suara")));
        (Session::new(SessionIdentity::new(7, "doll-1", "1.0"), settings, services), store)
    }

    async fn next_text(peer: &mut crate::testing::MemoryPeer) -> String {
        loop {
            match timeout(Duration::from_secs(2), peer.recv()).await.expect("frame in time") {
                Some(Frame::Text(text)) => return text,
                Some(_) => continue,
                None => panic!("session closed before replying"),
            }
        }
    }

    #[test]
    fn test_identity_from_headers() {
        let headers: HashMap<&str, &str> = [("x-user-id", "12"), ("x-device-id", " doll-9 ")].into();
        let identity = SessionIdentity::from_headers(|name| headers.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(identity.user_id, 12);
        assert_eq!(identity.device_id, "doll-9");
        assert_eq!(identity.device_version, "unknown");
    }

    #[test]
    fn test_identity_rejects_bad_headers() {
        let missing_device: HashMap<&str, &str> = [("x-user-id", "12")].into();
        assert!(SessionIdentity::from_headers(|n| missing_device.get(n).map(|v| v.to_string())).is_err());

        let bad_user: HashMap<&str, &str> = [("x-user-id", "abc"), ("x-device-id", "d")].into();
        assert!(SessionIdentity::from_headers(|n| bad_user.get(n).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn test_each_identity_gets_a_fresh_session_id() {
        let a = SessionIdentity::new(1, "d", "v");
        let b = SessionIdentity::new(1, "d", "v");
        assert_ne!(a.session_id, b.session_id);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _) = new_session(quick_settings());
        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.send("late".to_string()), Err(GatewayError::Closed));
        assert_eq!(session.forward_inbound("late".to_string()), Err(GatewayError::Closed));
    }

    #[tokio::test]
    async fn test_full_outbound_queue_closes_session() {
        let mut settings = quick_settings();
        settings.outbound_capacity = 2;
        let (session, _) = new_session(settings);

        session.send("one".to_string()).unwrap();
        session.send("two".to_string()).unwrap();
        let result = session.send("three".to_string());

        assert_eq!(result, Err(GatewayError::QueueFull("doll-1".to_string())));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let (session, _) = new_session(quick_settings());
        let (transport, _peer) = memory_transport();
        let (second, _peer2) = memory_transport();

        let handle = session.start(transport).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert!(matches!(session.start(second), Err(GatewayError::Closed)));

        session.close();
        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_closed_session_cannot_start() {
        let (session, _) = new_session(quick_settings());
        session.close();
        let (transport, _peer) = memory_transport();
        assert!(matches!(session.start(transport), Err(GatewayError::Closed)));
    }

    #[tokio::test]
    async fn test_text_frame_gets_a_reply() {
        let (session, _) = new_session(quick_settings());
        let (transport, mut peer) = memory_transport();
        let handle = session.start(transport).unwrap();

        peer.send(Frame::Text("halo".to_string())).await;
        let reply: DeviceReply = serde_json::from_str(&next_text(&mut peer).await).unwrap();
        assert_eq!(reply, DeviceReply::text("echo: halo"));

        session.close();
        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_binary_frame_is_transcribed_then_answered() {
        let (session, _) = new_session(quick_settings());
        let (transport, mut peer) = memory_transport();
        let handle = session.start(transport).unwrap();

        peer.send(Frame::Binary(vec![0; 64])).await;
        let reply: DeviceReply = serde_json::from_str(&next_text(&mut peer).await).unwrap();
        assert_eq!(reply.text, "echo: dari suara");

        session.close();
        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_transcription_failure_drops_only_that_frame() {
        let store = Arc::new(MemoryHistoryStore::default());
        let services = test_services(store, Arc::new(StubTranscriber::failing()));
        let session = Session::new(SessionIdentity::new(7, "doll-1", "1.0"), quick_settings(), services);
        let (transport, mut peer) = memory_transport();
        let handle = session.start(transport).unwrap();

        peer.send(Frame::Binary(vec![1; 32])).await;
        peer.send(Frame::Text("still here".to_string())).await;

        let reply: DeviceReply = serde_json::from_str(&next_text(&mut peer).await).unwrap();
        assert_eq!(reply.text, "echo: still here");
        assert!(!session.is_closed());

        session.close();
        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_disconnect_closes_and_saves_history() {
        let (session, store) = new_session(quick_settings());
        let (transport, mut peer) = memory_transport();
        let handle = session.start(transport).unwrap();

        peer.send(Frame::Text("halo".to_string())).await;
        next_text(&mut peer).await;
        peer.disconnect();

        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(store.get(7).map(|history| history.len()), Some(2));
    }

    #[tokio::test]
    async fn test_close_frame_from_device_ends_session() {
        let (session, _) = new_session(quick_settings());
        let (transport, mut peer) = memory_transport();
        let handle = session.start(transport).unwrap();

        peer.send(Frame::Close).await;
        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
        assert!(session.is_closed());
        assert!(peer.was_closed());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_session() {
        let mut settings = quick_settings();
        settings.max_message_size = 8;
        let (session, _) = new_session(settings);
        let (transport, mut peer) = memory_transport();
        let handle = session.start(transport).unwrap();

        peer.send(Frame::Text("this is far too long".to_string())).await;
        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_quiet_device_gets_pinged() {
        let mut settings = quick_settings();
        settings.ping_period = Duration::from_millis(20);
        let (session, _) = new_session(settings);
        let (transport, mut peer) = memory_transport();
        let handle = session.start(transport).unwrap();

        let frame = timeout(Duration::from_secs(2), peer.recv()).await.unwrap();
        assert!(matches!(frame, Some(Frame::Ping(_))));

        session.close();
        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_device_hits_read_deadline() {
        let mut settings = quick_settings();
        settings.pong_wait = Duration::from_millis(50);
        let (session, _) = new_session(settings);
        let (transport, _peer) = memory_transport();
        let handle = session.start(transport).unwrap();

        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_queued_sends_are_written_in_order() {
        let (session, _) = new_session(quick_settings());
        for text in ["a", "b", "c"] {
            session.send(text.to_string()).unwrap();
        }

        let (transport, mut peer) = memory_transport();
        let handle = session.start(transport).unwrap();
        for text in ["a", "b", "c"] {
            assert_eq!(next_text(&mut peer).await, text);
        }

        session.close();
        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
        assert!(peer.was_closed());
    }

    #[tokio::test]
    async fn test_write_error_closes_session() {
        let (session, _) = new_session(quick_settings());
        let (transport, mut peer) = memory_transport();
        let handle = session.start(transport).unwrap();

        peer.stop_receiving();
        session.send("nobody listening".to_string()).unwrap();

        timeout(Duration::from_secs(2), handle.join()).await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_unqueueable_keepalive_closes_session() {
        let mut settings = quick_settings();
        settings.ping_period = Duration::from_millis(20);
        settings.write_wait = Duration::from_secs(60);
        let (session, _) = new_session(settings);
        let (transport, _device) = stalled_transport();
        let _handle = session.start(transport).unwrap();

        // The writer never finishes the first ping, so later ones back up.
        for _ in 0..200 {
            if session.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.is_closed());
    }
}
