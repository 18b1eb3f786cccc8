//! # Device Listener
//!
//! Accepts device WebSocket connections on `server.ws_port` and turns each one
//! into a registered, running `Session`.
//!
//! ## Connection steps:
//! 1. WebSocket handshake. Identity comes from the `X-User-Id`, `X-Device-Id`
//!    and `X-Device-Version` headers set by the auth layer in front of us; a
//!    request without them is refused with HTTP 400.
//! 2. Duplicate check. A device that already has a live session gets a
//!    policy-violation close frame before any session state is created.
//! 3. Register with the hub (which re-checks atomically), start the loops and
//!    wait for them.
//! 4. Unregister and update the session counters.

use crate::error::GatewayError;
use crate::session::{Session, SessionIdentity, SessionServices, SessionSettings};
use crate::state::AppState;
use crate::transport::WebSocketTransport;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

pub const DUPLICATE_CONNECTION_REASON: &str = "device already connected";
const SHUTTING_DOWN_REASON: &str = "gateway shutting down";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct DeviceGateway {
    state: AppState,
    services: SessionServices,
}

impl DeviceGateway {
    pub fn new(state: AppState, services: SessionServices) -> Self {
        Self { state, services }
    }

    /// Accept connections until `shutdown` fires, then wait for the open ones
    /// to finish. Open sessions end when the hub shuts down.
    pub async fn serve(self, listener: TcpListener, shutdown: tokio_util::sync::CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Device listener started");
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = self.clone();
                        connections.spawn(async move { gateway.handle_connection(stream, peer).await });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept device connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        info!(open = connections.len(), "Device listener stopped, waiting for open connections");
        while connections.join_next().await.is_some() {}
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let settings = SessionSettings::from_config(&self.state.get_config().session);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(settings.max_message_size);
        ws_config.max_frame_size = Some(settings.max_message_size);

        let mut identity: Option<SessionIdentity> = None;
        let capture_identity = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let headers = request.headers();
            match SessionIdentity::from_headers(|name| {
                headers
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            }) {
                Ok(found) => {
                    identity = Some(found);
                    Ok(response)
                }
                Err(reason) => {
                    let mut rejection = ErrorResponse::new(Some(reason));
                    *rejection.status_mut() = StatusCode::BAD_REQUEST;
                    Err(rejection)
                }
            }
        };

        let handshake = tokio_tungstenite::accept_hdr_async_with_config(stream, capture_identity, Some(ws_config));
        let websocket = match timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(websocket)) => websocket,
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Device handshake failed");
                return;
            }
            Err(_) => {
                warn!(peer = %peer, "Device handshake timed out");
                return;
            }
        };
        let Some(identity) = identity else {
            return;
        };
        let transport = WebSocketTransport::new(websocket);

        if self.state.hub.is_device_connected(&identity.device_id).await {
            warn!(device_id = %identity.device_id, peer = %peer, "Device already connected, rejecting");
            if let Err(e) = transport.reject(DUPLICATE_CONNECTION_REASON).await {
                debug!(error = %e, "Rejection close frame not delivered");
            }
            return;
        }

        let device_id = identity.device_id.clone();
        let session = Session::new(identity, settings, self.services.clone());
        if let Err(e) = self.state.hub.register(session.clone()).await {
            session.close();
            let reason = match e {
                GatewayError::DuplicateConnection(_) => DUPLICATE_CONNECTION_REASON,
                _ => SHUTTING_DOWN_REASON,
            };
            warn!(device_id = %device_id, error = %e, "Registration refused");
            if let Err(e) = transport.reject(reason).await {
                debug!(error = %e, "Rejection close frame not delivered");
            }
            return;
        }

        self.state.session_opened();
        info!(device_id = %device_id, peer = %peer, "Device connected");

        match session.start(transport) {
            Ok(handle) => handle.join().await,
            Err(e) => warn!(device_id = %device_id, error = %e, "Session could not start"),
        }

        self.state.hub.unregister(&session).await;
        self.state.session_closed();
        info!(device_id = %device_id, "Device disconnected");
    }
}
