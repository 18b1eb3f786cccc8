//! # Connection Hub
//!
//! Registry of live device sessions, keyed by device id.
//!
//! The map is owned by one task. Every operation is a command sent to that task
//! with a oneshot reply, so register/unregister never race each other and no
//! lock is needed. The only thing shared is the `Hub` handle, which is a cheap
//! `Clone` around the command sender.
//!
//! ## Guarantees:
//! - At most one live session per device id. A closed session still in the map
//!   does not count and is replaced by the next registration.
//! - `unregister` only removes the exact session it is given, so a late
//!   unregister from an old connection cannot evict its replacement.
//! - After `shutdown` every operation fails with `GatewayError::Closed` (or
//!   reports nothing connected).

use crate::error::GatewayError;
use crate::session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_QUEUE_CAPACITY: usize = 256;

enum HubCommand {
    Register {
        session: Arc<Session>,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Unregister {
        session: Arc<Session>,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        payload: String,
        reply: oneshot::Sender<usize>,
    },
    SendToDevice {
        device_id: String,
        payload: String,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Lookup {
        device_id: String,
        reply: oneshot::Sender<Option<Arc<Session>>>,
    },
    Devices {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Spawn the registry task. The handle resolves after `shutdown`.
    pub fn start() -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let task = tokio::spawn(run_registry(rx));
        (Self { commands }, task)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Result<T, GatewayError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).await.map_err(|_| GatewayError::Closed)?;
        response.await.map_err(|_| GatewayError::Closed)
    }

    pub async fn register(&self, session: Arc<Session>) -> Result<(), GatewayError> {
        self.request(|reply| HubCommand::Register { session, reply }).await?
    }

    /// Remove `session` if it is the one registered for its device, and close it.
    /// Returns whether anything was removed.
    pub async fn unregister(&self, session: &Arc<Session>) -> bool {
        let session = session.clone();
        self.request(|reply| HubCommand::Unregister { session, reply })
            .await
            .unwrap_or(false)
    }

    /// Best-effort send to every live session. Returns how many accepted it.
    pub async fn broadcast(&self, payload: String) -> Result<usize, GatewayError> {
        self.request(|reply| HubCommand::Broadcast { payload, reply }).await
    }

    pub async fn send_to_device(&self, device_id: &str, payload: String) -> Result<(), GatewayError> {
        let device_id = device_id.to_string();
        self.request(|reply| HubCommand::SendToDevice {
            device_id,
            payload,
            reply,
        })
        .await?
    }

    pub async fn session_for_device(&self, device_id: &str) -> Option<Arc<Session>> {
        let device_id = device_id.to_string();
        self.request(|reply| HubCommand::Lookup { device_id, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn is_device_connected(&self, device_id: &str) -> bool {
        self.session_for_device(device_id).await.is_some()
    }

    pub async fn connected_devices(&self) -> Vec<String> {
        self.request(|reply| HubCommand::Devices { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn client_count(&self) -> usize {
        self.connected_devices().await.len()
    }

    /// Close every session and stop the registry task. Safe to call twice.
    pub async fn shutdown(&self) {
        if self.request(|reply| HubCommand::Shutdown { reply }).await.is_err() {
            debug!("Hub already stopped");
        }
    }
}

fn live<'a>(sessions: &'a HashMap<String, Arc<Session>>, device_id: &str) -> Option<&'a Arc<Session>> {
    sessions.get(device_id).filter(|session| !session.is_closed())
}

async fn run_registry(mut commands: mpsc::Receiver<HubCommand>) {
    let mut sessions: HashMap<String, Arc<Session>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            HubCommand::Register { session, reply } => {
                let device_id = session.device_id().to_string();
                let result = if live(&sessions, &device_id).is_some() {
                    warn!(device_id = %device_id, "Rejected duplicate connection");
                    Err(GatewayError::DuplicateConnection(device_id))
                } else {
                    sessions.insert(device_id.clone(), session);
                    info!(device_id = %device_id, clients = sessions.len(), "Device registered");
                    Ok(())
                };
                let _ = reply.send(result);
            }
            HubCommand::Unregister { session, reply } => {
                let device_id = session.device_id();
                let same = sessions
                    .get(device_id)
                    .is_some_and(|registered| Arc::ptr_eq(registered, &session));
                if same {
                    sessions.remove(device_id);
                    session.close();
                    info!(device_id = %device_id, clients = sessions.len(), "Device unregistered");
                }
                let _ = reply.send(same);
            }
            HubCommand::Broadcast { payload, reply } => {
                let mut delivered = 0;
                for session in sessions.values().filter(|session| !session.is_closed()) {
                    match session.send(payload.clone()) {
                        Ok(()) => delivered += 1,
                        Err(e) => debug!(device_id = %session.device_id(), error = %e, "Broadcast skipped device"),
                    }
                }
                let _ = reply.send(delivered);
            }
            HubCommand::SendToDevice {
                device_id,
                payload,
                reply,
            } => {
                let result = match live(&sessions, &device_id) {
                    Some(session) => session.send(payload),
                    None => Err(GatewayError::NotFound(format!("device {} is not connected", device_id))),
                };
                let _ = reply.send(result);
            }
            HubCommand::Lookup { device_id, reply } => {
                let _ = reply.send(live(&sessions, &device_id).cloned());
            }
            HubCommand::Devices { reply } => {
                let mut devices: Vec<String> = sessions
                    .iter()
                    .filter(|(_, session)| !session.is_closed())
                    .map(|(device_id, _)| device_id.clone())
                    .collect();
                devices.sort();
                let _ = reply.send(devices);
            }
            HubCommand::Shutdown { reply } => {
                for session in sessions.values() {
                    session.close();
                }
                info!(closed = sessions.len(), "Hub shut down");
                sessions.clear();
                let _ = reply.send(());
                break;
            }
        }
    }
}
