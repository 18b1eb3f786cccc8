use super::{DeviceReply, Session};
use crate::error::GatewayError;
use crate::transport::{Frame, FrameReader, FrameWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Device frames in. Exits on close, error, oversize frame or read deadline.
pub(super) async fn read_loop(session: Arc<Session>, mut reader: Box<dyn FrameReader>, ping_tx: mpsc::Sender<()>) {
    let pong_wait = session.settings.pong_wait;
    let max_message_size = session.settings.max_message_size;

    loop {
        reader.set_read_deadline(Instant::now() + pong_wait);

        let next = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            next = reader.next_frame() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "Device read failed");
                break;
            }
            None => {
                debug!("Device stream ended");
                break;
            }
        };

        if frame.len() > max_message_size {
            warn!(size = frame.len(), limit = max_message_size, "Frame exceeds message size limit");
            break;
        }

        match frame {
            Frame::Text(text) => {
                if text.trim().is_empty() {
                    continue;
                }
                info!(length = text.len(), "Received text from device");
                let _ = session.forward_inbound(text);
            }
            Frame::Binary(audio) => {
                // Runs to completion even if the session is cancelled meanwhile.
                match session.services.transcriber.transcribe(audio).await {
                    Ok(text) if !text.trim().is_empty() => {
                        info!(length = text.len(), "Transcribed device audio");
                        let _ = session.forward_inbound(text);
                    }
                    Ok(_) => debug!("Transcription was empty"),
                    Err(e) => warn!(error = %e, "Transcription failed, audio frame dropped"),
                }
            }
            Frame::Ping(_) => {
                let _ = ping_tx.try_send(());
            }
            Frame::Pong(_) => debug!("Pong received"),
            Frame::Close => {
                debug!("Device sent close frame");
                break;
            }
        }
    }

    session.close();
}

async fn write_frame(writer: &mut Box<dyn FrameWriter>, frame: Frame, write_wait: Duration) -> Result<(), GatewayError> {
    match timeout(write_wait, writer.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Transport("write deadline exceeded".to_string())),
    }
}

/// The single writer. Drains queued payloads and ping requests, then closes the
/// connection when the session ends.
pub(super) async fn write_loop(
    session: Arc<Session>,
    mut writer: Box<dyn FrameWriter>,
    mut outbound_rx: mpsc::Receiver<String>,
    mut probe_rx: mpsc::Receiver<()>,
) {
    let write_wait = session.settings.write_wait;

    loop {
        let result = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            Some(()) = probe_rx.recv() => write_frame(&mut writer, Frame::Ping(Vec::new()), write_wait).await,
            message = outbound_rx.recv() => match message {
                Some(text) => write_frame(&mut writer, Frame::Text(text), write_wait).await,
                None => break,
            },
        };

        if let Err(e) = result {
            warn!(error = %e, "Device write failed");
            break;
        }
    }

    match timeout(write_wait, writer.close()).await {
        Ok(Ok(())) => debug!("Connection closed"),
        Ok(Err(e)) => debug!(error = %e, "Close frame not delivered"),
        Err(_) => debug!("Close frame timed out"),
    }

    session.close();
    session.mark_closed();
}

/// Requests a ping whenever the device has been quiet for a full period.
pub(super) async fn keepalive_loop(session: Arc<Session>, mut ping_rx: mpsc::Receiver<()>, probe_tx: mpsc::Sender<()>) {
    let ping_period = session.settings.ping_period;

    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            Some(()) = ping_rx.recv() => continue,
            _ = tokio::time::sleep(ping_period) => {
                if let Err(e) = probe_tx.try_send(()) {
                    warn!(error = %e, "Could not queue keepalive ping");
                    session.close();
                    break;
                }
                debug!("Keepalive ping queued");
            }
        }
    }
}

/// Conversation replies out, as `DeviceReply` JSON.
pub(super) async fn relay_loop(session: Arc<Session>, mut reply_rx: mpsc::Receiver<String>) {
    loop {
        let reply = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            reply = reply_rx.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
        };

        let payload = match DeviceReply::text(reply).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode reply");
                continue;
            }
        };

        match session.send(payload) {
            Ok(()) => {}
            Err(GatewayError::Closed) => break,
            Err(e) => warn!(error = %e, "Reply not delivered"),
        }
    }
}
