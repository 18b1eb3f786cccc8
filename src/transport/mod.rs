//! Device transport abstraction.
//!
//! A session never talks to a socket directly. It asks its transport to split
//! into a reader half (owned by the read loop) and a writer half (owned by the
//! write loop), so exactly one task ever writes to the device.

pub mod websocket;

use crate::error::GatewayError;
use async_trait::async_trait;
use tokio::time::Instant;

pub use websocket::WebSocketTransport;

/// One unit of traffic on a device connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    /// Payload size in bytes, used for the inbound size limit.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data.len(),
            Frame::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait FrameReader: Send {
    /// Next inbound frame. `None` means the peer went away cleanly.
    /// A read that outlives the deadline yields `Err(GatewayError::Transport)`.
    async fn next_frame(&mut self) -> Option<Result<Frame, GatewayError>>;

    fn set_read_deadline(&mut self, deadline: Instant);
}

#[async_trait]
pub trait FrameWriter: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError>;

    /// Send a close frame (best effort) and shut the write side down.
    async fn close(&mut self) -> Result<(), GatewayError>;
}

pub trait Transport: Send + 'static {
    fn split(self) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>);
}
