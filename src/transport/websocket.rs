use super::{Frame, FrameReader, FrameWriter, Transport};
use crate::error::GatewayError;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// A device connection carried over an accepted WebSocket.
pub struct WebSocketTransport<S> {
    inner: WebSocketStream<S>,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }

    /// Refuse the connection with a policy-violation close frame.
    pub async fn reject(mut self, reason: &str) -> Result<(), GatewayError> {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: reason.to_string().into(),
        };
        match self.inner.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (sink, stream) = self.inner.split();
        (
            Box::new(WebSocketReader { stream, deadline: None }),
            Box::new(WebSocketWriter { sink }),
        )
    }
}

struct WebSocketReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    deadline: Option<Instant>,
}

#[async_trait]
impl<S> FrameReader for WebSocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<Frame, GatewayError>> {
        loop {
            let next = match self.deadline {
                Some(deadline) => match timeout_at(deadline, self.stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        return Some(Err(GatewayError::Transport(
                            "read deadline exceeded".to_string(),
                        )))
                    }
                },
                None => self.stream.next().await,
            };

            let message = match next? {
                Ok(message) => message,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            };

            let frame = match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(data) => Frame::Binary(data),
                Message::Ping(data) => Frame::Ping(data),
                Message::Pong(data) => Frame::Pong(data),
                Message::Close(_) => Frame::Close,
                // Raw frames only surface when writing; skip them on read.
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    fn set_read_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }
}

struct WebSocketWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameWriter for WebSocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        };
        self.sink.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    async fn connected_pair() -> (WebSocketTransport<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let (server, client) = tokio::join!(
            tokio_tungstenite::accept_async(server_io),
            tokio_tungstenite::client_async("ws://localhost/ws", client_io),
        );
        let server = server.expect("server handshake");
        let (client, _response) = client.expect("client handshake");
        (WebSocketTransport::new(server), client)
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (transport, mut client) = connected_pair().await;
        let (mut reader, mut writer) = transport.split();

        client.send(Message::Text("halo".to_string())).await.unwrap();
        client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

        assert_eq!(reader.next_frame().await.unwrap().unwrap(), Frame::Text("halo".to_string()));
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), Frame::Binary(vec![1, 2, 3]));

        writer.send(Frame::Text("reply".to_string())).await.unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => assert_eq!(text, "reply"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_deadline_expires() {
        let (transport, _client) = connected_pair().await;
        let (mut reader, _writer) = transport.split();

        reader.set_read_deadline(Instant::now() + Duration::from_millis(20));
        let result = reader.next_frame().await.unwrap();
        assert!(matches!(result, Err(GatewayError::Transport(_))));
    }

    #[tokio::test]
    async fn test_reject_sends_policy_close() {
        let (transport, mut client) = connected_pair().await;
        let rejecting = tokio::spawn(transport.reject("device already connected"));

        match client.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason, "device already connected");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // Let the closing handshake finish so reject() returns.
        drop(client);
        let _ = rejecting.await;
    }
}
