//! In-memory doubles shared by the unit tests.

use crate::conversation::{ChatMessage, ChatSession, ConversationOrchestrator, HistoryStore, Llm};
use crate::error::GatewayError;
use crate::session::SessionServices;
use crate::transcription::Transcriber;
use crate::transport::{Frame, FrameReader, FrameWriter, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Channel-backed transport. The test drives the device side through `MemoryPeer`.
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

pub struct MemoryPeer {
    to_session: Option<mpsc::UnboundedSender<Frame>>,
    from_session: mpsc::UnboundedReceiver<Frame>,
    closed: Arc<AtomicBool>,
}

pub fn memory_transport() -> (MemoryTransport, MemoryPeer) {
    let (to_session, inbound) = mpsc::unbounded_channel();
    let (outbound, from_session) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MemoryTransport {
            inbound,
            outbound,
            closed: closed.clone(),
        },
        MemoryPeer {
            to_session: Some(to_session),
            from_session,
            closed,
        },
    )
}

impl MemoryPeer {
    pub async fn send(&self, frame: Frame) {
        if let Some(tx) = &self.to_session {
            let _ = tx.send(frame);
        }
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_session.recv().await
    }

    /// Simulate the device dropping the connection.
    pub fn disconnect(&mut self) {
        self.to_session = None;
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting frames from the session. Its next write fails.
    pub fn stop_receiving(&mut self) {
        self.from_session.close();
    }
}

/// A transport whose writes never complete. The returned sender feeds the reader.
pub fn stalled_transport() -> (StalledTransport, mpsc::UnboundedSender<Frame>) {
    let (to_session, inbound) = mpsc::unbounded_channel();
    (StalledTransport { inbound }, to_session)
}

pub struct StalledTransport {
    inbound: mpsc::UnboundedReceiver<Frame>,
}

impl Transport for StalledTransport {
    fn split(self) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        (
            Box::new(MemoryReader {
                inbound: self.inbound,
                deadline: None,
            }),
            Box::new(StalledWriter),
        )
    }
}

struct StalledWriter;

#[async_trait]
impl FrameWriter for StalledWriter {
    async fn send(&mut self, _frame: Frame) -> Result<(), GatewayError> {
        std::future::pending::<Result<(), GatewayError>>().await
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn split(self) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        (
            Box::new(MemoryReader {
                inbound: self.inbound,
                deadline: None,
            }),
            Box::new(MemoryWriter {
                outbound: self.outbound,
                closed: self.closed,
            }),
        )
    }
}

struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<Frame>,
    deadline: Option<Instant>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn next_frame(&mut self) -> Option<Result<Frame, GatewayError>> {
        match self.deadline {
            Some(deadline) => match timeout_at(deadline, self.inbound.recv()).await {
                Ok(frame) => frame.map(Ok),
                Err(_) => Some(Err(GatewayError::Transport("read deadline exceeded".to_string()))),
            },
            None => self.inbound.recv().await.map(Ok),
        }
    }

    fn set_read_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }
}

struct MemoryWriter {
    outbound: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection closed".to_string()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| GatewayError::Transport("peer gone".to_string()))
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Frame::Close);
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum StubMode {
    Echo,
    FailSend,
    FailGenerate,
}

/// Replies `echo: {text}` unless configured to fail.
pub struct StubLlm {
    mode: StubMode,
}

impl StubLlm {
    pub fn echo() -> Self {
        Self { mode: StubMode::Echo }
    }

    pub fn failing_send() -> Self {
        Self { mode: StubMode::FailSend }
    }

    pub fn failing_generate() -> Self {
        Self {
            mode: StubMode::FailGenerate,
        }
    }
}

#[async_trait]
impl Llm for StubLlm {
    async fn generate_chat(&self, history: Vec<ChatMessage>) -> Result<Box<dyn ChatSession>, GatewayError> {
        if let StubMode::FailGenerate = self.mode {
            return Err(GatewayError::Upstream("model unavailable".to_string()));
        }
        Ok(Box::new(StubChat {
            mode: self.mode,
            history,
        }))
    }
}

struct StubChat {
    mode: StubMode,
    history: Vec<ChatMessage>,
}

#[async_trait]
impl ChatSession for StubChat {
    async fn send_message(&mut self, text: &str) -> Result<String, GatewayError> {
        if let StubMode::FailSend = self.mode {
            return Err(GatewayError::Upstream("quota exceeded".to_string()));
        }
        let reply = format!("echo: {}", text);
        self.history.push(ChatMessage::user(text));
        self.history.push(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }

    fn history(&self) -> Result<Vec<ChatMessage>, GatewayError> {
        Ok(self.history.clone())
    }
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    saved: Mutex<HashMap<u64, Vec<ChatMessage>>>,
    fail_load: bool,
}

impl MemoryHistoryStore {
    pub fn failing_load() -> Self {
        Self {
            saved: Mutex::new(HashMap::new()),
            fail_load: true,
        }
    }

    pub fn get(&self, user_id: u64) -> Option<Vec<ChatMessage>> {
        self.saved.lock().unwrap().get(&user_id).cloned()
    }

    pub fn put(&self, user_id: u64, messages: Vec<ChatMessage>) {
        self.saved.lock().unwrap().insert(user_id, messages);
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load(&self, user_id: u64) -> Result<Vec<ChatMessage>, GatewayError> {
        if self.fail_load {
            return Err(GatewayError::Upstream("disk on fire".to_string()));
        }
        self.get(user_id)
            .ok_or_else(|| GatewayError::NotFound(format!("history for user {}", user_id)))
    }

    async fn save(&self, user_id: u64, messages: &[ChatMessage]) -> Result<(), GatewayError> {
        self.put(user_id, messages.to_vec());
        Ok(())
    }
}

/// Returns a fixed transcript (or a fixed failure) for any audio.
pub struct StubTranscriber {
    result: Result<String, GatewayError>,
}

impl StubTranscriber {
    pub fn text(text: &str) -> Self {
        Self {
            result: Ok(text.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self {
            result: Err(GatewayError::Upstream("speech service down".to_string())),
        }
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(&self, _audio: Vec<u8>) -> Result<String, GatewayError> {
        self.result.clone()
    }
}

pub fn test_services(store: Arc<MemoryHistoryStore>, transcriber: Arc<dyn Transcriber>) -> SessionServices {
    SessionServices {
        orchestrator: ConversationOrchestrator::new(Arc::new(StubLlm::echo()), store),
        transcriber,
    }
}
