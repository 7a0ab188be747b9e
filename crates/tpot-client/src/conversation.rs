//! Conversations: one tunnel stream bridged to one upstream TCP connection.
//!
//! Each conversation runs as its own task. The session feeds it tunnel events
//! through an unbounded queue and it writes encoded frames to the shared
//! tunnel writer. When both sides are closed it reports itself ended exactly
//! once.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tpot_proto::{
    ConversationFrame, ConversationId, ConversationMessage, ConversationType, NewConversation,
};
use tracing::{debug, trace, warn};

use crate::config::TunnelConfig;
use crate::http_inspector::HttpInspector;

/// Queued upstream-bound bytes above which the peer is asked to pause
pub const PAUSE_THRESHOLD: usize = 64 * 1024;

const READ_BUFFER_SIZE: usize = 8192;

/// Tunnel-side input for one conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConversationEvent {
    Data(Bytes),
    Pause,
    Resume,
    Closed,
}

/// Sent by a conversation task once it has fully closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConversationEnded {
    pub id: ConversationId,
    pub serial: u64,
}

/// Registry entry for a live conversation
#[derive(Debug)]
pub(crate) struct ConversationHandle {
    pub serial: u64,
    events: mpsc::UnboundedSender<ConversationEvent>,
    /// Set once this conversation has sent its final frame for the id
    released: Arc<AtomicBool>,
}

impl ConversationHandle {
    /// Queue an event. Returns false if the conversation task is already gone.
    pub fn deliver(&self, event: ConversationEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Whether this conversation has sent `CLOSED` or `NOCONNECT`, after
    /// which it writes nothing more under its id and the relay may reuse it
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConversationState {
    Connecting,
    Active,
    Closing,
    Ended,
}

#[derive(Debug, Error)]
enum UpstreamError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("Connecting to {0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("Upstream I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Start a conversation task for a create request from the relay
pub(crate) fn spawn(
    request: NewConversation,
    serial: u64,
    config: Arc<TunnelConfig>,
    outbound: mpsc::Sender<Bytes>,
    ended: mpsc::UnboundedSender<ConversationEnded>,
) -> ConversationHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let released = Arc::new(AtomicBool::new(false));

    if !request.initial_data.is_empty() {
        // The receiver is alive until the task below drops it
        let _ = events_tx.send(ConversationEvent::Data(request.initial_data.clone()));
    }

    let conversation = Conversation::new(
        &request,
        serial,
        config,
        outbound,
        ended,
        released.clone(),
    );
    tokio::spawn(conversation.run(events_rx));

    ConversationHandle {
        serial,
        events: events_tx,
        released,
    }
}

struct Conversation {
    id: ConversationId,
    serial: u64,
    kind: ConversationType,
    source: SocketAddrV4,
    config: Arc<TunnelConfig>,
    inspector: Option<HttpInspector>,
    outbound: mpsc::Sender<Bytes>,
    ended: mpsc::UnboundedSender<ConversationEnded>,
    released: Arc<AtomicBool>,

    state: ConversationState,
    tunnel_open: bool,
    /// Peer asked us to stop reading upstream
    reading_paused: bool,
    /// Tunnel bytes received before the upstream connected
    initial_buffer: Option<Vec<Bytes>>,
    write_queue: VecDeque<Bytes>,
    queued_bytes: usize,
    pause_sent: bool,
    /// Set once either side closes
    close_deadline: Option<Instant>,

    bytes_up: u64,
    bytes_down: u64,
}

impl Conversation {
    fn new(
        request: &NewConversation,
        serial: u64,
        config: Arc<TunnelConfig>,
        outbound: mpsc::Sender<Bytes>,
        ended: mpsc::UnboundedSender<ConversationEnded>,
        released: Arc<AtomicBool>,
    ) -> Self {
        let inspector = match request.kind {
            ConversationType::Http => {
                Some(HttpInspector::new(request.id, config.host_rewrite.clone()))
            }
        };

        Self {
            id: request.id,
            serial,
            kind: request.kind,
            source: request.source,
            config,
            inspector,
            outbound,
            ended,
            released,
            state: ConversationState::Connecting,
            tunnel_open: true,
            reading_paused: false,
            initial_buffer: Some(Vec::new()),
            write_queue: VecDeque::new(),
            queued_bytes: 0,
            pause_sent: false,
            close_deadline: None,
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ConversationEvent>) {
        debug!(
            "[{}-{}] Handling request from {}",
            self.kind.as_str(),
            self.id,
            self.source
        );

        if let Some(stream) = self.connect(&mut events).await {
            self.transition(ConversationState::Active);
            if let Err(e) = self.bridge(stream, &mut events).await {
                debug!("[{}-{}] {}", self.kind.as_str(), self.id, e);
                self.send_control(ConversationMessage::Closed).await;
            }
        }

        self.finish();
    }

    /// Dial the upstream while queueing tunnel input
    async fn connect(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<ConversationEvent>,
    ) -> Option<TcpStream> {
        let target = &self.config.target;
        let addr = format!("{}:{}", target.host, target.port);
        let timeout = self.config.connect_timeout;

        let dial = tokio::time::timeout(
            timeout,
            TcpStream::connect((target.host.clone(), target.port)),
        );
        tokio::pin!(dial);

        loop {
            tokio::select! {
                result = &mut dial => {
                    let error = match result {
                        Ok(Ok(stream)) => {
                            if let (Ok(local), Ok(peer)) = (stream.local_addr(), stream.peer_addr()) {
                                debug!(
                                    "[{}-{}] Upstream {} connected from {}",
                                    self.kind.as_str(), self.id, peer, local
                                );
                            }
                            return Some(stream);
                        }
                        Ok(Err(source)) => UpstreamError::Connect { addr, source },
                        Err(_) => UpstreamError::Timeout(addr, timeout),
                    };

                    warn!("[{}-{}] {}", self.kind.as_str(), self.id, error);
                    self.send_control(ConversationMessage::NoConnect).await;
                    self.tunnel_open = false;
                    return None;
                }

                event = events.recv() => match event {
                    Some(ConversationEvent::Data(data)) => {
                        self.accept_tunnel_data(data);
                        self.check_backpressure().await;
                    }
                    Some(ConversationEvent::Pause) => self.reading_paused = true,
                    Some(ConversationEvent::Resume) => self.reading_paused = false,
                    Some(ConversationEvent::Closed) | None => {
                        debug!(
                            "[{}-{}] Tunnel closed before upstream connected",
                            self.kind.as_str(), self.id
                        );
                        self.tunnel_open = false;
                        return None;
                    }
                },
            }
        }
    }

    /// Pump bytes both ways until both sides are closed
    async fn bridge(
        &mut self,
        stream: TcpStream,
        events: &mut mpsc::UnboundedReceiver<ConversationEvent>,
    ) -> Result<(), UpstreamError> {
        let (mut reader, mut writer) = stream.into_split();

        if let Some(initial) = self.initial_buffer.take() {
            self.write_queue.extend(initial);
        }

        let mut upstream_readable = true;
        let mut writer_shut = false;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            if !self.tunnel_open && self.write_queue.is_empty() {
                if !writer_shut {
                    writer.shutdown().await?;
                    writer_shut = true;
                }
                if !upstream_readable {
                    return Ok(());
                }
            }

            let can_read = upstream_readable && (!self.reading_paused || !self.tunnel_open);
            let front = self.write_queue.front().map_or(&[][..], |b| &b[..]);

            tokio::select! {
                event = events.recv(), if self.tunnel_open => match event {
                    Some(ConversationEvent::Data(data)) => {
                        self.accept_tunnel_data(data);
                        self.check_backpressure().await;
                    }
                    Some(ConversationEvent::Pause) => {
                        trace!("[{}-{}] Peer paused", self.kind.as_str(), self.id);
                        self.reading_paused = true;
                    }
                    Some(ConversationEvent::Resume) => {
                        trace!("[{}-{}] Peer resumed", self.kind.as_str(), self.id);
                        self.reading_paused = false;
                    }
                    Some(ConversationEvent::Closed) | None => {
                        debug!("[{}-{}] Downstream client disconnected", self.kind.as_str(), self.id);
                        self.close_tunnel_side();
                    }
                },

                result = reader.read(&mut buf), if can_read => {
                    let n = result?;
                    if n == 0 {
                        debug!("[{}-{}] Upstream disconnected", self.kind.as_str(), self.id);
                        upstream_readable = false;
                        self.send_control(ConversationMessage::Closed).await;
                        self.close_tunnel_side();
                    } else if self.tunnel_open {
                        self.bytes_down += n as u64;
                        self.send_frame(ConversationFrame::encode_data(self.id, &buf[..n])).await;
                    }
                }

                result = writer.write(front), if !self.write_queue.is_empty() => {
                    let n = result?;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }
                    self.wrote(n).await;
                }

                _ = tokio::time::sleep_until(self.close_deadline.unwrap_or_else(Instant::now)),
                    if self.close_deadline.is_some() =>
                {
                    debug!(
                        "[{}-{}] Gave up waiting for close after {:?}",
                        self.kind.as_str(), self.id, self.config.close_linger
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Route tunnel bytes through inspection into the initial buffer or the write queue
    fn accept_tunnel_data(&mut self, data: Bytes) {
        let pieces = match self.inspector.as_mut() {
            Some(inspector) => inspector.inspect(data),
            None => vec![data],
        };

        for piece in pieces {
            self.queued_bytes += piece.len();
            match self.initial_buffer.as_mut() {
                Some(initial) => initial.push(piece),
                None => self.write_queue.push_back(piece),
            }
        }
    }

    async fn wrote(&mut self, n: usize) {
        self.bytes_up += n as u64;
        self.queued_bytes -= n;

        if let Some(front) = self.write_queue.front_mut() {
            front.advance(n);
            if front.is_empty() {
                self.write_queue.pop_front();
            }
        }

        if self.write_queue.is_empty() && self.pause_sent {
            self.pause_sent = false;
            trace!("[{}-{}] Upstream drained, resuming peer", self.kind.as_str(), self.id);
            self.send_control(ConversationMessage::Resume).await;
        }
    }

    async fn check_backpressure(&mut self) {
        if self.queued_bytes > PAUSE_THRESHOLD && !self.pause_sent {
            self.pause_sent = true;
            trace!(
                "[{}-{}] {} bytes queued for upstream, pausing peer",
                self.kind.as_str(),
                self.id,
                self.queued_bytes
            );
            self.send_control(ConversationMessage::Pause).await;
        }
    }

    fn close_tunnel_side(&mut self) {
        self.tunnel_open = false;
        self.transition(ConversationState::Closing);
        let linger = self.config.close_linger;
        self.close_deadline.get_or_insert_with(|| Instant::now() + linger);
    }

    async fn send_control(&mut self, message: ConversationMessage) {
        if !self.tunnel_open {
            return;
        }
        if matches!(
            message,
            ConversationMessage::Closed | ConversationMessage::NoConnect
        ) {
            // Before the frame leaves, so a create reusing the id can't race it
            self.released.store(true, Ordering::Release);
        }
        let frame = ConversationFrame::new(self.id, message).encode();
        self.send_frame(frame).await;
    }

    async fn send_frame(&mut self, frame: Bytes) {
        if self.outbound.send(frame).await.is_err() {
            trace!("[{}-{}] Tunnel writer is gone", self.kind.as_str(), self.id);
            self.close_tunnel_side();
        }
    }

    fn transition(&mut self, next: ConversationState) {
        if self.state != next {
            trace!(
                "[{}-{}] {:?} -> {:?}",
                self.kind.as_str(),
                self.id,
                self.state,
                next
            );
            self.state = next;
        }
    }

    fn finish(mut self) {
        self.transition(ConversationState::Ended);
        debug!(
            "[{}-{}] Transmitted {} bytes upstream, {} bytes downstream",
            self.kind.as_str(),
            self.id,
            self.bytes_up,
            self.bytes_down
        );
        let _ = self.ended.send(ConversationEnded {
            id: self.id,
            serial: self.serial,
        });
    }
}
