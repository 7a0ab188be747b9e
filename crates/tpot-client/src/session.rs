//! Tunnel session: the one persistent connection to the relay.
//!
//! [`TunnelConnector::connect`] opens the WebSocket and waits for the relay's
//! greeting. [`TunnelSession::run`] then reads frames until the connection is
//! lost, opening and feeding conversations as the relay asks. There is no
//! reconnection: losing the connection ends the session.

use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tpot_proto::{
    ControlMessage, ConversationFrame, ConversationId, ConversationMessage, Frame, Greeting,
    NewConversation,
};
use tracing::{debug, info, trace, warn};

use crate::config::TunnelConfig;
use crate::conversation::{self, ConversationEnded, ConversationEvent, ConversationHandle};
use crate::error::{ConnectFailure, TunnelError};
use crate::transport::{self, WsSource, OUTBOUND_QUEUE};

/// How long the writer gets to send a close frame on shutdown
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Establishes a tunnel session
pub struct TunnelConnector {
    config: TunnelConfig,
}

impl TunnelConnector {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Connect to the relay and wait for its greeting
    pub async fn connect(self) -> Result<TunnelSession, TunnelError> {
        let config = Arc::new(self.config);
        info!("Connecting to TPoT server {}", config.server);

        let ws_stream = transport::open(&config).await?;
        let (sink, mut source) = ws_stream.split();

        let greeting = wait_for_greeting(&mut source).await?;
        let tunnel_url = config.tunnel_url(&greeting.subdomain);
        info!("✅ Tunnel ready at {}", tunnel_url);

        let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (close_tx, close_rx) = oneshot::channel();
        let writer = transport::spawn_writer(sink, frames_rx, close_rx, config.keepalive_interval);

        Ok(TunnelSession {
            subdomain: greeting.subdomain,
            tunnel_url,
            source,
            dispatcher: Dispatcher::new(config, frames_tx),
            writer,
            close_tx,
        })
    }
}

async fn wait_for_greeting(source: &mut WsSource) -> Result<Greeting, TunnelError> {
    loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(ConnectFailure::Handshake(e.to_string()).into()),
            None => {
                return Err(ConnectFailure::Handshake(
                    "connection closed before the server greeting".to_string(),
                )
                .into())
            }
        };

        match message {
            Message::Binary(data) => {
                return match Frame::decode(Bytes::from(data))? {
                    Frame::Control(ControlMessage::Greeting(greeting)) => {
                        debug!("Received greeting, subdomain {}", greeting.subdomain);
                        Ok(greeting)
                    }
                    other => Err(TunnelError::ProtocolError(format!(
                        "Expected a greeting, got {}",
                        describe(&other)
                    ))),
                };
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            Message::Text(_) => {
                return Err(TunnelError::ProtocolError(
                    "Unexpected text message before greeting".to_string(),
                ))
            }
            Message::Close(_) => {
                return Err(ConnectFailure::Handshake(
                    "server closed the connection before greeting".to_string(),
                )
                .into())
            }
        }
    }
}

fn describe(frame: &Frame) -> String {
    match frame {
        Frame::Control(ControlMessage::Greeting(_)) => "a greeting".to_string(),
        Frame::Control(ControlMessage::NewConversation(convo)) => {
            format!("a new {} conversation {}", convo.kind.as_str(), convo.id)
        }
        Frame::Conversation(frame) => format!("a frame for conversation {}", frame.id),
    }
}

/// An established tunnel
pub struct TunnelSession {
    subdomain: String,
    tunnel_url: String,
    source: WsSource,
    dispatcher: Dispatcher,
    writer: JoinHandle<()>,
    close_tx: oneshot::Sender<()>,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("subdomain", &self.subdomain)
            .field("tunnel_url", &self.tunnel_url)
            .field("conversations", &self.dispatcher.conversations.len())
            .finish()
    }
}

impl TunnelSession {
    /// Public URL of the tunnel
    pub fn tunnel_url(&self) -> &str {
        &self.tunnel_url
    }

    /// Subdomain assigned by the relay
    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// Serve the tunnel until the connection fails. Never returns `Ok`.
    pub async fn run(self) -> Result<(), TunnelError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve the tunnel until the connection fails or `shutdown` resolves.
    /// Returns `Ok` only on shutdown.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), TunnelError>
    where
        F: Future<Output = ()>,
    {
        let TunnelSession {
            mut source,
            mut dispatcher,
            writer,
            close_tx,
            ..
        } = self;
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                message = source.next() => {
                    if let Err(e) = dispatcher.handle_message(message) {
                        break Err(e);
                    }
                }
                Some(ended) = dispatcher.ended_rx.recv() => dispatcher.reap(ended),
                _ = &mut shutdown => {
                    info!("Shutting down tunnel");
                    break Ok(());
                }
            }
        };

        let _ = close_tx.send(());
        if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
            debug!("WebSocket writer did not finish closing in time");
        }

        result
    }
}

type WsMessage = Option<Result<Message, tokio_tungstenite::tungstenite::Error>>;

/// Owns the conversation registry. Only the session loop touches it.
struct Dispatcher {
    config: Arc<TunnelConfig>,
    frames: mpsc::Sender<Bytes>,
    conversations: HashMap<ConversationId, ConversationHandle>,
    ended_tx: mpsc::UnboundedSender<ConversationEnded>,
    ended_rx: mpsc::UnboundedReceiver<ConversationEnded>,
    next_serial: u64,
}

impl Dispatcher {
    fn new(config: Arc<TunnelConfig>, frames: mpsc::Sender<Bytes>) -> Self {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        Self {
            config,
            frames,
            conversations: HashMap::new(),
            ended_tx,
            ended_rx,
            next_serial: 0,
        }
    }

    fn handle_message(&mut self, message: WsMessage) -> Result<(), TunnelError> {
        match message {
            Some(Ok(Message::Binary(data))) => self.handle_frame(Frame::decode(Bytes::from(data))?),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => Ok(()),
            Some(Ok(Message::Text(text))) => Err(TunnelError::ProtocolError(format!(
                "Unexpected text message ({} bytes)",
                text.len()
            ))),
            Some(Ok(Message::Close(frame))) => Err(TunnelError::Disconnected(match frame {
                Some(frame) if !frame.reason.is_empty() => {
                    format!("server closed the connection: {}", frame.reason)
                }
                _ => "server closed the connection".to_string(),
            })),
            Some(Err(e)) => Err(TunnelError::Disconnected(e.to_string())),
            None => Err(TunnelError::Disconnected("connection lost".to_string())),
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
        match frame {
            Frame::Control(ControlMessage::NewConversation(request)) => self.open(request),
            Frame::Control(ControlMessage::Greeting(greeting)) => {
                Err(TunnelError::ProtocolError(format!(
                    "Unexpected second greeting (subdomain {})",
                    greeting.subdomain
                )))
            }
            Frame::Conversation(frame) => self.route(frame),
        }
    }

    fn open(&mut self, request: NewConversation) -> Result<(), TunnelError> {
        // An ended conversation may free its id for this request
        while let Ok(ended) = self.ended_rx.try_recv() {
            self.reap(ended);
        }

        if let Some(existing) = self.conversations.get(&request.id) {
            if !existing.is_released() {
                return Err(TunnelError::ProtocolError(format!(
                    "Server opened conversation {} while it is still open",
                    request.id
                )));
            }
            // The old conversation has sent its last frame; let it drain upstream on its own
            debug!(
                "Conversation {} reopened while the previous one drains upstream",
                request.id
            );
            self.conversations.remove(&request.id);
        }

        let id = request.id;
        let serial = self.next_serial;
        self.next_serial += 1;

        let handle = conversation::spawn(
            request,
            serial,
            self.config.clone(),
            self.frames.clone(),
            self.ended_tx.clone(),
        );
        self.conversations.insert(id, handle);

        debug!(
            "Opened conversation {} ({} open)",
            id,
            self.conversations.len()
        );
        Ok(())
    }

    fn route(&mut self, frame: ConversationFrame) -> Result<(), TunnelError> {
        let event = match frame.message {
            ConversationMessage::Data(data) => ConversationEvent::Data(data),
            ConversationMessage::Pause => ConversationEvent::Pause,
            ConversationMessage::Resume => ConversationEvent::Resume,
            ConversationMessage::Closed => ConversationEvent::Closed,
            ConversationMessage::NoConnect => {
                return Err(TunnelError::ProtocolError(format!(
                    "Server sent NOCONNECT for conversation {}",
                    frame.id
                )))
            }
        };

        match self.conversations.get(&frame.id) {
            Some(handle) => {
                if !handle.deliver(event) {
                    trace!("Conversation {} already finished, dropping frame", frame.id);
                }
            }
            None => warn!("Ignoring frame for unknown conversation {}", frame.id),
        }
        Ok(())
    }

    /// Remove an ended conversation, unless its id was already reused
    fn reap(&mut self, ended: ConversationEnded) {
        let current = self
            .conversations
            .get(&ended.id)
            .is_some_and(|handle| handle.serial == ended.serial);

        if current {
            self.conversations.remove(&ended.id);
            debug!(
                "Conversation {} ended ({} open)",
                ended.id,
                self.conversations.len()
            );
        }
    }
}
