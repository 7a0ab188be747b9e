//! WebSocket transport to the relay

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tpot_auth::CredentialSigner;
use tracing::{debug, error, trace};

use crate::config::{TunnelConfig, UrlComponents};
use crate::error::{ConnectFailure, TunnelError};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// Capacity of the outbound frame queue shared by all conversations
pub(crate) const OUTBOUND_QUEUE: usize = 256;

/// Open the upgrade connection, signing it if an auth key is configured
pub(crate) async fn open(config: &TunnelConfig) -> Result<WsStream, TunnelError> {
    // Ignore the error: a provider may already be installed by the host application
    let _ = rustls::crypto::ring::default_provider().install_default();

    let url = config.connection_url()?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TunnelError::ConfigError(format!("Invalid server URL: {}", e)))?;

    if let Some(key) = &config.auth_key {
        let value = CredentialSigner::new(key.as_str()).authorization_header();
        let value = HeaderValue::from_str(&value)
            .map_err(|e| TunnelError::ConfigError(format!("Invalid authorization header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    debug!("Connecting to WebSocket: {}", url);

    let (ws_stream, response) = connect_async(request)
        .await
        .map_err(|e| classify(e, &config.server))?;

    debug!("WebSocket connected ({})", response.status());
    Ok(ws_stream)
}

fn classify(err: WsError, server: &UrlComponents) -> ConnectFailure {
    match err {
        WsError::Http(response) => ConnectFailure::from_status(response.status().as_u16()),
        WsError::Io(e) => {
            debug!("Connection to {} failed: {}", server, e);
            ConnectFailure::Unreachable(server.host_with_port.clone())
        }
        other => ConnectFailure::Handshake(other.to_string()),
    }
}

/// Spawn the task that owns the WebSocket sink.
///
/// Frames queued on `frames` are written one message each, in order. A ping
/// goes out every `keepalive`. Firing `close` sends a close frame and ends
/// the task.
pub(crate) fn spawn_writer(
    sink: WsSink,
    frames: mpsc::Receiver<Bytes>,
    close: oneshot::Receiver<()>,
    keepalive: Duration,
) -> JoinHandle<()> {
    tokio::spawn(writer_task(sink, frames, close, keepalive))
}

async fn writer_task(
    mut sink: WsSink,
    mut frames: mpsc::Receiver<Bytes>,
    mut close: oneshot::Receiver<()>,
    keepalive: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + keepalive, keepalive);

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                trace!("Sending {} byte frame", frame.len());
                if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
                    error!("WebSocket send error: {}", e);
                    break;
                }
            }
            _ = ping.tick() => {
                trace!("Sending keepalive ping");
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    error!("WebSocket ping error: {}", e);
                    break;
                }
            }
            _ = &mut close => break,
        }
    }

    debug!("WebSocket writer task ended");
    let _ = sink.close().await;
}
