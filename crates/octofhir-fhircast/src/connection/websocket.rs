//! WebSocket transport for FHIRcast connections.
//!
//! [`connect_websocket`] validates the subscription request and returns the
//! connection together with a [`WebSocketDriver`]. Register listeners on the
//! connection, then run or spawn the driver: it opens the socket, feeds
//! inbound frames to the state machine in arrival order and writes the frames
//! queued through [`WebSocketTransport`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::listeners::DisconnectReason;
use super::transport::Transport;
use super::FhircastConnection;
use crate::config::ConnectionSettings;
use crate::error::FhircastResult;
use crate::subscription::SubscriptionRequest;

/// Upper bound on waiting for the hub to answer our close frame.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame queued for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Handle for queueing frames onto a driven WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    sender: mpsc::Sender<OutboundFrame>,
}

impl Transport for WebSocketTransport {
    type Error = TrySendError<OutboundFrame>;

    fn send(&self, text: String) -> Result<(), Self::Error> {
        self.sender.try_send(OutboundFrame::Text(text))
    }

    fn close(&self) -> Result<(), Self::Error> {
        self.sender.try_send(OutboundFrame::Close)
    }
}

pub type WebSocketConnection = FhircastConnection<WebSocketTransport>;

/// Create a WebSocket-backed connection for a completed subscription request.
///
/// Fails synchronously on an invalid request; no socket is opened until the
/// returned driver runs.
pub fn connect_websocket(
    request: SubscriptionRequest,
    settings: &ConnectionSettings,
) -> FhircastResult<(Arc<WebSocketConnection>, WebSocketDriver)> {
    let (sender, outbound) = mpsc::channel(settings.outbound_buffer.max(1));
    let connection = Arc::new(FhircastConnection::new(request, |_endpoint| {
        WebSocketTransport { sender }
    })?);

    let driver = WebSocketDriver {
        connection: connection.clone(),
        outbound,
        idle_timeout: settings.idle_timeout(),
    };
    Ok((connection, driver))
}

/// Owns the socket I/O for one connection.
pub struct WebSocketDriver {
    connection: Arc<WebSocketConnection>,
    outbound: mpsc::Receiver<OutboundFrame>,
    idle_timeout: Option<Duration>,
}

impl WebSocketDriver {
    /// Run the driver on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drive the session until it closes. The connection always ends in
    /// `Closed` with exactly one `disconnect` notification.
    pub async fn run(mut self) {
        debug!(topic = %self.connection.topic(), "Starting FHIRcast WebSocket driver");
        let reason = self.drive().await;
        self.connection.handle_close(reason);
    }

    async fn drive(&mut self) -> DisconnectReason {
        let Self {
            connection,
            outbound,
            idle_timeout,
        } = self;
        let endpoint = connection.request().endpoint.clone().unwrap_or_default();

        let (socket, response) = match connect_async(endpoint.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                error!(error = %e, endpoint = %endpoint, "Failed to connect to FHIRcast hub");
                return DisconnectReason::ConnectFailed(e.to_string());
            }
        };
        info!(status = ?response.status(), endpoint = %endpoint, "Connected to FHIRcast hub");

        let (mut sink, mut stream) = socket.split();
        connection.handle_open();

        loop {
            tokio::select! {
                inbound = next_frame(&mut stream, *idle_timeout) => {
                    match inbound {
                        Err(_) => {
                            warn!(timeout = ?idle_timeout, "No frame received within idle timeout, closing");
                            let _ = sink.close().await;
                            return DisconnectReason::IdleTimeout;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            connection.handle_message(&text);
                        }
                        Ok(Some(Ok(Message::Binary(data)))) => match String::from_utf8(data) {
                            Ok(text) => {
                                connection.handle_message(&text);
                            }
                            Err(e) => debug!(error = %e, "Ignoring non UTF-8 binary frame"),
                        },
                        Ok(Some(Ok(Message::Ping(data)))) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                debug!(error = %e, "Failed to send pong");
                                return DisconnectReason::TransportError(e.to_string());
                            }
                        }
                        Ok(Some(Ok(Message::Pong(_)))) | Ok(Some(Ok(Message::Frame(_)))) => {}
                        Ok(Some(Ok(Message::Close(_)))) => {
                            debug!("Hub closed WebSocket");
                            // Flushes the queued close reply.
                            let _ = sink.close().await;
                            return DisconnectReason::PeerClosed;
                        }
                        Ok(None) => {
                            debug!("WebSocket stream ended");
                            return DisconnectReason::PeerClosed;
                        }
                        Ok(Some(Err(e))) => {
                            debug!(error = %e, "WebSocket error");
                            return DisconnectReason::TransportError(e.to_string());
                        }
                    }
                }

                frame = outbound.recv() => {
                    match frame {
                        Some(OutboundFrame::Text(text)) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                debug!(error = %e, "Failed to send frame");
                                return DisconnectReason::TransportError(e.to_string());
                            }
                        }
                        Some(OutboundFrame::Close) | None => {
                            debug!("Closing WebSocket on request");
                            let _ = sink.close().await;
                            drain_until_closed(&mut stream).await;
                            return DisconnectReason::Requested;
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for WebSocketDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketDriver")
            .field("connection", &self.connection)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

async fn next_frame<S>(
    stream: &mut S,
    idle_timeout: Option<Duration>,
) -> Result<Option<S::Item>, Elapsed>
where
    S: Stream + Unpin,
{
    match idle_timeout {
        Some(timeout) => tokio::time::timeout(timeout, stream.next()).await,
        None => Ok(stream.next().await),
    }
}

/// Wait for the hub to acknowledge our close frame.
async fn drain_until_closed<S, E>(stream: &mut S)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    let drained = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(message)) = stream.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!("Hub did not complete close handshake in time");
    }
}
