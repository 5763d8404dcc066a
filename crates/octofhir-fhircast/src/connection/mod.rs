//! FHIRcast subscriber connection.
//!
//! A [`FhircastConnection`] owns one WebSocket session for one completed
//! subscription. It is an explicit state machine driven by transport
//! notifications:
//!
//! ```text
//!   Idle ──open──▶ Open ──close──▶ Closed
//!     └──────────────close─────────────┘
//! ```
//!
//! - `open` emits `connect` once.
//! - Every event message received while `Open` emits `message` and is then
//!   acknowledged with `{ id, timestamp }` over the same transport. Messages
//!   that do not decode into a [`MessagePayload`] are still acknowledged and
//!   are reported through `on_frame_error` instead of `message`.
//! - Subscription confirmations (frames carrying `hub.topic`) are discarded.
//! - `close` emits `disconnect` once, whatever triggered it.
//!
//! `disconnect()` only asks the transport to close; the terminal transition
//! always goes through [`FhircastConnection::handle_close`].
//!
//! The `handle_*` methods are serialized per connection: a close reported on
//! one thread waits until a frame being handled on another has been delivered
//! and acknowledged. Listeners therefore must not call `handle_*` themselves.

pub mod listeners;
pub mod transport;
pub mod websocket;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{FhircastError, FhircastResult};
use crate::payload::{AckFrame, MessagePayload};
use crate::subscription::SubscriptionRequest;

pub use listeners::{ConnectionListeners, DisconnectReason, FrameError, ListenerId};
pub use transport::Transport;
pub use websocket::{
    OutboundFrame, WebSocketConnection, WebSocketDriver, WebSocketTransport, connect_websocket,
};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Event message delivered to listeners; carries the acknowledged id.
    Delivered(String),
    /// Message acknowledged but not decodable as a FHIRcast event, for
    /// example an event name this crate does not know. Reported through
    /// `on_frame_error`; carries the acknowledged id.
    Unrecognized(String),
    /// Subscription confirmation echoed by the hub, discarded.
    Confirmation,
    /// Frame is not JSON; reported through `on_frame_error`, not acknowledged.
    Malformed,
    /// Connection was not `Open`.
    Ignored,
}

/// A subscriber's session with a FHIRcast hub.
pub struct FhircastConnection<T: Transport> {
    request: SubscriptionRequest,
    transport: T,
    state: Mutex<ConnectionState>,
    // Held across every transition, and across delivery and ack of a frame.
    dispatch: Mutex<()>,
    listeners: ConnectionListeners,
}

impl<T: Transport> FhircastConnection<T> {
    /// Create a connection for a completed subscription request.
    ///
    /// The request is checked before `make_transport` runs, so an invalid
    /// request never touches the network.
    pub fn new<F>(request: SubscriptionRequest, make_transport: F) -> FhircastResult<Self>
    where
        F: FnOnce(&str) -> T,
    {
        let Some(endpoint) = request.endpoint.as_deref().filter(|e| !e.is_empty()) else {
            return Err(FhircastError::invalid_connection(
                "Subscription request should contain an endpoint.",
            ));
        };
        if !request.validate() {
            return Err(FhircastError::invalid_connection(
                "Subscription request failed validation.",
            ));
        }

        let transport = make_transport(endpoint);
        debug!(topic = %request.topic, endpoint, "FHIRcast connection created");

        Ok(Self {
            request,
            transport,
            state: Mutex::new(ConnectionState::Idle),
            dispatch: Mutex::new(()),
            listeners: ConnectionListeners::new(),
        })
    }

    pub fn request(&self) -> &SubscriptionRequest {
        &self.request
    }

    pub fn topic(&self) -> &str {
        &self.request.topic
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn listeners(&self) -> &ConnectionListeners {
        &self.listeners
    }

    pub fn on_connect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners.on_connect(listener)
    }

    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MessagePayload) + Send + Sync + 'static,
    {
        self.listeners.on_message(listener)
    }

    pub fn on_disconnect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DisconnectReason) + Send + Sync + 'static,
    {
        self.listeners.on_disconnect(listener)
    }

    pub fn on_frame_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&FrameError) + Send + Sync + 'static,
    {
        self.listeners.on_frame_error(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Ask the transport to close the session.
    ///
    /// `disconnect` listeners fire when the transport reports the close, so
    /// repeated calls never produce more than one notification.
    pub fn disconnect(&self) -> Result<(), T::Error> {
        if self.state() == ConnectionState::Closed {
            debug!(topic = %self.request.topic, "Disconnect requested on closed connection");
            return Ok(());
        }
        debug!(topic = %self.request.topic, "Disconnect requested");
        self.transport.close()
    }

    /// Transport `open` notification.
    pub fn handle_open(&self) {
        let _dispatch = self.dispatch.lock();
        {
            let mut state = self.state.lock();
            let current = *state;
            if current != ConnectionState::Idle {
                warn!(topic = %self.request.topic, state = %current, "Unexpected open notification");
                return;
            }
            *state = ConnectionState::Open;
        }

        info!(topic = %self.request.topic, "FHIRcast connection opened");
        self.listeners.emit_connect();
    }

    /// Transport `message` notification.
    pub fn handle_message(&self, text: &str) -> FrameOutcome {
        let _dispatch = self.dispatch.lock();
        let state = self.state();
        if state != ConnectionState::Open {
            warn!(topic = %self.request.topic, state = %state, "Dropping frame received outside of open state");
            return FrameOutcome::Ignored;
        }

        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => return self.malformed(text, format!("Invalid JSON: {e}")),
        };

        // Confirmations are recognised by `hub.topic` at the top level; event
        // messages only carry it inside `event`.
        if frame.get("hub.topic").is_some_and(|topic| !topic.is_null()) {
            debug!(topic = %self.request.topic, "Discarding subscription confirmation");
            return FrameOutcome::Confirmation;
        }

        let message_id = message_id(&frame);
        match serde_json::from_value::<MessagePayload>(frame) {
            Ok(payload) => {
                debug!(
                    topic = %self.request.topic,
                    event = %payload.event.event,
                    message_id = %message_id,
                    "Received FHIRcast event"
                );
                self.listeners.emit_message(&payload);
                self.acknowledge(&message_id);
                FrameOutcome::Delivered(message_id)
            }
            Err(e) => {
                warn!(
                    topic = %self.request.topic,
                    message_id = %message_id,
                    error = %e,
                    "Acknowledging undecodable FHIRcast message"
                );
                self.listeners.emit_frame_error(&FrameError {
                    raw: text.to_string(),
                    reason: format!("Not a FHIRcast message: {e}"),
                });
                self.acknowledge(&message_id);
                FrameOutcome::Unrecognized(message_id)
            }
        }
    }

    /// Transport `close` notification. Returns `false` if already closed.
    pub fn handle_close(&self, reason: DisconnectReason) -> bool {
        let _dispatch = self.dispatch.lock();
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
        }

        info!(topic = %self.request.topic, reason = %reason, "FHIRcast connection closed");
        self.listeners.emit_disconnect(&reason);
        true
    }

    fn acknowledge(&self, message_id: &str) {
        let ack = match AckFrame::for_message(message_id).to_json() {
            Ok(ack) => ack,
            Err(e) => {
                warn!(message_id, error = %e, "Failed to encode acknowledgment");
                return;
            }
        };

        match self.transport.send(ack) {
            Ok(()) => debug!(message_id, "Sent acknowledgment"),
            Err(e) => warn!(message_id, error = %e, "Failed to send acknowledgment"),
        }
    }

    fn malformed(&self, text: &str, reason: String) -> FrameOutcome {
        warn!(topic = %self.request.topic, reason = %reason, "Malformed FHIRcast frame");
        self.listeners.emit_frame_error(&FrameError {
            raw: text.to_string(),
            reason,
        });
        FrameOutcome::Malformed
    }
}

/// Id echoed in the acknowledgment. Non-string ids are echoed in their JSON
/// form; a frame without an id is acknowledged with an empty one.
fn message_id(frame: &Value) -> String {
    match frame.get("id") {
        Some(Value::String(id)) => id.clone(),
        None | Some(Value::Null) => String::new(),
        Some(other) => other.to_string(),
    }
}

impl<T: Transport> std::fmt::Debug for FhircastConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhircastConnection")
            .field("topic", &self.request.topic)
            .field("endpoint", &self.request.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
