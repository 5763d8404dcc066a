//! Per-connection notification listeners.
//!
//! Each notification kind has its own subscribe operation returning a
//! [`ListenerId`]; any listener can be removed again with that id. Listeners
//! are invoked on a snapshot, outside of the registry locks, so they may
//! register or remove listeners and call `disconnect()`. A panicking listener
//! never prevents the others from running.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::payload::MessagePayload;

/// Why a connection reached the `Closed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The subscriber called `disconnect()`.
    Requested,
    /// The hub closed the socket.
    PeerClosed,
    /// No inbound frame arrived within the configured idle window.
    IdleTimeout,
    /// The socket never opened.
    ConnectFailed(String),
    /// The socket failed while open.
    TransportError(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// An inbound frame that could not be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    /// Frame text as received.
    pub raw: String,
    pub reason: String,
}

/// Handle returned by the `on_*` registration methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type ConnectListener = Arc<dyn Fn() + Send + Sync>;
pub type MessageListener = Arc<dyn Fn(&MessagePayload) + Send + Sync>;
pub type DisconnectListener = Arc<dyn Fn(&DisconnectReason) + Send + Sync>;
pub type FrameErrorListener = Arc<dyn Fn(&FrameError) + Send + Sync>;

type Slot<L> = RwLock<Vec<(ListenerId, L)>>;

/// Listener registry owned by a single connection.
#[derive(Default)]
pub struct ConnectionListeners {
    next_id: AtomicU64,
    connect: Slot<ConnectListener>,
    message: Slot<MessageListener>,
    disconnect: Slot<DisconnectListener>,
    frame_error: Slot<FrameErrorListener>,
}

impl ConnectionListeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn push<L>(&self, slot: &Slot<L>, listener: L, kind: &str) -> ListenerId {
        let id = self.next_id();
        slot.write().push((id, listener));
        debug!(listener = id.0, kind, "Registered connection listener");
        id
    }

    pub fn on_connect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener: ConnectListener = Arc::new(listener);
        self.push(&self.connect, listener, "connect")
    }

    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MessagePayload) + Send + Sync + 'static,
    {
        let listener: MessageListener = Arc::new(listener);
        self.push(&self.message, listener, "message")
    }

    pub fn on_disconnect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DisconnectReason) + Send + Sync + 'static,
    {
        let listener: DisconnectListener = Arc::new(listener);
        self.push(&self.disconnect, listener, "disconnect")
    }

    pub fn on_frame_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&FrameError) + Send + Sync + 'static,
    {
        let listener: FrameErrorListener = Arc::new(listener);
        self.push(&self.frame_error, listener, "frame_error")
    }

    /// Remove a listener of any kind. Returns `false` if the id is unknown.
    pub fn remove(&self, id: ListenerId) -> bool {
        fn remove_from<L>(slot: &Slot<L>, id: ListenerId) -> bool {
            let mut listeners = slot.write();
            let before = listeners.len();
            listeners.retain(|(existing, _)| *existing != id);
            listeners.len() != before
        }

        remove_from(&self.connect, id)
            || remove_from(&self.message, id)
            || remove_from(&self.disconnect, id)
            || remove_from(&self.frame_error, id)
    }

    /// Total number of registered listeners.
    pub fn len(&self) -> usize {
        self.connect.read().len()
            + self.message.read().len()
            + self.disconnect.read().len()
            + self.frame_error.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn emit_connect(&self) {
        for listener in snapshot(&self.connect) {
            guarded("connect", || listener());
        }
    }

    pub(crate) fn emit_message(&self, payload: &MessagePayload) {
        for listener in snapshot(&self.message) {
            guarded("message", || listener(payload));
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: &DisconnectReason) {
        for listener in snapshot(&self.disconnect) {
            guarded("disconnect", || listener(reason));
        }
    }

    pub(crate) fn emit_frame_error(&self, frame_error: &FrameError) {
        for listener in snapshot(&self.frame_error) {
            guarded("frame_error", || listener(frame_error));
        }
    }
}

impl std::fmt::Debug for ConnectionListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionListeners")
            .field("count", &self.len())
            .finish()
    }
}

fn snapshot<L: Clone>(slot: &Slot<L>) -> Vec<L> {
    slot.read().iter().map(|(_, listener)| listener.clone()).collect()
}

fn guarded(kind: &str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        error!(kind, "Connection listener panicked");
    }
}
