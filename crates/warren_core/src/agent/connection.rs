//! Live WebSocket connections bound to an agent instance.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::OutgoingFrame;

/// Close code sent when a WebSocket handler raises.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Commands drained by the socket writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Text(String),
    Close { code: u16, reason: String },
}

/// Connection lifecycle, mirroring the WebSocket ready states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

struct ConnectionInner {
    id: String,
    /// Mutable, user-visible per-connection state blob.
    state: RwLock<Value>,
    ready: AtomicU8,
    tx: mpsc::UnboundedSender<SocketCommand>,
}

/// A live WebSocket bound to exactly one agent instance.
///
/// Cheap to clone; the instance owns the authoritative set.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection together with the command stream its transport
    /// drains. Used by the router's socket pump and by embedders bringing
    /// their own transport.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SocketCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4().simple().to_string(),
                state: RwLock::new(Value::Null),
                ready: AtomicU8::new(ReadyState::Connecting as u8),
                tx,
            }),
        };
        (conn, rx)
    }

    /// Immutable connection id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The user-visible connection state blob.
    pub fn state(&self) -> Value {
        self.inner
            .state
            .read()
            .map(|s| s.clone())
            .unwrap_or(Value::Null)
    }

    /// Replace the user-visible connection state blob.
    pub fn set_state(&self, state: Value) {
        if let Ok(mut guard) = self.inner.state.write() {
            *guard = state;
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.inner.ready.load(Ordering::Acquire))
    }

    pub(crate) fn mark_open(&self) {
        self.inner
            .ready
            .store(ReadyState::Open as u8, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.inner
            .ready
            .store(ReadyState::Closed as u8, Ordering::Release);
    }

    /// Enqueue a protocol frame onto this connection's send buffer.
    ///
    /// Closing and closed connections silently drop the frame.
    pub fn send_frame(&self, frame: &OutgoingFrame) {
        self.send_text(frame.to_text());
    }

    /// Enqueue a raw text message.
    pub fn send_text(&self, text: String) {
        match self.ready_state() {
            ReadyState::Closing | ReadyState::Closed => {}
            _ => {
                if self.inner.tx.send(SocketCommand::Text(text)).is_err() {
                    debug!(connection = %self.inner.id, "send on detached connection");
                    self.mark_closed();
                }
            }
        }
    }

    /// Close the connection with the given code and reason.
    pub fn close(&self, code: u16, reason: &str) {
        let previous = self
            .inner
            .ready
            .swap(ReadyState::Closing as u8, Ordering::AcqRel);
        if previous >= ReadyState::Closing as u8 {
            return;
        }
        let _ = self.inner.tx.send(SocketCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}
