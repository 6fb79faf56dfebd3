//! Per-connection state.
//!
//! A [`Session`] owns the inbound accumulation buffer, the outbound FIFO and
//! the login/room state of one TCP connection. Socket I/O itself lives in the
//! engine's reader and writer tasks; the session only decides *what* gets
//! written next and guarantees a single write is in flight at a time.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use nexus_shared::frame::{self, Frame};
use nexus_shared::{FrameError, Message, RoomId, SessionId};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::error::ServerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Anonymous,
    Authenticated(String),
}

struct SessionState {
    login: LoginState,
    room: Option<RoomId>,
    send_queue: VecDeque<Bytes>,
    sending: bool,
    /// Hand-off to the writer task. Dropped on disconnect, which ends it.
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
}

/// Frames extracted from one receive, plus the violation that stopped
/// extraction early, if any.
#[derive(Debug, Default)]
pub struct Inbound {
    pub frames: Vec<Frame>,
    pub violation: Option<FrameError>,
}

pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    state: Mutex<SessionState>,
    inbound: Mutex<BytesMut>,
    closing: AtomicBool,
    closed: Notify,
    recv_ready: Notify,
    /// Writes allowed to wait behind the one in flight.
    send_queue_limit: usize,
    overflowed: AtomicBool,
    overflow: Notify,
    created: Instant,
    /// Milliseconds after `created` of the last inbound traffic.
    last_activity_ms: AtomicU64,
}

impl Session {
    /// Build a session around an accumulation buffer. The returned receiver
    /// yields each write the session issues, in order. At most
    /// `send_queue_limit` writes may wait behind the one in flight.
    pub fn new(
        id: SessionId,
        peer_addr: SocketAddr,
        accumulator: BytesMut,
        send_queue_limit: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            id,
            peer_addr,
            state: Mutex::new(SessionState {
                login: LoginState::Anonymous,
                room: None,
                send_queue: VecDeque::new(),
                sending: false,
                outbound: Some(tx),
            }),
            inbound: Mutex::new(accumulator),
            closing: AtomicBool::new(false),
            closed: Notify::new(),
            recv_ready: Notify::new(),
            send_queue_limit,
            overflowed: AtomicBool::new(false),
            overflow: Notify::new(),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        };
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Append received bytes and extract every complete frame.
    ///
    /// A trailing partial frame stays buffered for the next call. Frames
    /// decoded before a violation are still returned; the violation itself
    /// means the connection must be closed.
    pub async fn on_bytes_received(&self, data: &[u8]) -> Inbound {
        self.touch();

        let mut buf = self.inbound.lock().await;
        buf.extend_from_slice(data);

        let mut inbound = Inbound::default();
        loop {
            match frame::decode_buf(&mut buf) {
                Ok(Some(frame)) => inbound.frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    buf.clear();
                    inbound.violation = Some(e);
                    break;
                }
            }
        }
        inbound
    }

    /// Allow the reader to issue the next receive.
    pub fn post_recv(&self) {
        self.recv_ready.notify_one();
    }

    /// Resolves once the worker has finished with the previous receive.
    pub async fn recv_posted(&self) {
        self.recv_ready.notified().await;
    }

    pub async fn take_accumulator(&self) -> BytesMut {
        std::mem::take(&mut *self.inbound.lock().await)
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Queue bytes for the peer. Issues them immediately when no write is in
    /// flight. Returns `false` once the session is disconnecting or its
    /// queue has overflowed.
    ///
    /// A peer that stops reading eventually fills the queue. The pending
    /// writes are then dropped and [`Session::send_overflowed`] fires so the
    /// engine can close the connection.
    pub async fn enqueue_send(&self, bytes: Bytes) -> bool {
        if self.is_closing() || self.is_overflowed() {
            return false;
        }

        let mut state = self.state.lock().await;
        let Some(outbound) = state.outbound.clone() else {
            return false;
        };

        if state.sending {
            if state.send_queue.len() >= self.send_queue_limit {
                let dropped = state.send_queue.len();
                state.send_queue.clear();
                drop(state);
                tracing::warn!(session = %self.id, dropped, "Send queue full");
                if !self.overflowed.swap(true, Ordering::AcqRel) {
                    self.overflow.notify_waiters();
                }
                return false;
            }
            state.send_queue.push_back(bytes);
            return true;
        }

        state.sending = true;
        if outbound.send(bytes).is_err() {
            state.sending = false;
            return false;
        }
        true
    }

    /// The previous write finished: issue the next queued one, or clear the
    /// in-flight flag when the queue is empty.
    pub async fn on_send_complete(&self) {
        let mut state = self.state.lock().await;
        let next = state.send_queue.pop_front();
        match (next, state.outbound.clone()) {
            (Some(bytes), Some(outbound)) => {
                if outbound.send(bytes).is_err() {
                    state.sending = false;
                    state.send_queue.clear();
                }
            }
            _ => state.sending = false,
        }
    }

    /// Serialize, frame and queue a typed message.
    pub async fn send_message<M: Message>(&self, message: &M) -> Result<bool, ServerError> {
        let bytes = message.to_bytes()?;
        Ok(self.enqueue_send(bytes).await)
    }

    pub async fn pending_sends(&self) -> usize {
        self.state.lock().await.send_queue.len()
    }

    pub async fn is_sending(&self) -> bool {
        self.state.lock().await.sending
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Resolves once the outbound queue has overflowed.
    pub async fn send_overflowed(&self) {
        let notified = self.overflow.notified();
        if self.is_overflowed() {
            return;
        }
        notified.await;
    }

    // -----------------------------------------------------------------------
    // Login and room state
    // -----------------------------------------------------------------------

    pub async fn set_logged_in(&self, user_id: &str) -> Result<(), ServerError> {
        let mut state = self.state.lock().await;
        if state.login != LoginState::Anonymous {
            return Err(ServerError::AlreadyLoggedIn);
        }
        state.login = LoginState::Authenticated(user_id.to_string());
        Ok(())
    }

    /// Returns the user id that was logged in, if any.
    pub async fn set_logged_out(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut state.login, LoginState::Anonymous) {
            LoginState::Authenticated(user_id) => Some(user_id),
            LoginState::Anonymous => None,
        }
    }

    pub async fn user_id(&self) -> Option<String> {
        match &self.state.lock().await.login {
            LoginState::Authenticated(user_id) => Some(user_id.clone()),
            LoginState::Anonymous => None,
        }
    }

    pub async fn is_logged_in(&self) -> bool {
        self.state.lock().await.login != LoginState::Anonymous
    }

    /// Fails once the session is disconnecting, so teardown never misses a
    /// room reference set behind its back.
    pub async fn enter_room(&self, room_id: RoomId) -> Result<(), ServerError> {
        let mut state = self.state.lock().await;
        if self.is_closing() {
            return Err(ServerError::SessionClosed);
        }
        if let Some(current) = state.room {
            return Err(ServerError::AlreadyInRoom(current));
        }
        state.room = Some(room_id);
        Ok(())
    }

    pub async fn leave_room(&self) -> Option<RoomId> {
        self.state.lock().await.room.take()
    }

    /// Clear the room reference only if it still points at `room_id`.
    pub async fn detach_from(&self, room_id: RoomId) -> bool {
        let mut state = self.state.lock().await;
        if state.room == Some(room_id) {
            state.room = None;
            true
        } else {
            false
        }
    }

    pub async fn current_room(&self) -> Option<RoomId> {
        self.state.lock().await.room
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Mark the session as disconnecting. Only the first caller gets `true`
    /// and must carry out the teardown; the pending queue is discarded and
    /// the writer is released.
    pub async fn begin_disconnect(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }

        {
            let mut state = self.state.lock().await;
            state.send_queue.clear();
            state.sending = false;
            state.outbound = None;
        }
        self.closed.notify_waiters();
        true
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Resolves once the session starts disconnecting.
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        if self.is_closing() {
            return;
        }
        notified.await;
    }

    pub fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closing", &self.is_closing())
            .finish()
    }
}
