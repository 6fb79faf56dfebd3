//! Network engine: listeners, per-connection I/O tasks and the completion
//! workers.
//!
//! Each accepted connection gets a reader task and a writer task. Neither
//! touches session state; they only post [`Completion`] events to a bounded
//! queue drained by a fixed set of workers. The reader keeps exactly one
//! receive outstanding and waits for the worker to re-arm it, so frames of a
//! single connection are always dispatched in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nexus_shared::SessionId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::admin;
use crate::context::ServerContext;
use crate::error::ServerError;
use crate::session::Session;
use crate::stats::names;

const LISTEN_BACKLOG: u32 = 1024;
/// How long `stop` waits for connection tasks before aborting them.
const CONNECTION_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Initializing,
    Running,
    Stopping,
}

#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    ReadFailed(std::io::Error),
    WriteFailed(std::io::Error),
    SendQueueOverflow,
}

/// I/O outcome handed from a connection task to the workers.
#[derive(Debug)]
enum Completion {
    Recv {
        session_id: SessionId,
        buffer: Vec<u8>,
        len: usize,
    },
    Sent {
        session_id: SessionId,
        len: usize,
    },
    Closed {
        session_id: SessionId,
        reason: CloseReason,
    },
}

type CompletionQueue = Arc<Mutex<mpsc::Receiver<Completion>>>;

pub struct Server {
    ctx: Arc<ServerContext>,
    state: EngineState,
    chat_listener: Option<TcpListener>,
    admin_listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    admin_addr: Option<SocketAddr>,
    completions: Option<mpsc::Sender<Completion>>,
    queue: Option<CompletionQueue>,
    shutdown: watch::Sender<bool>,
    /// Yields the connection tasks it spawned once it stops.
    accept_task: Option<JoinHandle<JoinSet<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx,
            state: EngineState::Stopped,
            chat_listener: None,
            admin_listener: None,
            local_addr: None,
            admin_addr: None,
            completions: None,
            queue: None,
            shutdown,
            accept_task: None,
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Bound chat address, available once initialized.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    /// Bind both listeners and create the completion queue.
    pub async fn initialize(&mut self) -> Result<(), ServerError> {
        if self.state != EngineState::Stopped {
            return Err(ServerError::Internal(format!(
                "cannot initialize engine in state {:?}",
                self.state
            )));
        }
        self.state = EngineState::Initializing;

        let config = &self.ctx.config;
        let bound = bind(config.chat_addr(), config.send_buffer_size)
            .and_then(|chat| Ok((chat, bind(config.admin_addr(), config.send_buffer_size)?)));
        let (chat, admin) = match bound {
            Ok(listeners) => listeners,
            Err(e) => {
                self.state = EngineState::Stopped;
                return Err(e.into());
            }
        };

        self.local_addr = Some(chat.local_addr()?);
        self.admin_addr = Some(admin.local_addr()?);
        self.chat_listener = Some(chat);
        self.admin_listener = Some(admin);

        let (tx, rx) = mpsc::channel(config.completion_queue_depth.max(1));
        self.completions = Some(tx);
        self.queue = Some(Arc::new(Mutex::new(rx)));

        if config.admin_token.is_none() {
            info!("ADMIN_TOKEN not set, admin channel bound to loopback only");
        }

        info!(
            chat = ?self.local_addr,
            admin = ?self.admin_addr,
            workers = config.worker_threads,
            "Engine initialized"
        );
        Ok(())
    }

    /// Spawn the accept loops, the workers and the periodic maintenance
    /// tasks. Initializes first if needed.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.state == EngineState::Stopped {
            self.initialize().await?;
        }
        if self.state != EngineState::Initializing {
            return Err(ServerError::Internal(format!(
                "cannot start engine in state {:?}",
                self.state
            )));
        }

        let (Some(chat), Some(admin), Some(completions), Some(queue)) = (
            self.chat_listener.take(),
            self.admin_listener.take(),
            self.completions.clone(),
            self.queue.take(),
        ) else {
            return Err(ServerError::Internal("engine resources missing".to_string()));
        };

        // A restarted engine needs a fresh signal.
        self.shutdown.send_replace(false);
        let ctx = &self.ctx;

        for worker_id in 0..ctx.config.worker_threads.max(1) {
            self.tasks.push(tokio::spawn(worker_loop(
                worker_id,
                ctx.clone(),
                queue.clone(),
                self.shutdown.subscribe(),
            )));
        }

        self.accept_task = Some(tokio::spawn(accept_loop(
            ctx.clone(),
            chat,
            completions,
            self.shutdown.subscribe(),
        )));

        self.tasks.push(tokio::spawn(admin::run(
            ctx.clone(),
            admin,
            self.shutdown.subscribe(),
        )));

        self.tasks.push(tokio::spawn(cleanup_loop(
            ctx.clone(),
            self.shutdown.subscribe(),
        )));

        if !ctx.config.heartbeat_timeout.is_zero() {
            self.tasks.push(tokio::spawn(reaper_loop(
                ctx.clone(),
                self.shutdown.subscribe(),
            )));
        }

        ctx.stats.mark_server_start();
        self.state = EngineState::Running;
        info!(addr = ?self.local_addr, "Server running");
        Ok(())
    }

    /// Stop accepting, disconnect every session and wait for all engine
    /// tasks to finish.
    pub async fn stop(&mut self) {
        if !matches!(self.state, EngineState::Running | EngineState::Initializing) {
            return;
        }
        self.state = EngineState::Stopping;
        info!("Stopping server");

        self.shutdown.send_replace(true);

        // Once the accept loop has returned no new session can appear, so
        // the snapshot below covers every connection.
        let mut connections = match self.accept_task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                error!(error = %e, "Accept task failed");
                JoinSet::new()
            }),
            None => JoinSet::new(),
        };

        for session in self.ctx.sessions.snapshot().await {
            self.ctx.disconnect_session(&session).await;
        }

        self.completions = None;
        self.queue = None;
        self.chat_listener = None;
        self.admin_listener = None;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Engine task failed");
            }
        }

        let drained = tokio::time::timeout(CONNECTION_DRAIN, async {
            while let Some(finished) = connections.join_next().await {
                if let Err(e) = finished {
                    error!(error = %e, "Connection task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "Aborting stuck connection tasks");
            connections.shutdown().await;
        }

        self.state = EngineState::Stopped;
        info!("Server stopped");
    }
}

fn bind(addr: SocketAddr, send_buffer: usize) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    let send_buffer = u32::try_from(send_buffer).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("send buffer size {} does not fit the socket option", send_buffer),
        )
    })?;
    // Inherited by accepted sockets.
    socket.set_send_buffer_size(send_buffer)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Resolves once stop has been signalled or the engine is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Accept connections until shutdown, then hand back the per-connection
/// tasks still running.
async fn accept_loop(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    completions: mpsc::Sender<Completion>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => break,
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    error!(error = %e, "Connection task failed");
                }
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        // Refused connections are dropped, which closes the socket.
        let Ok((session, outbound)) = ctx.accept_session(peer).await else {
            continue;
        };

        let (reader, writer) = stream.into_split();
        connections.spawn(read_loop(ctx.clone(), session.clone(), reader, completions.clone()));
        connections.spawn(write_loop(session.id(), writer, outbound, completions.clone()));
    }
    debug!(connections = connections.len(), "Accept loop stopped");
    connections
}

/// Issue one receive at a time and hand each result to the workers.
async fn read_loop(
    ctx: Arc<ServerContext>,
    session: Arc<Session>,
    mut reader: OwnedReadHalf,
    completions: mpsc::Sender<Completion>,
) {
    let session_id = session.id();
    let buffer_size = ctx.config.recv_buffer_size.max(1);

    loop {
        let mut buffer = ctx.recv_buffers.acquire();
        if buffer.len() != buffer_size {
            buffer.resize(buffer_size, 0);
        }

        let read = tokio::select! {
            _ = session.closed() => None,
            _ = session.send_overflowed() => Some(Err(CloseReason::SendQueueOverflow)),
            read = reader.read(&mut buffer) => Some(read.map_err(CloseReason::ReadFailed)),
        };
        let Some(read) = read else {
            ctx.recv_buffers.release(buffer);
            break;
        };

        let completion = match read {
            Ok(len) if len > 0 => Completion::Recv {
                session_id,
                buffer,
                len,
            },
            Ok(_) => {
                ctx.recv_buffers.release(buffer);
                Completion::Closed {
                    session_id,
                    reason: CloseReason::PeerClosed,
                }
            }
            Err(reason) => {
                ctx.recv_buffers.release(buffer);
                Completion::Closed { session_id, reason }
            }
        };
        let is_recv = matches!(completion, Completion::Recv { .. });

        if completions.send(completion).await.is_err() || !is_recv {
            break;
        }

        tokio::select! {
            _ = session.closed() => break,
            _ = session.send_overflowed() => {
                let reason = CloseReason::SendQueueOverflow;
                let _ = completions.send(Completion::Closed { session_id, reason }).await;
                break;
            }
            _ = session.recv_posted() => {}
        }
    }
    debug!(session = %session_id, "Reader finished");
}

/// Write each buffer the session releases, in order, and report completion.
async fn write_loop(
    session_id: SessionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    completions: mpsc::Sender<Completion>,
) {
    // Ends when the session drops its sender on disconnect.
    while let Some(bytes) = outbound.recv().await {
        let len = bytes.len();
        let completion = match writer.write_all(&bytes).await {
            Ok(()) => Completion::Sent { session_id, len },
            Err(e) => Completion::Closed {
                session_id,
                reason: CloseReason::WriteFailed(e),
            },
        };
        let failed = matches!(completion, Completion::Closed { .. });
        if completions.send(completion).await.is_err() || failed {
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!(session = %session_id, "Writer finished");
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<ServerContext>,
    queue: CompletionQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = worker_id, "Worker started");
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => None,
                completion = rx.recv() => completion,
            }
        };
        let Some(completion) = next else {
            break;
        };
        handle_completion(&ctx, completion).await;
    }
    debug!(worker = worker_id, "Worker stopped");
}

async fn handle_completion(ctx: &ServerContext, completion: Completion) {
    match completion {
        Completion::Recv {
            session_id,
            buffer,
            len,
        } => {
            ctx.stats.add(names::BYTES_RECEIVED, len as i64);
            ctx.traffic.on_bytes_in(session_id, len);

            if let Some(session) = ctx.sessions.find(session_id).await {
                process_received(ctx, &session, &buffer[..len]).await;
            }
            ctx.recv_buffers.release(buffer);
        }
        Completion::Sent { session_id, len } => {
            ctx.stats.add(names::BYTES_SENT, len as i64);
            ctx.stats.increment(names::FRAMES_SENT);
            ctx.traffic.on_bytes_out(session_id, len);
            if let Some(session) = ctx.sessions.find(session_id).await {
                session.on_send_complete().await;
            }
        }
        Completion::Closed { session_id, reason } => {
            match &reason {
                CloseReason::PeerClosed => debug!(session = %session_id, "Peer closed connection"),
                CloseReason::SendQueueOverflow => {
                    ctx.stats.increment(names::SEND_OVERFLOWS);
                    warn!(session = %session_id, "Peer is not reading, closing");
                }
                other => warn!(session = %session_id, reason = ?other, "Connection failed"),
            }
            if let Some(session) = ctx.sessions.find(session_id).await {
                ctx.disconnect_session(&session).await;
            }
        }
    }
}

async fn process_received(ctx: &ServerContext, session: &Arc<Session>, data: &[u8]) {
    if session.is_closing() {
        return;
    }

    let inbound = session.on_bytes_received(data).await;
    for frame in inbound.frames {
        ctx.stats.increment(names::FRAMES_RECEIVED);
        ctx.stats
            .record_value(names::FRAME_SIZE, frame.encoded_size() as f64);
        ctx.dispatcher.dispatch(ctx, session, frame).await;
        if session.is_closing() {
            return;
        }
    }

    if let Some(violation) = inbound.violation {
        warn!(session = %session.id(), error = %violation, "Protocol violation, closing");
        ctx.stats.increment(names::FRAME_ERRORS);
        ctx.disconnect_session(session).await;
        return;
    }

    session.post_recv();
}

/// Periodically sweep abandoned uploads.
async fn cleanup_loop(ctx: Arc<ServerContext>, mut shutdown: watch::Receiver<bool>) {
    let period = ctx.config.cleanup_interval.max(Duration::from_secs(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => break,
            _ = interval.tick() => {
                let removed = ctx.transfers.cleanup_expired(ctx.config.transfer_max_age).await;
                if removed > 0 {
                    ctx.stats.add(names::TRANSFERS_EXPIRED, removed as i64);
                    ctx.stats
                        .set(names::ACTIVE_TRANSFERS, ctx.transfers.active_count().await as i64);
                    info!(removed, "Expired transfers removed");
                }
            }
        }
    }
}

/// Disconnect sessions that have been silent past the heartbeat timeout.
async fn reaper_loop(ctx: Arc<ServerContext>, mut shutdown: watch::Receiver<bool>) {
    let timeout = ctx.config.heartbeat_timeout;
    let period = (timeout / 2).max(Duration::from_millis(50));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => break,
            _ = interval.tick() => {
                for session in ctx.sessions.snapshot().await {
                    if session.idle_for() > timeout {
                        info!(session = %session.id(), "Heartbeat timeout");
                        ctx.disconnect_session(&session).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, test_context_with};
    use nexus_shared::constants::HEADER_SIZE;
    use nexus_shared::frame::{Frame, FrameHeader};
    use nexus_shared::protocol::{HeartbeatReq, HeartbeatRes, LoginReq, LoginRes};
    use nexus_shared::{ErrorCode, Message};
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::TcpStream;

    const WAIT: Duration = Duration::from_secs(5);

    async fn read_frame(stream: &mut TcpStream) -> Frame {
        let mut header = [0u8; HEADER_SIZE];
        tokio::time::timeout(WAIT, stream.read_exact(&mut header))
            .await
            .unwrap()
            .unwrap();
        let header = FrameHeader::parse(&header).unwrap();
        let mut payload = vec![0u8; header.payload_length as usize];
        tokio::time::timeout(WAIT, stream.read_exact(&mut payload))
            .await
            .unwrap()
            .unwrap();
        Frame::new(header.message_id, payload)
    }

    async fn next_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> String {
        tokio::time::timeout(WAIT, lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn assert_closed_by_server(stream: &mut TcpStream) {
        let mut buf = [0u8; 64];
        loop {
            match tokio::time::timeout(WAIT, stream.read(&mut buf)).await.unwrap() {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_login_over_tcp_with_split_writes() {
        let (ctx, _dir) = test_context().await;
        let mut server = Server::new(ctx.clone());
        server.start().await.unwrap();
        assert_eq!(server.state(), EngineState::Running);

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let login = LoginReq {
            user_id: "alice".into(),
            password: "secret".into(),
        }
        .to_bytes()
        .unwrap();
        let heartbeat = HeartbeatReq { client_time_ms: 42 }.to_bytes().unwrap();

        // Login split mid-header, heartbeat glued to its tail.
        stream.write_all(&login[..5]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut rest = login[5..].to_vec();
        rest.extend_from_slice(&heartbeat);
        stream.write_all(&rest).await.unwrap();

        let res = LoginRes::from_frame(&read_frame(&mut stream).await).unwrap();
        assert_eq!(res.error_code, ErrorCode::Success);
        assert_eq!(res.user_id, "alice");

        let pong = HeartbeatRes::from_frame(&read_frame(&mut stream).await).unwrap();
        assert_eq!(pong.client_time_ms, 42);

        assert!(ctx.sessions.find_by_user("alice").await.is_some());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_oversize_header_disconnects() {
        let (ctx, _dir) = test_context().await;
        let mut server = Server::new(ctx.clone());
        server.start().await.unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let mut header = bytes::BytesMut::new();
        FrameHeader {
            message_id: 1001,
            payload_length: u16::MAX,
            checksum: 0,
        }
        .write(&mut header);
        stream.write_all(&header).await.unwrap();

        assert_closed_by_server(&mut stream).await;
        assert_eq!(ctx.stats.get(names::FRAME_ERRORS), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_refuses_connections_past_max_clients() {
        let (ctx, _dir) = test_context_with(|config| config.max_clients = 1).await;
        let mut server = Server::new(ctx.clone());
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        assert_closed_by_server(&mut second).await;
        assert_eq!(ctx.stats.get(names::CONNECTIONS_REJECTED), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_idle_session_is_reaped() {
        let (ctx, _dir) =
            test_context_with(|config| config.heartbeat_timeout = Duration::from_millis(200)).await;
        let mut server = Server::new(ctx.clone());
        server.start().await.unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        assert_closed_by_server(&mut stream).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_everyone() {
        let (ctx, _dir) = test_context().await;
        let mut server = Server::new(ctx.clone());
        server.start().await.unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let login = LoginReq {
            user_id: "alice".into(),
            password: "secret".into(),
        };
        stream.write_all(&login.to_bytes().unwrap()).await.unwrap();
        read_frame(&mut stream).await;

        server.stop().await;
        assert_eq!(server.state(), EngineState::Stopped);
        assert_eq!(ctx.sessions.count().await, 0);
        assert_closed_by_server(&mut stream).await;

        // Stopping twice is harmless.
        server.stop().await;
    }

    #[tokio::test]
    async fn test_admin_channel_requires_token() {
        let (ctx, _dir) =
            test_context_with(|config| config.admin_token = Some("letmein".into())).await;
        let mut server = Server::new(ctx.clone());
        server.start().await.unwrap();

        let stream = TcpStream::connect(server.admin_addr().unwrap()).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        assert!(next_line(&mut lines).await.starts_with("OK"));

        writer.write_all(b"ROOMS\n").await.unwrap();
        assert_eq!(next_line(&mut lines).await, "ERR authentication required");

        writer.write_all(b"AUTH wrong\n").await.unwrap();
        assert_eq!(next_line(&mut lines).await, "ERR invalid token");

        writer.write_all(b"AUTH letmein\n").await.unwrap();
        assert_eq!(next_line(&mut lines).await, "OK authenticated");

        writer.write_all(b"ROOMS\n").await.unwrap();
        let rooms: serde_json::Value = serde_json::from_str(&next_line(&mut lines).await).unwrap();
        assert_eq!(rooms[0]["title"], "Lobby");

        writer.write_all(b"QUIT\n").await.unwrap();
        assert_eq!(next_line(&mut lines).await, "OK bye");

        server.stop().await;
    }

    async fn login(stream: &mut TcpStream, user_id: &str) {
        let login = LoginReq {
            user_id: user_id.into(),
            password: "secret".into(),
        };
        stream.write_all(&login.to_bytes().unwrap()).await.unwrap();
        let res = LoginRes::from_frame(&read_frame(stream).await).unwrap();
        assert_eq!(res.error_code, ErrorCode::Success);
    }

    #[tokio::test]
    async fn test_bad_checksum_disconnects() {
        let (ctx, _dir) = test_context().await;
        let mut server = Server::new(ctx.clone());
        server.start().await.unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        login(&mut stream, "alice").await;

        let mut corrupted = HeartbeatReq { client_time_ms: 7 }.to_bytes().unwrap().to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        stream.write_all(&corrupted).await.unwrap();

        assert_closed_by_server(&mut stream).await;
        assert_eq!(ctx.stats.get(names::FRAME_ERRORS), 1);
        tokio::time::timeout(WAIT, async {
            while ctx.sessions.find_by_user("alice").await.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_during_connection_burst_leaves_nothing_open() {
        let (ctx, _dir) = test_context().await;
        let mut server = Server::new(ctx.clone());
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let connecting: Vec<_> = (0..32)
            .map(|_| tokio::spawn(async move { TcpStream::connect(addr).await }))
            .collect();
        tokio::time::sleep(Duration::from_millis(5)).await;
        server.stop().await;
        assert_eq!(ctx.sessions.count().await, 0);

        for task in connecting {
            // Connects that lost the race are refused outright.
            if let Ok(mut stream) = task.await.unwrap() {
                assert_closed_by_server(&mut stream).await;
            }
        }
        assert_eq!(ctx.sessions.count().await, 0);
    }

    #[tokio::test]
    async fn test_peer_that_stops_reading_is_disconnected() {
        let (ctx, _dir) = test_context_with(|config| config.max_pending_sends = 4).await;
        let mut server = Server::new(ctx.clone());
        server.start().await.unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        login(&mut stream, "alice").await;
        let session = ctx.sessions.find_by_user("alice").await.unwrap();

        let mut refused = false;
        for _ in 0..64 {
            if !session.enqueue_send(Bytes::from_static(b"backlog!")).await {
                refused = true;
                break;
            }
        }
        assert!(refused);
        assert!(session.is_overflowed());

        assert_closed_by_server(&mut stream).await;
        tokio::time::timeout(WAIT, async {
            while ctx.sessions.find_by_user("alice").await.is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(ctx.stats.get(names::SEND_OVERFLOWS), 1);
        server.stop().await;
    }

    #[cfg(target_pointer_width = "64")]
    #[tokio::test]
    async fn test_bind_rejects_send_buffer_beyond_u32() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let err = bind(addr, u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
