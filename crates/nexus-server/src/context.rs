//! Shared server state handed to the engine, the workers and every handler.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use nexus_shared::constants::MAX_PACKET_SIZE;
use nexus_shared::protocol::{UserLeftRoomNtf, UserSummary};
use nexus_shared::{Message, RoomId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::PacketDispatcher;
use crate::error::ServerError;
use crate::handlers;
use crate::pool::{self, MemoryPool};
use crate::registry::{RoomRegistry, SessionRegistry};
use crate::room::ChatRoom;
use crate::session::Session;
use crate::stats::{names, Statistics};
use crate::traffic::{NoopObserver, TrafficObserver};
use crate::transfer::FileTransferManager;

pub struct ServerContext {
    pub config: ServerConfig,
    pub sessions: SessionRegistry,
    pub rooms: RoomRegistry,
    pub transfers: FileTransferManager,
    pub dispatcher: PacketDispatcher,
    pub stats: Statistics,
    pub traffic: Arc<dyn TrafficObserver>,
    pub recv_buffers: MemoryPool<Vec<u8>>,
    pub accumulators: MemoryPool<BytesMut>,
}

impl ServerContext {
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        Self::with_observer(config, Arc::new(NoopObserver)).await
    }

    /// Build the context with a traffic observer, install the default
    /// handlers and create the configured default rooms.
    pub async fn with_observer(
        config: ServerConfig,
        traffic: Arc<dyn TrafficObserver>,
    ) -> Result<Arc<Self>, ServerError> {
        let transfers = FileTransferManager::new(
            config.transfer_dir.clone(),
            config.file_chunk_size,
            config.max_file_size,
        )
        .await?;

        let ctx = Self {
            sessions: SessionRegistry::new(config.max_clients, config.max_pending_sends),
            rooms: RoomRegistry::new(config.max_rooms, config.room_capacity),
            transfers,
            dispatcher: PacketDispatcher::new(),
            stats: Statistics::new(),
            traffic,
            recv_buffers: pool::recv_buffer_pool(
                config.buffer_pool_initial,
                config.buffer_pool_max,
                config.recv_buffer_size,
            ),
            accumulators: pool::accumulator_pool(
                config.buffer_pool_initial,
                config.buffer_pool_max,
                MAX_PACKET_SIZE,
            ),
            config,
        };

        handlers::register_default_handlers(&ctx.dispatcher).await;

        for title in &ctx.config.default_rooms {
            ctx.create_room(title, None, None).await?;
        }

        Ok(Arc::new(ctx))
    }

    pub async fn create_room(
        &self,
        title: &str,
        capacity: Option<usize>,
        password: Option<String>,
    ) -> Result<Arc<ChatRoom>, ServerError> {
        let room = self.rooms.create_room(title, capacity, password).await?;
        self.stats.set(names::ACTIVE_ROOMS, self.rooms.count().await as i64);
        info!(room = %room.id(), title = %room.title(), "Room created");
        Ok(room)
    }

    /// Register a freshly accepted connection.
    pub async fn accept_session(
        &self,
        peer_addr: SocketAddr,
    ) -> Result<(Arc<Session>, mpsc::UnboundedReceiver<Bytes>), ServerError> {
        let accumulator = self.accumulators.acquire();
        match self.sessions.create_session(peer_addr, accumulator).await {
            Ok((session, outbound)) => {
                self.stats.increment(names::CONNECTIONS_ACCEPTED);
                self.stats
                    .set(names::ACTIVE_SESSIONS, self.sessions.count().await as i64);
                self.traffic.on_connection_opened(session.id(), peer_addr);
                info!(session = %session.id(), peer = %peer_addr, "Session accepted");
                Ok((session, outbound))
            }
            Err(e) => {
                self.stats.increment(names::CONNECTIONS_REJECTED);
                warn!(peer = %peer_addr, error = %e, "Connection refused");
                Err(e)
            }
        }
    }

    /// Tear a session down. Safe to call any number of times from any task;
    /// only the first call does the work and returns `true`.
    pub async fn disconnect_session(&self, session: &Arc<Session>) -> bool {
        if !session.begin_disconnect().await {
            return false;
        }

        let id = session.id();
        self.leave_current_room(session).await;
        if let Some(user_id) = session.set_logged_out().await {
            self.sessions.unbind_user(&user_id, id).await;
        }
        self.sessions.remove(id).await;
        self.accumulators.release(session.take_accumulator().await);

        self.stats.increment(names::CONNECTIONS_CLOSED);
        self.stats
            .set(names::ACTIVE_SESSIONS, self.sessions.count().await as i64);
        self.traffic.on_connection_closed(id);
        info!(session = %id, "Session disconnected");
        true
    }

    /// Take the session out of its room and tell the remaining members.
    pub async fn leave_current_room(&self, session: &Arc<Session>) -> Option<RoomId> {
        let room_id = session.leave_room().await?;
        let user_id = session.user_id().await.unwrap_or_default();

        if let Some(room) = self.rooms.find(room_id).await {
            room.leave(session.id()).await;
            let notice = UserLeftRoomNtf {
                room_id,
                user_id: user_id.clone(),
            };
            match notice.to_bytes() {
                Ok(bytes) => {
                    room.broadcast(&self.sessions, bytes, Some(session.id())).await;
                }
                Err(e) => warn!(room = %room_id, error = %e, "Failed to encode leave notice"),
            }
        }

        debug!(session = %session.id(), user = %user_id, room = %room_id, "Left room");
        Some(room_id)
    }

    pub async fn kick_user(&self, user_id: &str) -> Result<(), ServerError> {
        let session = self
            .sessions
            .find_by_user(user_id)
            .await
            .ok_or_else(|| ServerError::UserNotFound(user_id.to_string()))?;
        info!(session = %session.id(), user = user_id, "Kicking user");
        self.disconnect_session(&session).await;
        Ok(())
    }

    /// Remove a room and detach everyone still in it.
    pub async fn remove_room(&self, room_id: RoomId) -> bool {
        let Some(room) = self.rooms.remove_room(room_id).await else {
            return false;
        };

        for member in room.member_ids().await {
            let Some(session) = self.sessions.find(member).await else {
                continue;
            };
            if session.detach_from(room_id).await {
                if let Some(user_id) = session.user_id().await {
                    let notice = UserLeftRoomNtf { room_id, user_id };
                    if let Err(e) = session.send_message(&notice).await {
                        warn!(session = %member, error = %e, "Failed to notify detached member");
                    }
                }
            }
        }

        self.stats.set(names::ACTIVE_ROOMS, self.rooms.count().await as i64);
        info!(room = %room_id, title = %room.title(), "Room removed");
        true
    }

    /// One summary per authenticated session, ordered by session id.
    pub async fn user_summaries(&self) -> Vec<UserSummary> {
        let mut users = Vec::new();
        for session in self.sessions.snapshot().await {
            if let Some(user_id) = session.user_id().await {
                users.push(UserSummary {
                    user_id,
                    session_id: session.id(),
                    room_id: session.current_room().await,
                    peer_addr: session.peer_addr().to_string(),
                });
            }
        }
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{connect, enter, login, test_context, test_context_with};
    use nexus_shared::PacketId;

    #[tokio::test]
    async fn test_default_rooms_created() {
        let (ctx, _dir) = test_context_with(|config| {
            config.default_rooms = vec!["Lobby".into(), "Dev".into()];
        })
        .await;
        let titles: Vec<String> = ctx
            .rooms
            .list()
            .await
            .iter()
            .map(|r| r.title().to_string())
            .collect();
        assert_eq!(titles, vec!["Lobby", "Dev"]);
    }

    #[tokio::test]
    async fn test_accept_refused_past_max_clients() {
        let (ctx, _dir) = test_context_with(|config| config.max_clients = 1).await;
        let (_a, _pa) = connect(&ctx).await;
        assert!(matches!(
            ctx.accept_session("127.0.0.1:1".parse().unwrap()).await,
            Err(ServerError::CapacityExceeded { what: "sessions", .. })
        ));
        assert_eq!(ctx.stats.get(names::CONNECTIONS_REJECTED), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_disconnect_runs_once() {
        let (ctx, _dir) = test_context().await;
        let lobby = ctx.rooms.list().await[0].clone();
        let (a, mut peer_a) = login(&ctx, "alice").await;
        let (b, mut peer_b) = login(&ctx, "bob").await;
        enter(&ctx, &a, &mut peer_a, lobby.id()).await;
        enter(&ctx, &b, &mut peer_b, lobby.id()).await;
        peer_b.drain().await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                let a = a.clone();
                tokio::spawn(async move { ctx.disconnect_session(&a).await })
            })
            .collect();
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(ctx.stats.get(names::CONNECTIONS_CLOSED), 1);
        assert!(ctx.sessions.find(a.id()).await.is_none());
        assert!(ctx.sessions.find_by_user("alice").await.is_none());
        assert_eq!(lobby.member_count().await, 1);

        // Exactly one departure notice reached the remaining member.
        let left = peer_b
            .drain()
            .await
            .into_iter()
            .filter(|f| f.message_id == PacketId::UserLeftRoomNtf.as_u16())
            .count();
        assert_eq!(left, 1);
    }

    #[tokio::test]
    async fn test_remove_room_detaches_members() {
        let (ctx, _dir) = test_context().await;
        let room = ctx.rooms.create_room("Temp", Some(4), None).await.unwrap();
        let (a, mut peer_a) = login(&ctx, "alice").await;
        enter(&ctx, &a, &mut peer_a, room.id()).await;

        assert!(ctx.remove_room(room.id()).await);
        assert!(!ctx.remove_room(room.id()).await);
        assert_eq!(a.current_room().await, None);
        let notices: Vec<UserLeftRoomNtf> = peer_a.take().await;
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].room_id, room.id());
    }

    #[tokio::test]
    async fn test_kick_user() {
        let (ctx, _dir) = test_context().await;
        let (a, _peer_a) = login(&ctx, "alice").await;

        ctx.kick_user("alice").await.unwrap();
        assert!(a.is_closing());
        assert!(matches!(
            ctx.kick_user("alice").await,
            Err(ServerError::UserNotFound(_))
        ));
        assert!(ctx.user_summaries().await.is_empty());
    }
}
