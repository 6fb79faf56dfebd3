//! Helpers shared by the unit tests: an isolated context and an in-memory
//! peer standing in for a socket.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use nexus_shared::frame::{self, Frame};
use nexus_shared::protocol::{EnterRoomReq, EnterRoomRes, LoginReq, LoginRes};
use nexus_shared::{ErrorCode, Message, RoomId};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::session::Session;

pub async fn test_context() -> (Arc<ServerContext>, TempDir) {
    test_context_with(|_| {}).await
}

pub async fn test_context_with(tweak: impl FnOnce(&mut ServerConfig)) -> (Arc<ServerContext>, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig {
        bind_host: [127, 0, 0, 1].into(),
        chat_port: 0,
        admin_port: 0,
        worker_threads: 2,
        transfer_dir: dir.path().join("transfers"),
        buffer_pool_initial: 2,
        buffer_pool_max: 8,
        ..ServerConfig::default()
    };
    tweak(&mut config);
    let ctx = ServerContext::new(config).await.unwrap();
    (ctx, dir)
}

/// The far end of a session's outbound channel.
pub struct TestPeer {
    session: Arc<Session>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl TestPeer {
    /// Collect every frame written so far, completing each write so queued
    /// sends keep flowing.
    pub async fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(bytes) = self.outbound.try_recv() {
            let mut buf = BytesMut::from(&bytes[..]);
            while let Some(frame) = frame::decode_buf(&mut buf).unwrap() {
                frames.push(frame);
            }
            self.session.on_send_complete().await;
        }
        frames
    }

    /// Drain and keep only messages of type `M`.
    pub async fn take<M: Message>(&mut self) -> Vec<M> {
        self.drain()
            .await
            .iter()
            .filter(|f| f.message_id == M::ID.as_u16())
            .map(|f| M::from_frame(f).unwrap())
            .collect()
    }
}

pub async fn connect(ctx: &ServerContext) -> (Arc<Session>, TestPeer) {
    let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let (session, outbound) = ctx.accept_session(peer).await.unwrap();
    let test_peer = TestPeer {
        session: session.clone(),
        outbound,
    };
    (session, test_peer)
}

pub async fn send<M: Message>(ctx: &ServerContext, session: &Arc<Session>, message: &M) -> bool {
    ctx.dispatcher
        .dispatch(ctx, session, message.to_frame().unwrap())
        .await
}

pub async fn login(ctx: &ServerContext, user_id: &str) -> (Arc<Session>, TestPeer) {
    let (session, mut peer) = connect(ctx).await;
    let req = LoginReq {
        user_id: user_id.to_string(),
        password: "secret".to_string(),
    };
    assert!(send(ctx, &session, &req).await);
    let res: Vec<LoginRes> = peer.take().await;
    assert_eq!(res[0].error_code, ErrorCode::Success);
    (session, peer)
}

pub async fn enter(
    ctx: &ServerContext,
    session: &Arc<Session>,
    peer: &mut TestPeer,
    room_id: RoomId,
) -> EnterRoomRes {
    let req = EnterRoomReq {
        room_id,
        password: String::new(),
    };
    assert!(send(ctx, session, &req).await);
    let mut res: Vec<EnterRoomRes> = peer.take().await;
    assert_eq!(res[0].error_code, ErrorCode::Success);
    res.remove(0)
}
