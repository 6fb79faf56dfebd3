//! Request handlers for every client-originated packet.
//!
//! Requests with a response packet always get one, carrying the error code
//! on refusal. Requests without one (leave, chat, chunks) report failure to
//! the dispatcher instead.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use nexus_shared::protocol::*;
use nexus_shared::types::is_valid_user_id;
use nexus_shared::{ErrorCode, Message, UploadId};
use tracing::{debug, info};

use crate::context::ServerContext;
use crate::dispatcher::{PacketDispatcher, PacketHandler};
use crate::error::ServerError;
use crate::room::ChatRoom;
use crate::session::Session;
use crate::stats::names;
use crate::transfer::UploadTicket;

macro_rules! packet_handlers {
    ($($handler:ident: $request:ty => $func:ident),* $(,)?) => {
        $(
            pub struct $handler;

            impl PacketHandler for $handler {
                fn handle<'a>(
                    &'a self,
                    ctx: &'a ServerContext,
                    session: &'a Arc<Session>,
                    payload: Bytes,
                ) -> BoxFuture<'a, Result<bool, ServerError>> {
                    async move {
                        let request = <$request as Message>::from_payload(&payload)?;
                        $func(ctx, session, request).await
                    }
                    .boxed()
                }
            }
        )*

        /// Install the handler for every client request packet.
        pub async fn register_default_handlers(dispatcher: &PacketDispatcher) {
            $(
                dispatcher
                    .register_handler(<$request as Message>::ID.as_u16(), Arc::new($handler))
                    .await;
            )*
        }
    };
}

packet_handlers! {
    LoginHandler: LoginReq => on_login,
    LogoutHandler: LogoutReq => on_logout,
    HeartbeatHandler: HeartbeatReq => on_heartbeat,
    EnterRoomHandler: EnterRoomReq => on_enter_room,
    LeaveRoomHandler: LeaveRoomReq => on_leave_room,
    RoomChatHandler: RoomChatReq => on_room_chat,
    FileUploadHandler: FileUploadReq => on_file_upload,
    FileChunkHandler: FileChunk => on_file_chunk,
    AdminUserListHandler: AdminUserListReq => on_admin_user_list,
    KickUserHandler: KickUserReq => on_kick_user,
}

fn code_of<T>(result: &Result<T, ServerError>) -> ErrorCode {
    match result {
        Ok(_) => ErrorCode::Success,
        Err(e) => e.error_code(),
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

// ---------------------------------------------------------------------------
// Authentication and liveness
// ---------------------------------------------------------------------------

async fn on_login(ctx: &ServerContext, session: &Arc<Session>, req: LoginReq) -> Result<bool, ServerError> {
    let result = login(ctx, session, &req).await;

    session
        .send_message(&LoginRes {
            error_code: code_of(&result),
            session_id: session.id(),
            user_id: req.user_id.clone(),
        })
        .await?;

    match result {
        Ok(()) => {
            ctx.stats.increment(names::LOGINS);
            info!(session = %session.id(), user = %req.user_id, "User logged in");
            Ok(true)
        }
        Err(e) => {
            debug!(session = %session.id(), error = %e, "Login refused");
            Ok(false)
        }
    }
}

async fn login(ctx: &ServerContext, session: &Arc<Session>, req: &LoginReq) -> Result<(), ServerError> {
    if !is_valid_user_id(&req.user_id) {
        return Err(ServerError::InvalidUserId(req.user_id.clone()));
    }
    if req.password.is_empty() {
        return Err(ServerError::InvalidPassword);
    }
    if session.is_logged_in().await {
        return Err(ServerError::AlreadyLoggedIn);
    }

    ctx.sessions.bind_user(&req.user_id, session.id()).await?;
    if let Err(e) = session.set_logged_in(&req.user_id).await {
        ctx.sessions.unbind_user(&req.user_id, session.id()).await;
        return Err(e);
    }
    Ok(())
}

async fn on_logout(ctx: &ServerContext, session: &Arc<Session>, _req: LogoutReq) -> Result<bool, ServerError> {
    let Some(user_id) = session.user_id().await else {
        session
            .send_message(&LogoutRes {
                error_code: ServerError::NotLoggedIn.error_code(),
            })
            .await?;
        return Ok(false);
    };

    ctx.leave_current_room(session).await;
    session.set_logged_out().await;
    ctx.sessions.unbind_user(&user_id, session.id()).await;

    session
        .send_message(&LogoutRes {
            error_code: ErrorCode::Success,
        })
        .await?;
    info!(session = %session.id(), user = %user_id, "User logged out");
    Ok(true)
}

async fn on_heartbeat(_ctx: &ServerContext, session: &Arc<Session>, req: HeartbeatReq) -> Result<bool, ServerError> {
    session.touch();
    session
        .send_message(&HeartbeatRes {
            client_time_ms: req.client_time_ms,
            server_time_ms: now_ms(),
        })
        .await?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Chat rooms
// ---------------------------------------------------------------------------

async fn on_enter_room(ctx: &ServerContext, session: &Arc<Session>, req: EnterRoomReq) -> Result<bool, ServerError> {
    match enter_room(ctx, session, &req).await {
        Ok((room, user_id, members)) => {
            session
                .send_message(&EnterRoomRes {
                    error_code: ErrorCode::Success,
                    room_id: room.id(),
                    title: room.title().to_string(),
                    members,
                })
                .await?;

            let notice = NewUserInRoomNtf {
                room_id: room.id(),
                user_id: user_id.clone(),
            };
            room.broadcast(&ctx.sessions, notice.to_bytes()?, Some(session.id()))
                .await;

            info!(session = %session.id(), user = %user_id, room = %room.id(), "Entered room");
            Ok(true)
        }
        Err(e) => {
            session
                .send_message(&EnterRoomRes {
                    error_code: e.error_code(),
                    room_id: req.room_id,
                    title: String::new(),
                    members: Vec::new(),
                })
                .await?;
            debug!(session = %session.id(), room = %req.room_id, error = %e, "Enter refused");
            Ok(false)
        }
    }
}

async fn enter_room(
    ctx: &ServerContext,
    session: &Arc<Session>,
    req: &EnterRoomReq,
) -> Result<(Arc<ChatRoom>, String, Vec<String>), ServerError> {
    let user_id = session.user_id().await.ok_or(ServerError::NotLoggedIn)?;
    let room = ctx
        .rooms
        .find(req.room_id)
        .await
        .ok_or(ServerError::RoomNotFound(req.room_id))?;

    let previous = session.current_room().await;
    if previous == Some(room.id()) {
        return Err(ServerError::AlreadyMember);
    }

    // Password and capacity are checked before the session gives up the
    // room it is in; a refused move leaves it where it was.
    let members = room.enter(session.id(), &user_id, &req.password).await?;
    if previous.is_some() {
        ctx.leave_current_room(session).await;
    }

    // A disconnect that started meanwhile never saw this membership.
    if let Err(e) = session.enter_room(room.id()).await {
        room.leave(session.id()).await;
        return Err(e);
    }
    Ok((room, user_id, members))
}

async fn on_leave_room(ctx: &ServerContext, session: &Arc<Session>, _req: LeaveRoomReq) -> Result<bool, ServerError> {
    let user_id = session.user_id().await.ok_or(ServerError::NotLoggedIn)?;
    let room_id = ctx
        .leave_current_room(session)
        .await
        .ok_or(ServerError::NotInRoom)?;

    session
        .send_message(&UserLeftRoomNtf { room_id, user_id })
        .await?;
    Ok(true)
}

async fn on_room_chat(ctx: &ServerContext, session: &Arc<Session>, req: RoomChatReq) -> Result<bool, ServerError> {
    let sender = session.user_id().await.ok_or(ServerError::NotLoggedIn)?;
    let room_id = session.current_room().await.ok_or(ServerError::NotInRoom)?;
    let room = ctx
        .rooms
        .find(room_id)
        .await
        .ok_or(ServerError::RoomNotFound(room_id))?;

    let RoomChatReq { message, whisper_to } = req;
    let notice = RoomChatNtf {
        room_id,
        sender: sender.clone(),
        message,
        whisper: whisper_to.is_some(),
        timestamp_ms: now_ms(),
    };
    let bytes = notice.to_bytes()?;

    match whisper_to {
        Some(target) => {
            room.send_to_user(&ctx.sessions, bytes.clone(), &target).await?;
            if target != sender {
                session.enqueue_send(bytes).await;
            }
        }
        None => {
            room.broadcast(&ctx.sessions, bytes, None).await;
        }
    }

    ctx.stats.increment(names::CHAT_MESSAGES);
    Ok(true)
}

// ---------------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------------

async fn on_file_upload(ctx: &ServerContext, session: &Arc<Session>, req: FileUploadReq) -> Result<bool, ServerError> {
    let result = start_upload(ctx, session, &req).await;

    let response = match &result {
        Ok(ticket) => FileUploadRes {
            error_code: ErrorCode::Success,
            upload_id: ticket.upload_id,
            chunk_size: ticket.chunk_size,
            total_chunks: ticket.total_chunks,
        },
        Err(e) => FileUploadRes {
            error_code: e.error_code(),
            upload_id: UploadId(0),
            chunk_size: 0,
            total_chunks: 0,
        },
    };
    session.send_message(&response).await?;

    if let Err(e) = result {
        debug!(session = %session.id(), file = %req.file_name, error = %e, "Upload refused");
        return Ok(false);
    }
    ctx.stats
        .set(names::ACTIVE_TRANSFERS, ctx.transfers.active_count().await as i64);
    Ok(true)
}

async fn start_upload(
    ctx: &ServerContext,
    session: &Arc<Session>,
    req: &FileUploadReq,
) -> Result<UploadTicket, ServerError> {
    let sender = session.user_id().await.ok_or(ServerError::NotLoggedIn)?;
    ctx.transfers
        .start_upload(
            &req.file_name,
            req.file_size,
            &req.file_hash,
            &sender,
            req.receiver_id.as_deref(),
        )
        .await
}

async fn on_file_chunk(ctx: &ServerContext, session: &Arc<Session>, chunk: FileChunk) -> Result<bool, ServerError> {
    let user_id = session.user_id().await.ok_or(ServerError::NotLoggedIn)?;
    let info = ctx
        .transfers
        .get_transfer_info(chunk.upload_id)
        .await
        .ok_or(ServerError::UnknownTransfer(chunk.upload_id))?;
    if info.sender_id != user_id {
        return Err(ServerError::PermissionDenied(format!(
            "{} does not own {}",
            user_id, chunk.upload_id
        )));
    }

    let finished = ctx
        .transfers
        .process_chunk(chunk.upload_id, chunk.chunk_index, &chunk.data)
        .await?;
    if !finished {
        return Ok(true);
    }

    let result = ctx.transfers.complete(chunk.upload_id).await;
    ctx.stats
        .set(names::ACTIVE_TRANSFERS, ctx.transfers.active_count().await as i64);

    let notice = FileUploadCompleteNtf {
        error_code: code_of(&result),
        upload_id: chunk.upload_id,
        file_name: info.file_name,
        file_size: info.file_size,
        sender_id: info.sender_id,
    };
    session.send_message(&notice).await?;

    let done = match result {
        Ok(done) => done,
        Err(_) => return Ok(false),
    };

    if let Some(receiver) = &done.receiver_id {
        match ctx.sessions.find_by_user(receiver).await {
            Some(target) if target.id() != session.id() => {
                target.send_message(&notice).await?;
            }
            Some(_) => {}
            None => debug!(upload = %done.upload_id, receiver = %receiver, "Receiver offline"),
        }
    }
    ctx.stats.increment(names::TRANSFERS_COMPLETED);
    Ok(true)
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

async fn require_admin(ctx: &ServerContext, session: &Arc<Session>) -> Result<String, ServerError> {
    let user_id = session.user_id().await.ok_or(ServerError::NotLoggedIn)?;
    if !ctx.config.is_admin_user(&user_id) {
        return Err(ServerError::PermissionDenied(format!(
            "{} is not an administrator",
            user_id
        )));
    }
    Ok(user_id)
}

async fn on_admin_user_list(
    ctx: &ServerContext,
    session: &Arc<Session>,
    _req: AdminUserListReq,
) -> Result<bool, ServerError> {
    let result = require_admin(ctx, session).await;
    let users = match &result {
        Ok(_) => ctx.user_summaries().await,
        Err(_) => Vec::new(),
    };

    session
        .send_message(&AdminUserListRes {
            error_code: code_of(&result),
            users,
        })
        .await?;
    Ok(result.is_ok())
}

async fn on_kick_user(ctx: &ServerContext, session: &Arc<Session>, req: KickUserReq) -> Result<bool, ServerError> {
    let result = match require_admin(ctx, session).await {
        Ok(admin) => {
            let kicked = ctx.kick_user(&req.user_id).await;
            if kicked.is_ok() {
                info!(admin = %admin, user = %req.user_id, "User kicked over the chat port");
            }
            kicked
        }
        Err(e) => Err(e),
    };

    session
        .send_message(&KickUserRes {
            error_code: code_of(&result),
            user_id: req.user_id,
        })
        .await?;
    Ok(result.is_ok())
}
