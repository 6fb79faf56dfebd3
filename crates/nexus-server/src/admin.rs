//! Plaintext administrative channel.
//!
//! One command per line, one response line per command: `OK ...`,
//! `ERR ...`, or a single-line JSON document. When an admin token is
//! configured, `AUTH <token>` must come first.

use std::sync::Arc;
use std::time::Duration;

use nexus_shared::constants::PROTOCOL_VERSION;
use nexus_shared::{RoomId, UploadId};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::stats::names;

/// Admin connections idle this long are closed.
pub const ADMIN_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const HELP: &str = "AUTH HELP USERS SESSIONS KICK ROOMS CREATE_ROOM REMOVE_ROOM \
                    SET_CAPACITY SET_PASSWORD TRANSFERS CANCEL_TRANSFER STATS QUIT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Auth(String),
    Help,
    Users,
    Sessions,
    Kick(String),
    Rooms,
    CreateRoom { capacity: usize, title: String },
    RemoveRoom(RoomId),
    SetCapacity { room_id: RoomId, capacity: usize },
    SetPassword { room_id: RoomId, password: Option<String> },
    Transfers,
    CancelTransfer(UploadId),
    Stats,
    Quit,
}

impl AdminCommand {
    /// Parse one input line. The verb is case-insensitive.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match verb.to_ascii_uppercase().as_str() {
            "AUTH" => AdminCommand::Auth(one_arg(&args, "AUTH <token>")?.to_string()),
            "HELP" => AdminCommand::Help,
            "USERS" => AdminCommand::Users,
            "SESSIONS" => AdminCommand::Sessions,
            "KICK" => AdminCommand::Kick(one_arg(&args, "KICK <user_id>")?.to_string()),
            "ROOMS" => AdminCommand::Rooms,
            "CREATE_ROOM" => {
                let usage = "CREATE_ROOM <capacity> <title...>";
                let (capacity, title) = rest.split_once(char::is_whitespace).ok_or(usage)?;
                let title = title.trim();
                if title.is_empty() {
                    return Err(usage.to_string());
                }
                AdminCommand::CreateRoom {
                    capacity: parse_positive(capacity)?,
                    title: title.to_string(),
                }
            }
            "REMOVE_ROOM" => {
                AdminCommand::RemoveRoom(parse_room(one_arg(&args, "REMOVE_ROOM <room_id>")?)?)
            }
            "SET_CAPACITY" => match args.as_slice() {
                [room, capacity] => AdminCommand::SetCapacity {
                    room_id: parse_room(room)?,
                    capacity: parse_positive(capacity)?,
                },
                _ => return Err("SET_CAPACITY <room_id> <capacity>".to_string()),
            },
            "SET_PASSWORD" => match args.as_slice() {
                [room, password] => AdminCommand::SetPassword {
                    room_id: parse_room(room)?,
                    password: (*password != "-").then(|| password.to_string()),
                },
                _ => return Err("SET_PASSWORD <room_id> <password|->".to_string()),
            },
            "TRANSFERS" => AdminCommand::Transfers,
            "CANCEL_TRANSFER" => {
                let raw = one_arg(&args, "CANCEL_TRANSFER <upload_id>")?;
                let id = raw
                    .parse::<u64>()
                    .map_err(|_| format!("invalid upload id {:?}", raw))?;
                AdminCommand::CancelTransfer(UploadId(id))
            }
            "STATS" => AdminCommand::Stats,
            "QUIT" | "EXIT" => AdminCommand::Quit,
            "" => return Err("empty command".to_string()),
            other => return Err(format!("unknown command {:?}, try HELP", other)),
        };
        Ok(command)
    }

    /// Run a command against the server state and render the response line.
    pub async fn execute(&self, ctx: &ServerContext) -> String {
        match self {
            AdminCommand::Auth(_) => "OK already authenticated".to_string(),
            AdminCommand::Help => format!("OK {}", HELP),
            AdminCommand::Quit => "OK bye".to_string(),
            AdminCommand::Users => json(&ctx.user_summaries().await),
            AdminCommand::Sessions => {
                let mut sessions = Vec::new();
                for session in ctx.sessions.snapshot().await {
                    sessions.push(SessionRow {
                        session_id: session.id().0,
                        peer_addr: session.peer_addr().to_string(),
                        user_id: session.user_id().await,
                        room_id: session.current_room().await,
                        idle_secs: session.idle_for().as_secs(),
                    });
                }
                json(&sessions)
            }
            AdminCommand::Kick(user_id) => match ctx.kick_user(user_id).await {
                Ok(()) => format!("OK kicked {}", user_id),
                Err(e) => format!("ERR {}", e),
            },
            AdminCommand::Rooms => {
                let mut rooms = Vec::new();
                for room in ctx.rooms.list().await {
                    rooms.push(room.info().await);
                }
                json(&rooms)
            }
            AdminCommand::CreateRoom { capacity, title } => {
                match ctx.create_room(title, Some(*capacity), None).await {
                    Ok(room) => format!("OK {}", room.id().0),
                    Err(e) => format!("ERR {}", e),
                }
            }
            AdminCommand::RemoveRoom(room_id) => {
                if ctx.remove_room(*room_id).await {
                    format!("OK removed {}", room_id.0)
                } else {
                    format!("ERR no room {}", room_id.0)
                }
            }
            AdminCommand::SetCapacity { room_id, capacity } => match ctx.rooms.find(*room_id).await {
                Some(room) => {
                    room.set_capacity(*capacity).await;
                    format!("OK capacity {}", capacity)
                }
                None => format!("ERR no room {}", room_id.0),
            },
            AdminCommand::SetPassword { room_id, password } => match ctx.rooms.find(*room_id).await {
                Some(room) => {
                    room.set_password(password.clone()).await;
                    if password.is_some() {
                        "OK password set".to_string()
                    } else {
                        "OK password cleared".to_string()
                    }
                }
                None => format!("ERR no room {}", room_id.0),
            },
            AdminCommand::Transfers => json(&ctx.transfers.list().await),
            AdminCommand::CancelTransfer(upload_id) => {
                if ctx.transfers.cancel(*upload_id).await {
                    ctx.stats
                        .set(names::ACTIVE_TRANSFERS, ctx.transfers.active_count().await as i64);
                    format!("OK cancelled {}", upload_id.0)
                } else {
                    format!("ERR no transfer {}", upload_id.0)
                }
            }
            AdminCommand::Stats => {
                ctx.stats.set(names::ACTIVE_SESSIONS, ctx.sessions.count().await as i64);
                ctx.stats.set(names::ACTIVE_ROOMS, ctx.rooms.count().await as i64);
                ctx.stats
                    .set(names::ACTIVE_TRANSFERS, ctx.transfers.active_count().await as i64);
                json(&ctx.stats.snapshot())
            }
        }
    }
}

#[derive(Serialize)]
struct SessionRow {
    session_id: u64,
    peer_addr: String,
    user_id: Option<String>,
    room_id: Option<RoomId>,
    idle_secs: u64,
}

fn one_arg<'a>(args: &[&'a str], usage: &str) -> Result<&'a str, String> {
    match args {
        [arg] => Ok(arg),
        _ => Err(usage.to_string()),
    }
}

fn parse_room(raw: &str) -> Result<RoomId, String> {
    raw.parse::<u32>()
        .map(RoomId)
        .map_err(|_| format!("invalid room id {:?}", raw))
}

fn parse_positive(raw: &str) -> Result<usize, String> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("expected a positive number, got {:?}", raw)),
    }
}

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("ERR {}", e))
}

/// Accept admin connections and serve them one at a time until shutdown.
pub async fn run(ctx: Arc<ServerContext>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Admin connection opened");
                    let mut conn_shutdown = shutdown.clone();
                    tokio::select! {
                        _ = conn_shutdown.changed() => break,
                        result = serve_connection(&ctx, stream) => {
                            if let Err(e) = result {
                                debug!(peer = %peer, error = %e, "Admin connection error");
                            }
                        }
                    }
                    info!(peer = %peer, "Admin connection closed");
                }
                Err(e) => warn!(error = %e, "Admin accept failed"),
            }
        }
    }
    debug!("Admin listener stopped");
}

/// Compare a presented admin token in constant time.
fn token_matches(expected: &str, presented: &str) -> bool {
    let expected = expected.as_bytes();
    let presented = presented.as_bytes();
    !expected.is_empty()
        && expected.len() == presented.len()
        && expected.ct_eq(presented).unwrap_u8() == 1
}

async fn serve_connection(ctx: &ServerContext, stream: TcpStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut authenticated = ctx.config.admin_token.is_none();

    writer
        .write_all(format!("OK {} admin\n", PROTOCOL_VERSION).as_bytes())
        .await?;

    loop {
        let line = match tokio::time::timeout(ADMIN_IDLE_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                writer.write_all(b"ERR idle timeout\n").await?;
                return Ok(());
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let (response, quit) = match AdminCommand::parse(&line) {
            Err(usage) => (format!("ERR {}", usage), false),
            Ok(AdminCommand::Auth(token)) if !authenticated => {
                let expected = ctx.config.admin_token.as_deref().unwrap_or_default();
                if token_matches(expected, &token) {
                    authenticated = true;
                    ("OK authenticated".to_string(), false)
                } else {
                    warn!("Admin authentication failed");
                    ("ERR invalid token".to_string(), false)
                }
            }
            Ok(AdminCommand::Quit) => ("OK bye".to_string(), true),
            Ok(_) if !authenticated => ("ERR authentication required".to_string(), false),
            Ok(command) => {
                debug!(?command, "Admin command");
                (command.execute(ctx).await, false)
            }
        };

        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        if quit {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{enter, login, test_context};

    #[test]
    fn test_parse() {
        assert_eq!(AdminCommand::parse("users"), Ok(AdminCommand::Users));
        assert_eq!(
            AdminCommand::parse("KICK alice"),
            Ok(AdminCommand::Kick("alice".into()))
        );
        assert_eq!(
            AdminCommand::parse("CREATE_ROOM 10 Night Shift"),
            Ok(AdminCommand::CreateRoom {
                capacity: 10,
                title: "Night Shift".into()
            })
        );
        assert_eq!(
            AdminCommand::parse("SET_PASSWORD 3 -"),
            Ok(AdminCommand::SetPassword {
                room_id: RoomId(3),
                password: None
            })
        );
        assert_eq!(
            AdminCommand::parse("cancel_transfer 7"),
            Ok(AdminCommand::CancelTransfer(UploadId(7)))
        );
        assert!(AdminCommand::parse("KICK").is_err());
        assert!(AdminCommand::parse("CREATE_ROOM 0 Empty").is_err());
        assert!(AdminCommand::parse("CREATE_ROOM 5").is_err());
        assert!(AdminCommand::parse("SET_CAPACITY x 3").is_err());
        assert!(AdminCommand::parse("FLY").is_err());
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("letmein", "letmein"));
        assert!(!token_matches("letmein", "letmeout"));
        assert!(!token_matches("letmein", "letmein!"));
        assert!(!token_matches("letmein", ""));
        assert!(!token_matches("", ""));
    }

    #[tokio::test]
    async fn test_room_commands() {
        let (ctx, _dir) = test_context().await;

        let created = AdminCommand::CreateRoom {
            capacity: 3,
            title: "Ops".into(),
        }
        .execute(&ctx)
        .await;
        assert_eq!(created, "OK 2");

        let rooms: serde_json::Value =
            serde_json::from_str(&AdminCommand::Rooms.execute(&ctx).await).unwrap();
        assert_eq!(rooms[1]["title"], "Ops");
        assert_eq!(rooms[1]["capacity"], 3);

        let reply = AdminCommand::SetCapacity {
            room_id: RoomId(2),
            capacity: 9,
        }
        .execute(&ctx)
        .await;
        assert!(reply.starts_with("OK"));
        assert_eq!(ctx.rooms.find(RoomId(2)).await.unwrap().capacity().await, 9);

        let reply = AdminCommand::RemoveRoom(RoomId(2)).execute(&ctx).await;
        assert!(reply.starts_with("OK"));
        let reply = AdminCommand::RemoveRoom(RoomId(2)).execute(&ctx).await;
        assert!(reply.starts_with("ERR"));
    }

    #[tokio::test]
    async fn test_user_commands_and_stats() {
        let (ctx, _dir) = test_context().await;
        let lobby = ctx.rooms.list().await[0].id();
        let (a, mut pa) = login(&ctx, "alice").await;
        enter(&ctx, &a, &mut pa, lobby).await;

        let users: serde_json::Value =
            serde_json::from_str(&AdminCommand::Users.execute(&ctx).await).unwrap();
        assert_eq!(users[0]["user_id"], "alice");
        assert_eq!(users[0]["room_id"], lobby.0);

        let stats: serde_json::Value =
            serde_json::from_str(&AdminCommand::Stats.execute(&ctx).await).unwrap();
        assert_eq!(stats["counters"]["sessions.active"], 1);
        assert_eq!(stats["counters"]["logins"], 1);

        assert_eq!(
            AdminCommand::Kick("alice".into()).execute(&ctx).await,
            "OK kicked alice"
        );
        assert!(AdminCommand::Kick("alice".into())
            .execute(&ctx)
            .await
            .starts_with("ERR"));
    }
}
