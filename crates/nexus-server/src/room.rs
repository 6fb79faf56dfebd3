use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nexus_shared::{RoomId, SessionId};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::ServerError;
use crate::registry::SessionRegistry;

struct RoomState {
    password: Option<String>,
    capacity: usize,
    /// Member session -> user id
    members: HashMap<SessionId, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub title: String,
    pub capacity: usize,
    pub has_password: bool,
    pub members: Vec<String>,
    pub entered_total: u64,
    pub created_at: DateTime<Utc>,
}

/// A capacity-bounded broadcast group.
///
/// Members are tracked by session id and re-resolved through the session
/// registry on every delivery.
pub struct ChatRoom {
    id: RoomId,
    title: String,
    state: RwLock<RoomState>,
    entered_total: AtomicU64,
    created_at: DateTime<Utc>,
}

impl ChatRoom {
    pub fn new(id: RoomId, title: String, capacity: usize, password: Option<String>) -> Self {
        Self {
            id,
            title,
            state: RwLock::new(RoomState {
                password: password.filter(|p| !p.is_empty()),
                capacity,
                members: HashMap::new(),
            }),
            entered_total: AtomicU64::new(0),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Admit a member. On success returns the user ids now in the room,
    /// the entrant included.
    pub async fn enter(
        &self,
        session_id: SessionId,
        user_id: &str,
        password: &str,
    ) -> Result<Vec<String>, ServerError> {
        let mut state = self.state.write().await;

        if let Some(expected) = &state.password {
            if expected != password {
                return Err(ServerError::WrongPassword);
            }
        }
        if state.members.len() >= state.capacity {
            return Err(ServerError::RoomFull(self.id));
        }
        if state.members.contains_key(&session_id) {
            return Err(ServerError::AlreadyMember);
        }

        state.members.insert(session_id, user_id.to_string());
        self.entered_total.fetch_add(1, Ordering::Relaxed);

        let mut members: Vec<String> = state.members.values().cloned().collect();
        members.sort();
        Ok(members)
    }

    /// Returns whether the session was a member.
    pub async fn leave(&self, session_id: SessionId) -> bool {
        self.state.write().await.members.remove(&session_id).is_some()
    }

    pub async fn contains(&self, session_id: SessionId) -> bool {
        self.state.read().await.members.contains_key(&session_id)
    }

    pub async fn member_ids(&self) -> Vec<SessionId> {
        self.state.read().await.members.keys().copied().collect()
    }

    pub async fn member_count(&self) -> usize {
        self.state.read().await.members.len()
    }

    /// Send to every member except `exclude`. Returns how many sessions
    /// accepted the bytes.
    pub async fn broadcast(
        &self,
        sessions: &SessionRegistry,
        bytes: Bytes,
        exclude: Option<SessionId>,
    ) -> usize {
        // Snapshot under the lock, deliver without it.
        let targets: Vec<SessionId> = {
            let state = self.state.read().await;
            state
                .members
                .keys()
                .copied()
                .filter(|id| Some(*id) != exclude)
                .collect()
        };

        let mut delivered = 0;
        for id in targets {
            if let Some(session) = sessions.find(id).await {
                if session.enqueue_send(bytes.clone()).await {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Send to the member logged in as `user_id`.
    pub async fn send_to_user(
        &self,
        sessions: &SessionRegistry,
        bytes: Bytes,
        user_id: &str,
    ) -> Result<(), ServerError> {
        let target = {
            let state = self.state.read().await;
            state
                .members
                .iter()
                .find(|(_, member)| member.as_str() == user_id)
                .map(|(id, _)| *id)
        };

        let session = match target {
            Some(id) => sessions.find(id).await,
            None => None,
        };
        match session {
            Some(session) => {
                session.enqueue_send(bytes).await;
                Ok(())
            }
            None => Err(ServerError::UserNotInRoom(user_id.to_string())),
        }
    }

    /// Applies to later entries only; current members stay.
    pub async fn set_password(&self, password: Option<String>) {
        self.state.write().await.password = password.filter(|p| !p.is_empty());
    }

    /// Applies to later entries only; current members stay.
    pub async fn set_capacity(&self, capacity: usize) {
        self.state.write().await.capacity = capacity;
    }

    pub async fn capacity(&self) -> usize {
        self.state.read().await.capacity
    }

    pub async fn has_password(&self) -> bool {
        self.state.read().await.password.is_some()
    }

    pub fn entered_total(&self) -> u64 {
        self.entered_total.load(Ordering::Relaxed)
    }

    pub async fn info(&self) -> RoomInfo {
        let state = self.state.read().await;
        let mut members: Vec<String> = state.members.values().cloned().collect();
        members.sort();
        RoomInfo {
            room_id: self.id,
            title: self.title.clone(),
            capacity: state.capacity,
            has_password: state.password.is_some(),
            members,
            entered_total: self.entered_total(),
            created_at: self.created_at,
        }
    }
}
