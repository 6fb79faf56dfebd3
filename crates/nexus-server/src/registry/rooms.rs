use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nexus_shared::RoomId;
use tokio::sync::RwLock;

use crate::error::ServerError;
use crate::room::ChatRoom;

pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<ChatRoom>>>,
    next_id: AtomicU32,
    max_rooms: usize,
    default_capacity: usize,
}

impl RoomRegistry {
    pub fn new(max_rooms: usize, default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            max_rooms,
            default_capacity,
        }
    }

    pub async fn create_room(
        &self,
        title: &str,
        capacity: Option<usize>,
        password: Option<String>,
    ) -> Result<Arc<ChatRoom>, ServerError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ServerError::InvalidArgument("room title must not be empty".into()));
        }

        let mut rooms = self.rooms.write().await;
        if rooms.len() >= self.max_rooms {
            return Err(ServerError::CapacityExceeded {
                what: "rooms",
                limit: self.max_rooms,
            });
        }

        let id = RoomId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let room = Arc::new(ChatRoom::new(
            id,
            title.to_string(),
            capacity.unwrap_or(self.default_capacity),
            password,
        ));
        rooms.insert(id, room.clone());
        Ok(room)
    }

    /// Remove the room from the registry. Detaching its members is the
    /// caller's job.
    pub async fn remove_room(&self, id: RoomId) -> Option<Arc<ChatRoom>> {
        self.rooms.write().await.remove(&id)
    }

    pub async fn find(&self, id: RoomId) -> Option<Arc<ChatRoom>> {
        self.rooms.read().await.get(&id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Every room, ordered by id.
    pub async fn list(&self) -> Vec<Arc<ChatRoom>> {
        let mut rooms: Vec<_> = self.rooms.read().await.values().cloned().collect();
        rooms.sort_by_key(|r| r.id());
        rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_find_remove() {
        let registry = RoomRegistry::new(2, 10);
        let lobby = registry.create_room("Lobby", None, None).await.unwrap();
        let dev = registry.create_room(" Dev ", Some(3), None).await.unwrap();

        assert_eq!(lobby.id(), RoomId(1));
        assert_eq!(dev.title(), "Dev");
        assert_eq!(lobby.capacity().await, 10);
        assert_eq!(dev.capacity().await, 3);

        assert!(matches!(
            registry.create_room("Third", None, None).await,
            Err(ServerError::CapacityExceeded { what: "rooms", .. })
        ));

        assert!(registry.remove_room(lobby.id()).await.is_some());
        assert!(registry.find(lobby.id()).await.is_none());
        assert!(registry.remove_room(lobby.id()).await.is_none());

        // Ids are never reused.
        let again = registry.create_room("Lobby", None, None).await.unwrap();
        assert_eq!(again.id(), RoomId(3));
        let ids: Vec<_> = registry.list().await.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![RoomId(2), RoomId(3)]);
    }

    #[tokio::test]
    async fn test_empty_title_rejected() {
        let registry = RoomRegistry::new(5, 10);
        assert!(registry.create_room("   ", None, None).await.is_err());
        assert_eq!(registry.count().await, 0);
    }
}
