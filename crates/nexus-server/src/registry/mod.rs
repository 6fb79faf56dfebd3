//! Owning, concurrently readable collections of live entities.
//!
//! Each registry guards its map with one `RwLock` and hands out `Arc`
//! clones. A handle says nothing about liveness once the lock is released:
//! callers re-resolve by id after any await that may have raced a removal.

mod rooms;
mod sessions;

pub use rooms::RoomRegistry;
pub use sessions::SessionRegistry;
