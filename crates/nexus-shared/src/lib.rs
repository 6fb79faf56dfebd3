//! # nexus-shared
//!
//! Wire-level definitions shared by the Nexus chat server and its clients:
//! the binary frame codec, packet identifiers, error codes, and the typed
//! payload messages carried inside frames.

pub mod constants;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod types;

pub use error::{FrameError, ProtocolError};
pub use frame::{Frame, FrameHeader};
pub use protocol::{ErrorCode, Message, PacketId};
pub use types::{RoomId, SessionId, UploadId};
