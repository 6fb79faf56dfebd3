use nexus_shared::{ErrorCode, FrameError, ProtocolError, RoomId, UploadId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Already logged in")]
    AlreadyLoggedIn,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Session is disconnecting")]
    SessionClosed,

    #[error("Session is not in a room")]
    NotInRoom,

    #[error("Session is already in room {0}")]
    AlreadyInRoom(RoomId),

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Room is full: {0}")]
    RoomFull(RoomId),

    #[error("Wrong room password")]
    WrongPassword,

    #[error("Session is already a member of the room")]
    AlreadyMember,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User {0} is not in the room")]
    UserNotInRoom(String),

    #[error("Too many {what} (limit {limit})")]
    CapacityExceeded { what: &'static str, limit: usize },

    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Invalid file: {0}")]
    InvalidFileFormat(String),

    #[error("Transfer storage error: {0}")]
    Storage(String),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(UploadId),

    #[error("Invalid chunk {index} for transfer {upload_id}")]
    InvalidChunk { upload_id: UploadId, index: u32 },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No handler for packet {0}")]
    UnknownMessageId(u16),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// The wire error code a failed request is answered with.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::InvalidUserId(_)
            | ServerError::UserNotFound(_)
            | ServerError::UserNotInRoom(_) => ErrorCode::InvalidUserId,
            ServerError::InvalidPassword => ErrorCode::InvalidPassword,
            ServerError::AlreadyLoggedIn => ErrorCode::UserAlreadyLoggedIn,
            ServerError::RoomNotFound(_) | ServerError::NotInRoom => ErrorCode::RoomNotFound,
            ServerError::RoomFull(_) | ServerError::CapacityExceeded { .. } => ErrorCode::RoomFull,
            ServerError::WrongPassword => ErrorCode::InvalidRoomPassword,
            ServerError::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            ServerError::InvalidFileFormat(_)
            | ServerError::UnknownTransfer(_)
            | ServerError::InvalidChunk { .. }
            | ServerError::Storage(_) => ErrorCode::InvalidFileFormat,
            ServerError::NotLoggedIn
            | ServerError::SessionClosed
            | ServerError::PermissionDenied(_)
            | ServerError::InvalidArgument(_)
            | ServerError::AlreadyInRoom(_)
            | ServerError::AlreadyMember => ErrorCode::InsufficientPermission,
            // Only uploads answer these with a code; disk or decode trouble
            // means the file did not make it.
            ServerError::Io(_)
            | ServerError::Protocol(_)
            | ServerError::Frame(_)
            | ServerError::UnknownMessageId(_)
            | ServerError::Internal(_) => ErrorCode::InvalidFileFormat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ServerError::AlreadyLoggedIn.error_code(),
            ErrorCode::UserAlreadyLoggedIn
        );
        assert_eq!(
            ServerError::RoomFull(RoomId(1)).error_code(),
            ErrorCode::RoomFull
        );
        assert_eq!(
            ServerError::WrongPassword.error_code(),
            ErrorCode::InvalidRoomPassword
        );
        assert_eq!(
            ServerError::FileTooLarge { size: 2, max: 1 }.error_code(),
            ErrorCode::FileTooLarge
        );
        assert_eq!(
            ServerError::NotLoggedIn.error_code(),
            ErrorCode::InsufficientPermission
        );
    }

    #[test]
    fn test_lookup_failures_map_to_invalid_user() {
        assert_eq!(
            ServerError::UserNotInRoom("bob".into()).error_code(),
            ErrorCode::InvalidUserId
        );
        assert_eq!(
            ServerError::InvalidChunk {
                upload_id: UploadId(1),
                index: 9
            }
            .error_code(),
            ErrorCode::InvalidFileFormat
        );
    }
}
