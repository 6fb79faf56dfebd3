use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::types::{RoomId, SessionId, UploadId};

/// Every message id the protocol defines.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketId {
    // Authentication and liveness (1000~)
    LoginReq = 1001,
    LoginRes = 1002,
    LogoutReq = 1003,
    LogoutRes = 1004,
    HeartbeatReq = 1005,
    HeartbeatRes = 1006,

    // Chat rooms (2000~)
    EnterRoomReq = 2001,
    EnterRoomRes = 2002,
    NewUserInRoomNtf = 2003,
    LeaveRoomReq = 2004,
    UserLeftRoomNtf = 2005,
    RoomChatReq = 2006,
    RoomChatNtf = 2007,

    // File transfer (3000~)
    FileUploadReq = 3001,
    FileUploadRes = 3002,
    FileChunkSend = 3003,
    FileUploadCompleteNtf = 3004,

    // Administration (9000~)
    AdminUserListReq = 9001,
    AdminUserListRes = 9002,
    KickUserReq = 9003,
    KickUserRes = 9004,
}

impl PacketId {
    /// Convert from the wire value, `None` for ids the protocol does not define.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1001 => Some(PacketId::LoginReq),
            1002 => Some(PacketId::LoginRes),
            1003 => Some(PacketId::LogoutReq),
            1004 => Some(PacketId::LogoutRes),
            1005 => Some(PacketId::HeartbeatReq),
            1006 => Some(PacketId::HeartbeatRes),

            2001 => Some(PacketId::EnterRoomReq),
            2002 => Some(PacketId::EnterRoomRes),
            2003 => Some(PacketId::NewUserInRoomNtf),
            2004 => Some(PacketId::LeaveRoomReq),
            2005 => Some(PacketId::UserLeftRoomNtf),
            2006 => Some(PacketId::RoomChatReq),
            2007 => Some(PacketId::RoomChatNtf),

            3001 => Some(PacketId::FileUploadReq),
            3002 => Some(PacketId::FileUploadRes),
            3003 => Some(PacketId::FileChunkSend),
            3004 => Some(PacketId::FileUploadCompleteNtf),

            9001 => Some(PacketId::AdminUserListReq),
            9002 => Some(PacketId::AdminUserListRes),
            9003 => Some(PacketId::KickUserReq),
            9004 => Some(PacketId::KickUserRes),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, *self as u16)
    }
}

/// Result codes carried in response payloads.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success = 0,
    InvalidUserId = 1001,
    InvalidPassword = 1002,
    UserAlreadyLoggedIn = 1003,
    RoomNotFound = 2001,
    RoomFull = 2002,
    InvalidRoomPassword = 2003,
    FileTooLarge = 3001,
    InvalidFileFormat = 3002,
    InsufficientPermission = 9001,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::Success),
            1001 => Some(ErrorCode::InvalidUserId),
            1002 => Some(ErrorCode::InvalidPassword),
            1003 => Some(ErrorCode::UserAlreadyLoggedIn),
            2001 => Some(ErrorCode::RoomNotFound),
            2002 => Some(ErrorCode::RoomFull),
            2003 => Some(ErrorCode::InvalidRoomPassword),
            3001 => Some(ErrorCode::FileTooLarge),
            3002 => Some(ErrorCode::InvalidFileFormat),
            9001 => Some(ErrorCode::InsufficientPermission),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

// Error codes travel as their numeric value, not as a variant index.
impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i32::deserialize(deserializer)?;
        ErrorCode::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown error code {}", code)))
    }
}

/// A typed payload bound to its packet id.
///
/// Payloads are bincode-encoded; the frame header carries the id and the
/// checksum.
pub trait Message: Serialize + DeserializeOwned {
    const ID: PacketId;

    fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(payload)?)
    }

    /// Serialize and frame this message, ready for the wire.
    fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(Frame::new(Self::ID.as_u16(), Bytes::from(self.to_payload()?)))
    }

    /// Encode straight to wire bytes (header + payload).
    fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(self.to_frame()?.encode()?)
    }

    /// Decode from a frame, checking that the id matches.
    fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        if frame.message_id != Self::ID.as_u16() {
            return Err(ProtocolError::UnexpectedPacket {
                expected: Self::ID.as_u16(),
                actual: frame.message_id,
            });
        }
        Self::from_payload(&frame.payload)
    }
}

macro_rules! bind_packet {
    ($($ty:ty => $id:ident),* $(,)?) => {
        $(impl Message for $ty {
            const ID: PacketId = PacketId::$id;
        })*
    };
}

// ---------------------------------------------------------------------------
// Authentication and liveness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginReq {
    pub user_id: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginRes {
    pub error_code: ErrorCode,
    pub session_id: SessionId,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogoutReq;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogoutRes {
    pub error_code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReq {
    pub client_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRes {
    pub client_time_ms: u64,
    pub server_time_ms: u64,
}

// ---------------------------------------------------------------------------
// Chat rooms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterRoomReq {
    pub room_id: RoomId,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterRoomRes {
    pub error_code: ErrorCode,
    pub room_id: RoomId,
    pub title: String,
    /// User ids already in the room, the entrant included
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUserInRoomNtf {
    pub room_id: RoomId,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRoomReq;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLeftRoomNtf {
    pub room_id: RoomId,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomChatReq {
    pub message: String,
    /// Deliver only to this member (and echo to the sender)
    pub whisper_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomChatNtf {
    pub room_id: RoomId,
    pub sender: String,
    pub message: String,
    pub whisper: bool,
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUploadReq {
    pub file_name: String,
    pub file_size: u64,
    /// Hex-encoded BLAKE3 digest of the whole file; empty to skip verification
    pub file_hash: String,
    pub receiver_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUploadRes {
    pub error_code: ErrorCode,
    pub upload_id: UploadId,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    pub upload_id: UploadId,
    pub chunk_index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUploadCompleteNtf {
    pub error_code: ErrorCode,
    pub upload_id: UploadId,
    pub file_name: String,
    pub file_size: u64,
    pub sender_id: String,
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminUserListReq;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: String,
    pub session_id: SessionId,
    pub room_id: Option<RoomId>,
    pub peer_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminUserListRes {
    pub error_code: ErrorCode,
    pub users: Vec<UserSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickUserReq {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickUserRes {
    pub error_code: ErrorCode,
    pub user_id: String,
}

bind_packet! {
    LoginReq => LoginReq,
    LoginRes => LoginRes,
    LogoutReq => LogoutReq,
    LogoutRes => LogoutRes,
    HeartbeatReq => HeartbeatReq,
    HeartbeatRes => HeartbeatRes,
    EnterRoomReq => EnterRoomReq,
    EnterRoomRes => EnterRoomRes,
    NewUserInRoomNtf => NewUserInRoomNtf,
    LeaveRoomReq => LeaveRoomReq,
    UserLeftRoomNtf => UserLeftRoomNtf,
    RoomChatReq => RoomChatReq,
    RoomChatNtf => RoomChatNtf,
    FileUploadReq => FileUploadReq,
    FileUploadRes => FileUploadRes,
    FileChunk => FileChunkSend,
    FileUploadCompleteNtf => FileUploadCompleteNtf,
    AdminUserListReq => AdminUserListReq,
    AdminUserListRes => AdminUserListRes,
    KickUserReq => KickUserReq,
    KickUserRes => KickUserRes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    #[test]
    fn test_packet_id_wire_values() {
        for id in [
            PacketId::LoginReq,
            PacketId::HeartbeatRes,
            PacketId::RoomChatNtf,
            PacketId::FileChunkSend,
            PacketId::KickUserRes,
        ] {
            assert_eq!(PacketId::from_u16(id.as_u16()), Some(id));
        }
        assert_eq!(PacketId::from_u16(4242), None);
        assert_eq!(PacketId::EnterRoomRes.as_u16(), 2002);
    }

    #[test]
    fn test_message_through_frame_codec() {
        let req = EnterRoomReq {
            room_id: RoomId(3),
            password: "secret".to_string(),
        };

        let wire = req.to_bytes().unwrap();
        let (decoded, consumed) = frame::decode(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded.message_id, 2001);
        assert_eq!(EnterRoomReq::from_frame(&decoded).unwrap(), req);
    }

    #[test]
    fn test_from_frame_rejects_other_id() {
        let frame = LogoutReq.to_frame().unwrap();
        assert!(matches!(
            LoginReq::from_frame(&frame),
            Err(ProtocolError::UnexpectedPacket {
                expected: 1001,
                actual: 1003
            })
        ));
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(LoginReq::from_payload(&[0xFF; 3]).is_err());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::Success.code(), 0);
        assert_eq!(ErrorCode::UserAlreadyLoggedIn.code(), 1003);
        assert_eq!(ErrorCode::RoomFull.code(), 2002);
        assert_eq!(ErrorCode::InsufficientPermission.code(), 9001);
        assert!(ErrorCode::Success.is_success());
        assert!(!ErrorCode::FileTooLarge.is_success());
        assert_eq!(ErrorCode::from_code(2003), Some(ErrorCode::InvalidRoomPassword));
        assert_eq!(ErrorCode::from_code(7), None);
    }

    #[test]
    fn test_error_code_is_numeric_on_the_wire() {
        let payload = LogoutRes {
            error_code: ErrorCode::RoomFull,
        }
        .to_payload()
        .unwrap();
        assert_eq!(payload, 2002i32.to_le_bytes().to_vec());
    }
}
