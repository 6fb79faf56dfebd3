/// Protocol version announced by the server in diagnostics output
pub const PROTOCOL_VERSION: &str = "nexus/1.0";

/// Default chat listen port
pub const DEFAULT_CHAT_PORT: u16 = 9000;

/// Default administrative listen port
pub const DEFAULT_ADMIN_PORT: u16 = 9001;

/// Frame header size in bytes: id (2) + length (2) + crc32 (4)
pub const HEADER_SIZE: usize = 8;

/// Maximum total frame size, header included (64 KiB)
pub const MAX_PACKET_SIZE: usize = 65_536;

/// Maximum payload a single frame may declare
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Per-read receive buffer size
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Per-write send buffer size
pub const SEND_BUFFER_SIZE: usize = 4096;

/// Maximum concurrent client sessions
pub const MAX_CLIENTS: usize = 1000;

/// Maximum number of chat rooms
pub const MAX_ROOMS: usize = 100;

/// Maximum upload size in bytes (100 MiB)
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default upload chunk size (32 KiB, fits in one frame with headroom)
pub const FILE_CHUNK_SIZE: usize = 32 * 1024;

/// Default room capacity when none is given at creation
pub const DEFAULT_ROOM_CAPACITY: usize = 50;

/// Longest accepted user id
pub const MAX_USER_ID_LEN: usize = 32;
