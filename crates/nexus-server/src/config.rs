//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use nexus_shared::constants::{
    DEFAULT_ADMIN_PORT, DEFAULT_CHAT_PORT, DEFAULT_ROOM_CAPACITY, FILE_CHUNK_SIZE, MAX_CLIENTS,
    MAX_FILE_SIZE, MAX_PAYLOAD_SIZE, MAX_ROOMS, RECV_BUFFER_SIZE, SEND_BUFFER_SIZE,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface both listeners bind to.
    /// Env: `BIND_HOST`
    /// Default: `0.0.0.0`
    pub bind_host: IpAddr,

    /// Chat protocol port. `0` picks an ephemeral port.
    /// Env: `CHAT_PORT`
    /// Default: `9000`
    pub chat_port: u16,

    /// Administrative line-protocol port.
    /// Env: `ADMIN_PORT`
    /// Default: `9001`
    pub admin_port: u16,

    /// Ceiling on concurrent sessions; accepts beyond it are refused.
    /// Env: `MAX_CLIENTS`
    pub max_clients: usize,

    /// Ceiling on live rooms.
    /// Env: `MAX_ROOMS`
    pub max_rooms: usize,

    /// Largest upload accepted, in bytes (100 MiB).
    /// Env: `MAX_FILE_SIZE`
    pub max_file_size: u64,

    /// Size of each socket read.
    /// Env: `RECV_BUFFER_SIZE`
    pub recv_buffer_size: usize,

    /// Kernel send buffer hint for accepted sockets.
    /// Env: `SEND_BUFFER_SIZE`
    pub send_buffer_size: usize,

    /// Writes a session may queue behind the one in flight before it is
    /// considered stalled and disconnected.
    /// Env: `MAX_PENDING_SENDS`
    /// Default: `1024`
    pub max_pending_sends: usize,

    /// Number of completion workers (and runtime threads).
    /// Env: `WORKER_THREADS`
    /// Default: twice the available parallelism.
    pub worker_threads: usize,

    /// Bound on queued, unprocessed completion events.
    /// Env: `COMPLETION_QUEUE_DEPTH`
    pub completion_queue_depth: usize,

    /// Upload chunk size handed to clients.
    /// Env: `FILE_CHUNK_SIZE`
    pub file_chunk_size: usize,

    /// Directory holding in-flight and finished uploads.
    /// Env: `TRANSFER_DIR`
    /// Default: `./transfers`
    pub transfer_dir: PathBuf,

    /// Incomplete uploads older than this are swept.
    /// Env: `TRANSFER_MAX_AGE_SECS`
    pub transfer_max_age: Duration,

    /// How often the transfer sweep runs.
    /// Env: `CLEANUP_INTERVAL_SECS`
    pub cleanup_interval: Duration,

    /// Capacity of rooms created without an explicit one.
    /// Env: `ROOM_CAPACITY`
    pub room_capacity: usize,

    /// Rooms created at startup.
    /// Env: `DEFAULT_ROOMS` (comma-separated titles)
    /// Default: `Lobby`
    pub default_rooms: Vec<String>,

    /// User ids allowed to issue admin packets over the chat port.
    /// Env: `ADMIN_USERS` (comma-separated)
    pub admin_users: Vec<String>,

    /// Token the admin channel requires before any other command. Without
    /// one the admin listener only binds the loopback interface.
    /// Env: `ADMIN_TOKEN`
    /// Default: none
    pub admin_token: Option<String>,

    /// Disconnect sessions silent for longer than this. Zero disables.
    /// Env: `HEARTBEAT_TIMEOUT_SECS`
    pub heartbeat_timeout: Duration,

    /// Receive buffers preallocated in the pool.
    /// Env: `BUFFER_POOL_INITIAL`
    pub buffer_pool_initial: usize,

    /// Idle receive buffers the pool keeps; extras are dropped.
    /// Env: `BUFFER_POOL_MAX`
    pub buffer_pool_max: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self {
            bind_host: IpAddr::from([0, 0, 0, 0]),
            chat_port: DEFAULT_CHAT_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
            max_clients: MAX_CLIENTS,
            max_rooms: MAX_ROOMS,
            max_file_size: MAX_FILE_SIZE,
            recv_buffer_size: RECV_BUFFER_SIZE,
            send_buffer_size: SEND_BUFFER_SIZE,
            max_pending_sends: 1024,
            worker_threads: parallelism * 2,
            completion_queue_depth: 4096,
            file_chunk_size: FILE_CHUNK_SIZE,
            transfer_dir: PathBuf::from("./transfers"),
            transfer_max_age: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            room_capacity: DEFAULT_ROOM_CAPACITY,
            default_rooms: vec!["Lobby".to_string()],
            admin_users: Vec::new(),
            admin_token: None,
            heartbeat_timeout: Duration::ZERO,
            buffer_pool_initial: 100,
            buffer_pool_max: 1000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        parse_into(&lookup, "BIND_HOST", &mut config.bind_host);
        parse_into(&lookup, "CHAT_PORT", &mut config.chat_port);
        parse_into(&lookup, "ADMIN_PORT", &mut config.admin_port);
        parse_into(&lookup, "MAX_CLIENTS", &mut config.max_clients);
        parse_into(&lookup, "MAX_ROOMS", &mut config.max_rooms);
        parse_into(&lookup, "MAX_FILE_SIZE", &mut config.max_file_size);
        parse_into(&lookup, "RECV_BUFFER_SIZE", &mut config.recv_buffer_size);
        parse_into(&lookup, "SEND_BUFFER_SIZE", &mut config.send_buffer_size);
        parse_into(&lookup, "MAX_PENDING_SENDS", &mut config.max_pending_sends);
        parse_into(&lookup, "WORKER_THREADS", &mut config.worker_threads);
        parse_into(
            &lookup,
            "COMPLETION_QUEUE_DEPTH",
            &mut config.completion_queue_depth,
        );
        parse_into(&lookup, "FILE_CHUNK_SIZE", &mut config.file_chunk_size);
        parse_into(&lookup, "ROOM_CAPACITY", &mut config.room_capacity);
        parse_into(&lookup, "BUFFER_POOL_INITIAL", &mut config.buffer_pool_initial);
        parse_into(&lookup, "BUFFER_POOL_MAX", &mut config.buffer_pool_max);

        parse_secs_into(&lookup, "TRANSFER_MAX_AGE_SECS", &mut config.transfer_max_age);
        parse_secs_into(&lookup, "CLEANUP_INTERVAL_SECS", &mut config.cleanup_interval);
        parse_secs_into(
            &lookup,
            "HEARTBEAT_TIMEOUT_SECS",
            &mut config.heartbeat_timeout,
        );

        if let Some(path) = lookup("TRANSFER_DIR") {
            config.transfer_dir = PathBuf::from(path);
        }

        if let Some(rooms) = lookup("DEFAULT_ROOMS") {
            config.default_rooms = split_list(&rooms);
        }

        if let Some(users) = lookup("ADMIN_USERS") {
            config.admin_users = split_list(&users);
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        config.sanitize();
        config
    }

    /// Clamp values that would make the server unusable.
    fn sanitize(&mut self) {
        if self.worker_threads == 0 {
            tracing::warn!("WORKER_THREADS must be positive, using 1");
            self.worker_threads = 1;
        }
        if self.recv_buffer_size == 0 {
            self.recv_buffer_size = RECV_BUFFER_SIZE;
        }
        // The socket option takes a u32.
        if self.send_buffer_size == 0 || u32::try_from(self.send_buffer_size).is_err() {
            tracing::warn!(
                value = self.send_buffer_size,
                "SEND_BUFFER_SIZE out of range, using default"
            );
            self.send_buffer_size = SEND_BUFFER_SIZE;
        }
        if self.max_pending_sends == 0 {
            tracing::warn!("MAX_PENDING_SENDS must be positive, using default");
            self.max_pending_sends = 1024;
        }
        if self.completion_queue_depth == 0 {
            self.completion_queue_depth = 1;
        }
        // A chunk plus its envelope must fit in one frame.
        let max_chunk = MAX_PAYLOAD_SIZE - 64;
        if self.file_chunk_size == 0 || self.file_chunk_size > max_chunk {
            tracing::warn!(
                value = self.file_chunk_size,
                "FILE_CHUNK_SIZE out of range, using default"
            );
            self.file_chunk_size = FILE_CHUNK_SIZE;
        }
    }

    pub fn chat_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.chat_port)
    }

    /// The admin listener address. Falls back to loopback when no
    /// `admin_token` guards the channel.
    pub fn admin_addr(&self) -> SocketAddr {
        let host = match (&self.admin_token, self.bind_host) {
            (Some(_), host) => host,
            (None, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (None, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(host, self.admin_port)
    }

    pub fn is_admin_user(&self, user_id: &str) -> bool {
        self.admin_users.iter().any(|u| u == user_id)
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
            }
        }
    }
}

fn parse_secs_into<F>(lookup: &F, key: &str, target: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    let mut secs = target.as_secs();
    parse_into(lookup, key, &mut secs);
    *target = Duration::from_secs(secs);
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.chat_port, 9000);
        assert_eq!(config.admin_port, 9001);
        assert_eq!(config.max_clients, 1000);
        assert_eq!(config.max_rooms, 100);
        assert_eq!(config.max_file_size, 100 * 1024 * 1024);
        assert_eq!(config.recv_buffer_size, 4096);
        assert_eq!(config.send_buffer_size, 4096);
        assert!(config.worker_threads >= 2);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("CHAT_PORT", "7000"),
            ("MAX_ROOMS", "3"),
            ("DEFAULT_ROOMS", "Lobby, Dev ,,Ops"),
            ("ADMIN_USERS", "root"),
            ("ADMIN_TOKEN", "s3cret"),
            ("HEARTBEAT_TIMEOUT_SECS", "30"),
        ]));
        assert_eq!(config.chat_port, 7000);
        assert_eq!(config.max_rooms, 3);
        assert_eq!(config.default_rooms, vec!["Lobby", "Dev", "Ops"]);
        assert!(config.is_admin_user("root"));
        assert!(!config.is_admin_user("alice"));
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("CHAT_PORT", "not-a-port"),
            ("WORKER_THREADS", "0"),
            ("FILE_CHUNK_SIZE", "999999"),
            ("ADMIN_TOKEN", ""),
        ]));
        assert_eq!(config.chat_port, 9000);
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.file_chunk_size, FILE_CHUNK_SIZE);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_unguarded_admin_channel_binds_loopback() {
        let open = ServerConfig::default();
        assert!(open.chat_addr().ip().is_unspecified());
        assert!(open.admin_addr().ip().is_loopback());
        assert_eq!(open.admin_addr().port(), 9001);

        let v6 = ServerConfig::from_lookup(lookup_from(&[("BIND_HOST", "::")]));
        assert_eq!(v6.admin_addr().ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));

        let guarded = ServerConfig::from_lookup(lookup_from(&[("ADMIN_TOKEN", "s3cret")]));
        assert!(guarded.admin_addr().ip().is_unspecified());
    }

    #[test]
    fn test_send_settings_are_clamped() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("SEND_BUFFER_SIZE", "8589934592"),
            ("MAX_PENDING_SENDS", "0"),
        ]));
        assert_eq!(config.send_buffer_size, SEND_BUFFER_SIZE);
        assert_eq!(config.max_pending_sends, 1024);

        let config = ServerConfig::from_lookup(lookup_from(&[
            ("SEND_BUFFER_SIZE", "0"),
            ("MAX_PENDING_SENDS", "16"),
        ]));
        assert_eq!(config.send_buffer_size, SEND_BUFFER_SIZE);
        assert_eq!(config.max_pending_sends, 16);
    }
}
