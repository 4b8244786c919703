use once_cell::sync::Lazy;
use tracing::warn;

/// Chunk header: message id + flags.
pub const CHUNK_HEADER_LEN: usize = 2;
/// Default chunk payload: just under the 16 KiB data channel message ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 - CHUNK_HEADER_LEN;
/// Smallest chunk payload accepted; smaller values are raised to this floor.
pub const MIN_CHUNK_SIZE: usize = 256;
pub const DEFAULT_LOW_WATER_MARK: usize = 256 * 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

pub const BOOTSTRAP_CHANNEL_ID: u16 = 0;
pub const DATA_CHANNEL_ID: u16 = 1;

const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Configuration for the connections a `Peer` negotiates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub bootstrap_label: String,
    pub data_label: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::stun(*url))
                .collect(),
            bootstrap_label: "bootstrap".to_string(),
            data_label: "data".to_string(),
        }
    }
}

impl PeerConfig {
    /// Reads `PEER_CHANNEL_ICE_SERVERS` (comma separated URLs) and
    /// `PEER_CHANNEL_DISABLE_STUN` on top of the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("PEER_CHANNEL_ICE_SERVERS") {
            let servers: Vec<IceServer> = value
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect();
            if !servers.is_empty() {
                config.ice_servers = servers;
            }
        }
        if env_flag("PEER_CHANNEL_DISABLE_STUN") {
            config.ice_servers.clear();
        }
        config
    }

    /// Configuration without any STUN/TURN servers (host candidates only).
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub low_water_mark: usize,
    pub max_message_bytes: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl ChunkConfig {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self {
            chunk_size: parse_usize_env(
                "PEER_CHANNEL_CHUNK_BYTES",
                DEFAULT_CHUNK_SIZE,
                MIN_CHUNK_SIZE,
            ),
            low_water_mark: parse_usize_env(
                "PEER_CHANNEL_LOW_WATER_MARK",
                DEFAULT_LOW_WATER_MARK,
                0,
            ),
            max_message_bytes: parse_usize_env(
                "PEER_CHANNEL_MAX_MESSAGE_BYTES",
                DEFAULT_MAX_MESSAGE_BYTES,
                MIN_CHUNK_SIZE,
            ),
        }
    }

    /// Payload bytes per chunk with the floor applied.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(MIN_CHUNK_SIZE)
    }
}

pub fn runtime_config() -> &'static ChunkConfig {
    static CONFIG: Lazy<ChunkConfig> = Lazy::new(ChunkConfig::from_env);
    &CONFIG
}

fn env_flag(var: &str) -> bool {
    match std::env::var(var) {
        Ok(value) => !matches!(value.trim(), "" | "0" | "false" | "no"),
        Err(_) => false,
    }
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "peer_channel::config",
                    var, parsed, min, default, "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "peer_channel::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse config value from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_floor_applies() {
        let config = ChunkConfig::with_chunk_size(1);
        assert_eq!(config.effective_chunk_size(), MIN_CHUNK_SIZE);
        let config = ChunkConfig::with_chunk_size(4096);
        assert_eq!(config.effective_chunk_size(), 4096);
    }

    #[test]
    fn runtime_config_is_cached() {
        let first = runtime_config();
        assert!(std::ptr::eq(first, runtime_config()));
        assert!(first.effective_chunk_size() >= MIN_CHUNK_SIZE);
    }

    #[test]
    fn default_peer_config_uses_public_stun() {
        let config = PeerConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
        assert!(PeerConfig::localhost().ice_servers.is_empty());
    }

    #[test]
    fn ice_servers_from_env() {
        // SAFETY: no other test reads these variables.
        unsafe { std::env::set_var("PEER_CHANNEL_ICE_SERVERS", "stun:a:1, ,stun:b:2") };
        let config = PeerConfig::from_env();
        assert_eq!(
            config.ice_servers,
            vec![IceServer::stun("stun:a:1"), IceServer::stun("stun:b:2")]
        );

        unsafe { std::env::set_var("PEER_CHANNEL_DISABLE_STUN", "1") };
        assert!(PeerConfig::from_env().ice_servers.is_empty());
        unsafe {
            std::env::remove_var("PEER_CHANNEL_ICE_SERVERS");
            std::env::remove_var("PEER_CHANNEL_DISABLE_STUN");
        }
    }

    #[test]
    fn unparsable_env_value_falls_back() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("PEER_CHANNEL_TEST_PARSE", "lots") };
        assert_eq!(parse_usize_env("PEER_CHANNEL_TEST_PARSE", 42, 1), 42);
        unsafe { std::env::set_var("PEER_CHANNEL_TEST_PARSE", "0") };
        assert_eq!(parse_usize_env("PEER_CHANNEL_TEST_PARSE", 42, 1), 42);
        unsafe { std::env::set_var("PEER_CHANNEL_TEST_PARSE", "512") };
        assert_eq!(parse_usize_env("PEER_CHANNEL_TEST_PARSE", 42, 1), 512);
    }
}
