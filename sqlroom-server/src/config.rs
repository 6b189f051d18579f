use sqlroom_collab::RoomConfig;
use sqlroom_engine::EngineConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket listen address
    pub bind_addr: String,
    /// Health endpoint listen address (None = no health server)
    pub health_addr: Option<String>,
    /// Database, pool, cache and retry settings
    pub engine: EngineConfig,
    /// Room persistence settings
    pub rooms: RoomConfig,
    /// Accept room (CRDT) messages
    pub sync_enabled: bool,
    /// Require `{type:"auth"}` with this token before anything else
    pub auth_token: Option<String>,
    /// Queued outbound frames per connection before backpressure is logged
    pub backpressure_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
            health_addr: None,
            engine: EngineConfig::default(),
            rooms: RoomConfig::default(),
            sync_enabled: false,
            auth_token: None,
            backpressure_threshold: 1024,
        }
    }
}

impl ServerConfig {
    /// In-memory database, sync on, short debounce, ephemeral port.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            engine: EngineConfig::for_testing(),
            rooms: RoomConfig::for_testing(),
            sync_enabled: true,
            ..Self::default()
        }
    }
}
