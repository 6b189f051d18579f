use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use sqlroom_engine::{DatabaseConfig, DEFAULT_NAMESPACE, MEMORY_PATH};
use sqlroom_server::{shutdown_signal, ServerConfig, SqlRoomServer};

#[derive(Parser, Debug)]
#[command(name = "sqlroom-server")]
#[command(version, about = "Shared SQL query and collaborative room server over WebSocket")]
struct Cli {
    /// Database file, or :memory:
    #[arg(long, default_value = MEMORY_PATH)]
    db_path: String,

    #[arg(long, default_value_t = 4000)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Serve /healthz, /readyz and /version on this port
    #[arg(long)]
    health_port: Option<u16>,

    /// Require clients to authenticate with this token
    #[arg(long)]
    auth_token: Option<String>,

    /// Enable collaborative room sync
    #[arg(long)]
    sync: bool,

    /// Dedicated database file for metadata tables
    #[arg(long)]
    meta_db: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    meta_namespace: String,

    #[arg(long, default_value_t = 500)]
    save_debounce_ms: u64,

    /// Result cache directory (default: temporary)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long)]
    worker_threads: Option<usize>,

    /// Let clients seed empty rooms with full snapshots. Defaults to on
    /// when sync runs against an in-memory database.
    #[arg(long)]
    allow_client_snapshots: bool,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            health_addr: self.health_port.map(|port| format!("{}:{port}", self.host)),
            sync_enabled: self.sync,
            auth_token: self.auth_token,
            ..ServerConfig::default()
        };

        config.engine.registry.database = DatabaseConfig::with_path(self.db_path);
        config.engine.registry.pool.threads = self.worker_threads;
        config.engine.cache.path = self.cache_dir;
        config.engine.meta.namespace = self.meta_namespace;
        config.engine.meta.meta_db = self.meta_db;

        let in_memory = config.engine.registry.database.is_memory();
        config.rooms.save_debounce = Duration::from_millis(self.save_debounce_ms);
        config.rooms.allow_client_snapshots =
            self.allow_client_snapshots || (self.sync && in_memory);
        config
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    log::info!("Using database {}", config.engine.registry.database.path);
    match &config.engine.meta.meta_db {
        Some(path) => log::info!(
            "Metadata in {} attached as {}",
            path.display(),
            config.engine.meta.namespace
        ),
        None => log::info!("Metadata tables prefixed {}", config.engine.meta.namespace),
    }

    let server = match SqlRoomServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.trigger();
    });

    if let Err(e) = server.run().await {
        log::error!("Server error: {e}");
        server.gateway().shutdown().await;
        std::process::exit(1);
    }
}
