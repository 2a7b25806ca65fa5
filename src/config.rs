use serde::Deserialize;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listening port (1024-65535, default: 1316)
    pub port: u16,

    /// Trigger mode 0..3 (bit 0: connections edge-triggered,
    /// bit 1: listener edge-triggered; default: 3)
    pub trig_mode: u8,

    /// Idle-connection timeout in milliseconds (0 disables; default: 60000)
    pub timeout_ms: u64,

    /// Enable SO_LINGER {onoff=1, linger=1s} on the listener
    pub linger: bool,

    /// Listen backlog (default: 128)
    pub backlog: i32,

    /// Hard cap on concurrent connections; accepts beyond it are refused
    pub max_fd: usize,

    /// Static file root; empty means `<cwd>/resources`
    pub static_dir: String,

    /// PostgreSQL host / port / credentials
    pub sql_host: String,
    pub sql_port: u16,
    pub sql_user: String,
    pub sql_password: String,
    pub sql_database: String,

    /// Number of pre-opened database connections (0 disables the pool)
    pub sql_pool_size: usize,

    /// Worker threads (0 means one per core)
    pub worker_count: usize,

    /// Logging switches: enable, level (0=debug..3=error), queue capacity
    /// (0 means synchronous writes)
    pub log_enabled: bool,
    pub log_level: u32,
    pub log_queue_size: usize,
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        Config {
            port: env_or("NOCTURNE_PORT", 1316),
            trig_mode: env_or("NOCTURNE_TRIG_MODE", 3),
            timeout_ms: env_or("NOCTURNE_TIMEOUT_MS", 60_000),
            linger: env_or("NOCTURNE_LINGER", false),
            backlog: env_or("NOCTURNE_BACKLOG", 128),
            max_fd: env_or("NOCTURNE_MAX_FD", 65_536),
            static_dir: std::env::var("NOCTURNE_STATIC_DIR").unwrap_or_default(),
            sql_host: std::env::var("NOCTURNE_SQL_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            sql_port: env_or("NOCTURNE_SQL_PORT", 5432),
            sql_user: std::env::var("NOCTURNE_SQL_USER")
                .unwrap_or_else(|_| "nocturne".to_string()),
            sql_password: std::env::var("NOCTURNE_SQL_PASSWORD").unwrap_or_default(),
            sql_database: std::env::var("NOCTURNE_SQL_DATABASE")
                .unwrap_or_else(|_| "nocturne".to_string()),
            sql_pool_size: env_or("NOCTURNE_SQL_POOL_SIZE", 12),
            worker_count: env_or("NOCTURNE_WORKERS", 8),
            log_enabled: env_or("NOCTURNE_LOG", true),
            log_level: env_or("NOCTURNE_LOG_LEVEL", 1),
            log_queue_size: env_or("NOCTURNE_LOG_QUEUE", 1024),
        }
    }

    /// Connections use edge-triggered readiness.
    pub fn conn_et(&self) -> bool {
        self.trig_mode & 0b01 != 0
    }

    /// The listener uses edge-triggered readiness.
    pub fn listen_et(&self) -> bool {
        self.trig_mode & 0b10 != 0
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 1316,
            trig_mode: 3,
            timeout_ms: 60_000,
            linger: false,
            backlog: 128,
            max_fd: 65_536,
            static_dir: String::new(),
            sql_host: "127.0.0.1".to_string(),
            sql_port: 5432,
            sql_user: "nocturne".to_string(),
            sql_password: String::new(),
            sql_database: "nocturne".to_string(),
            sql_pool_size: 12,
            worker_count: 8,
            log_enabled: true,
            log_level: 1,
            log_queue_size: 1024,
        }
    }
}
