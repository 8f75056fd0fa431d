// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own sizing variables in
// db/pool.rs; this module covers the server and chat-core settings.

use std::net::SocketAddr;
use std::time::Duration;

const DEV_JWT_SECRET: &str = "workshop_chat_local_development_jwt_secret_32c";

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Shared secret used to verify identity tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. `None` runs with in-memory stores.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `workshop_chat_relay=debug`).
    pub log_filter: String,
    /// Emit logs as JSON lines instead of the human-readable format.
    pub log_json: bool,
    pub chat: ChatConfig,
}

/// Tuning knobs for the chat core. None of these are correctness contracts;
/// they bound how long ephemeral state lingers and how long callers wait.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Size of the history page returned on join.
    pub history_page_size: usize,
    /// How long a typing signal stays live without a refresh.
    pub typing_ttl: Duration,
    /// How long an empty room keeps its live state before eviction.
    pub room_grace: Duration,
    /// Window for authentication and for each join.
    pub auth_timeout: Duration,
    /// Window for send/edit/delete, including the durable write.
    pub action_timeout: Duration,
    /// How long an authorization answer may be reused.
    pub authz_cache_ttl: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_page_size: 50,
            typing_ttl: Duration::from_millis(3_000),
            room_grace: Duration::from_millis(30_000),
            auth_timeout: Duration::from_millis(10_000),
            action_timeout: Duration::from_millis(5_000),
            authz_cache_ttl: Duration::from_millis(5_000),
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `WORKSHOP_CHAT_HOST` | `0.0.0.0` |
    /// | `WORKSHOP_CHAT_PORT` | `8080` |
    /// | `WORKSHOP_CHAT_JWT_SECRET` | dev-only placeholder |
    /// | `WORKSHOP_CHAT_DATABASE_URL` | *(none — in-memory stores)* |
    /// | `WORKSHOP_CHAT_CORS_ORIGINS` | *(none — cors.rs uses dev defaults)* |
    /// | `WORKSHOP_CHAT_LOG_FILTER` | `info` |
    /// | `WORKSHOP_CHAT_LOG_FORMAT` | `text` (`json` for JSON lines) |
    /// | `WORKSHOP_CHAT_HISTORY_PAGE_SIZE` | `50` |
    /// | `WORKSHOP_CHAT_TYPING_TTL_MS` | `3000` |
    /// | `WORKSHOP_CHAT_ROOM_GRACE_MS` | `30000` |
    /// | `WORKSHOP_CHAT_AUTH_TIMEOUT_MS` | `10000` |
    /// | `WORKSHOP_CHAT_ACTION_TIMEOUT_MS` | `5000` |
    /// | `WORKSHOP_CHAT_AUTHZ_CACHE_TTL_MS` | `5000` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("WORKSHOP_CHAT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("WORKSHOP_CHAT_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("WORKSHOP_CHAT_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url = env("WORKSHOP_CHAT_DATABASE_URL").ok().filter(|v| !v.is_empty());
        let cors_origins = env("WORKSHOP_CHAT_CORS_ORIGINS").ok();

        let log_filter = env("WORKSHOP_CHAT_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("WORKSHOP_CHAT_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let defaults = ChatConfig::default();
        let millis = |key: &str, fallback: Duration| {
            env(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        let chat = ChatConfig {
            history_page_size: env("WORKSHOP_CHAT_HISTORY_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.history_page_size),
            typing_ttl: millis("WORKSHOP_CHAT_TYPING_TTL_MS", defaults.typing_ttl),
            room_grace: millis("WORKSHOP_CHAT_ROOM_GRACE_MS", defaults.room_grace),
            auth_timeout: millis("WORKSHOP_CHAT_AUTH_TIMEOUT_MS", defaults.auth_timeout),
            action_timeout: millis("WORKSHOP_CHAT_ACTION_TIMEOUT_MS", defaults.action_timeout),
            authz_cache_ttl: millis("WORKSHOP_CHAT_AUTHZ_CACHE_TTL_MS", defaults.authz_cache_ttl),
        };

        Self { listen_addr, jwt_secret, database_url, cors_origins, log_filter, log_json, chat }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
