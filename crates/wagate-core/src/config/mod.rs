mod defaults;


use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::GatewayError;
use defaults::*;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared API key. Required; usually supplied through `ZP_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    /// Maximum request body size. Large enough for data-URL media.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: String::new(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Level applied to the WhatsApp client crate.
    #[serde(default = "default_wa_log_level")]
    pub wa_level: String,
    /// When set, logs are also written to a daily rolling file in this directory.
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            wa_level: default_wa_log_level(),
            dir: None,
        }
    }
}

impl LoggingConfig {
    /// Filter directive string for `tracing_subscriber::EnvFilter`.
    pub fn filter_directive(&self) -> String {
        format!("{},wagate_whatsapp={}", self.level, self.wa_level)
    }
}

/// Session runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long `create` waits for the first QR code when auto-connecting.
    #[serde(default = "default_create_qr_wait_ms")]
    pub create_qr_wait_ms: u64,
    /// Default deadline for a send request.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Default wait for `GET /qr` when no QR is live yet.
    #[serde(default = "default_qr_wait_secs")]
    pub qr_wait_secs: u64,
    /// Capacity of each runtime's command queue.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            create_qr_wait_ms: default_create_qr_wait_ms(),
            send_timeout_secs: default_send_timeout_secs(),
            qr_wait_secs: default_qr_wait_secs(),
            command_buffer: default_command_buffer(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn create_qr_wait(&self) -> Duration {
        Duration::from_millis(self.create_qr_wait_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn qr_wait(&self) -> Duration {
        Duration::from_secs(self.qr_wait_secs)
    }
}

/// Auto-reconnect backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
    /// Fractional jitter, 0.2 means +/-20%.
    #[serde(default = "default_reconnect_jitter")]
    pub jitter: f64,
    /// Consecutive failed attempts before the session enters `error`.
    #[serde(default = "default_reconnect_max_failures")]
    pub max_failures: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            jitter: default_reconnect_jitter(),
            max_failures: default_reconnect_max_failures(),
        }
    }
}

/// Outbound media handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_media_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_media_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Directory that server-local media paths must live under.
    /// Local paths are rejected when unset.
    #[serde(default)]
    pub local_root: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_media_max_bytes(),
            fetch_timeout_secs: default_media_fetch_timeout_secs(),
            local_root: None,
        }
    }
}

/// Event sink delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Implicit sink receiving every event of every session.
    #[serde(default)]
    pub global_url: Option<String>,
    #[serde(default)]
    pub global_secret: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    /// Per-sink queue depth; the oldest event is dropped on overflow.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Consecutive failed deliveries after which a sink is disabled.
    #[serde(default = "default_disable_after")]
    pub disable_after: u32,
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            global_url: None,
            global_secret: None,
            timeout_secs: default_webhook_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            disable_after: default_disable_after(),
            max_attempts: default_retry_max_attempts(),
            initial_delay_ms: default_retry_initial_ms(),
            max_delay_ms: default_retry_max_ms(),
        }
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// WhatsApp client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// Device name shown on the phone's linked devices list.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Lifetime of the first QR code of a pairing attempt.
    #[serde(default = "default_qr_first_ttl_secs")]
    pub qr_first_ttl_secs: u64,
    /// Lifetime of each rotated QR code.
    #[serde(default = "default_qr_rotation_ttl_secs")]
    pub qr_rotation_ttl_secs: u64,
    /// QR codes issued per pairing attempt before it is abandoned.
    #[serde(default = "default_qr_rotations")]
    pub qr_rotations: u32,
    /// Development aid: complete pairing automatically after this many seconds.
    #[serde(default)]
    pub auto_pair_after_secs: Option<u64>,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            qr_first_ttl_secs: default_qr_first_ttl_secs(),
            qr_rotation_ttl_secs: default_qr_rotation_ttl_secs(),
            qr_rotations: default_qr_rotations(),
            auto_pair_after_secs: None,
        }
    }
}

impl Config {
    /// Override file values with process environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Override file values using `lookup` as the environment.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(port) = get("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(v) = get("ZP_API_KEY") {
            self.server.api_key = v;
        }
        if let Some(v) = get("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("WA_LOG_LEVEL") {
            self.logging.wa_level = v;
        }
        if let Some(v) = get("LOG_DIR") {
            self.logging.dir = Some(v);
        }
        if let Some(v) = get("GLOBAL_WEBHOOK_URL") {
            self.webhook.global_url = Some(v);
        }
        if let Some(v) = get("GLOBAL_WEBHOOK_SECRET") {
            self.webhook.global_secret = Some(v);
        }
        if let Some(n) = get("MEDIA_MAX_BYTES").and_then(|v| v.parse().ok()) {
            self.media.max_bytes = n;
        }
        if let Some(n) = get("MEDIA_FETCH_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.media.fetch_timeout_secs = n;
        }
        if let Some(n) = get("SEND_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.session.send_timeout_secs = n;
        }
    }

    /// Reject settings the gateway cannot start with.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.server.api_key.trim().is_empty() {
            return Err(GatewayError::Config(
                "API key is required (set ZP_API_KEY or server.api_key)".into(),
            ));
        }
        if self.server.port == 0 {
            return Err(GatewayError::Config("server.port must not be 0".into()));
        }
        if self.webhook.queue_capacity == 0 {
            return Err(GatewayError::Config(
                "webhook.queue_capacity must be at least 1".into(),
            ));
        }
        if self.webhook.max_attempts == 0 {
            return Err(GatewayError::Config(
                "webhook.max_attempts must be at least 1".into(),
            ));
        }
        let rc = &self.session.reconnect;
        if rc.max_delay_ms < rc.initial_delay_ms {
            return Err(GatewayError::Config(
                "session.reconnect.max_delay_ms is below initial_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&rc.jitter) {
            return Err(GatewayError::Config(
                "session.reconnect.jitter must be between 0 and 1".into(),
            ));
        }
        if self.session.command_buffer == 0 {
            return Err(GatewayError::Config(
                "session.command_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from a TOML file, falling back to defaults when missing.
pub fn load(path: &str) -> Result<Config, GatewayError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| GatewayError::Config(format!("failed to parse config: {}", e)))?;

    Ok(config)
}
