//! Default value functions used by serde for config deserialization.

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub fn default_port() -> u16 {
    8080
}

pub fn default_body_limit() -> usize {
    16 * 1024 * 1024
}

pub fn default_database_url() -> String {
    "sqlite:data/wagate.db".to_string()
}

pub fn default_max_connections() -> u32 {
    4
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_wa_log_level() -> String {
    "warn".to_string()
}

pub fn default_create_qr_wait_ms() -> u64 {
    2_000
}

pub fn default_send_timeout_secs() -> u64 {
    75
}

pub fn default_qr_wait_secs() -> u64 {
    30
}

pub fn default_command_buffer() -> usize {
    64
}

pub fn default_reconnect_initial_ms() -> u64 {
    1_000
}

pub fn default_reconnect_max_ms() -> u64 {
    60_000
}

pub fn default_reconnect_jitter() -> f64 {
    0.2
}

pub fn default_reconnect_max_failures() -> u32 {
    10
}

pub fn default_media_max_bytes() -> u64 {
    64 * 1024 * 1024
}

pub fn default_media_fetch_timeout_secs() -> u64 {
    30
}

pub fn default_webhook_timeout_secs() -> u64 {
    10
}

pub fn default_queue_capacity() -> usize {
    1024
}

pub fn default_disable_after() -> u32 {
    50
}

pub fn default_retry_max_attempts() -> u32 {
    6
}

pub fn default_retry_initial_ms() -> u64 {
    1_000
}

pub fn default_retry_max_ms() -> u64 {
    32_000
}

pub fn default_qr_first_ttl_secs() -> u64 {
    60
}

pub fn default_qr_rotation_ttl_secs() -> u64 {
    20
}

pub fn default_qr_rotations() -> u32 {
    6
}

pub fn default_device_name() -> String {
    "wagate".to_string()
}
