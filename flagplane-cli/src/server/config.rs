use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use super::auth::Role;

pub const DEFAULT_TOKENS: &str = "admin-token:admin,operator-token:operator,viewer-token:viewer";

/// Top-level flagplane.toml configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FpServerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default = "default_tokens")]
    pub tokens: HashMap<String, Role>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage")]
    pub storage: StorageBackend,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sled,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_global_rpm")]
    pub global_requests_per_minute: u32,
    #[serde(default = "default_tenant_rpm")]
    pub tenant_requests_per_minute: u32,
    #[serde(default = "default_tenant_flag_quota")]
    pub tenant_flag_quota: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdempotencyConfig {
    #[serde(default = "default_idempotency_ttl_ms")]
    pub ttl_ms: u64,
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

// ── Default value functions ──────────────────────────

fn default_port() -> u16 {
    8080
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_storage() -> StorageBackend {
    StorageBackend::Memory
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_bus_capacity() -> usize {
    256
}

fn default_global_rpm() -> u32 {
    1200
}

fn default_tenant_rpm() -> u32 {
    300
}

fn default_tenant_flag_quota() -> usize {
    50
}

fn default_idempotency_ttl_ms() -> u64 {
    300_000
}

fn default_tokens() -> HashMap<String, Role> {
    parse_tokens(DEFAULT_TOKENS)
}

impl Default for FpServerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            idempotency: IdempotencyConfig::default(),
            tokens: default_tokens(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            hostname: default_hostname(),
            data_dir: default_data_dir(),
            storage: default_storage(),
            max_body_bytes: default_max_body_bytes(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global_requests_per_minute: default_global_rpm(),
            tenant_requests_per_minute: default_tenant_rpm(),
            tenant_flag_quota: default_tenant_flag_quota(),
        }
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_idempotency_ttl_ms(),
        }
    }
}

/// Parses `token:role,token:role`. Entries with an unknown role or a missing
/// half are skipped.
pub fn parse_tokens(raw: &str) -> HashMap<String, Role> {
    raw.split(',')
        .filter_map(|entry| {
            let (token, role) = entry.trim().split_once(':')?;
            let token = token.trim();
            if token.is_empty() {
                return None;
            }
            let role = role.trim().parse::<Role>().ok()?;
            Some((token.to_string(), role))
        })
        .collect()
}

/// Accepts a plain byte count or a `kb`/`mb` suffixed size, e.g. `1mb`.
pub fn parse_byte_size(raw: &str) -> Option<usize> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(n) = raw.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = raw.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = raw.strip_suffix('b') {
        (n, 1)
    } else {
        (raw.as_str(), 1)
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(multiplier)
}

impl FpServerConfig {
    /// Load configuration from a TOML file, falling back to defaults if the file
    /// doesn't exist or cannot be parsed.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path, error = %e, "failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| env::var(name).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT")
            .or_else(|| lookup("FP_PORT"))
            .and_then(|v| v.parse::<u16>().ok())
        {
            self.server.port = port;
        }

        if let Some(hostname) = lookup("FP_HOSTNAME") {
            self.server.hostname = hostname;
        }

        if let Some(val) = lookup("FP_STORAGE") {
            match val.to_lowercase().as_str() {
                "sled" => self.server.storage = StorageBackend::Sled,
                "memory" => self.server.storage = StorageBackend::Memory,
                other => warn!(value = other, "unknown FP_STORAGE value"),
            }
        }

        if let Some(dir) = lookup("FP_DATA_DIR") {
            self.server.data_dir = dir;
        }

        if let Some(size) = lookup("MAX_BODY_BYTES").and_then(|v| parse_byte_size(&v)) {
            self.server.max_body_bytes = size;
        }

        if let Some(rpm) = lookup("GLOBAL_RPM").and_then(|v| v.parse().ok()) {
            self.limits.global_requests_per_minute = rpm;
        }

        if let Some(rpm) = lookup("TENANT_RPM").and_then(|v| v.parse().ok()) {
            self.limits.tenant_requests_per_minute = rpm;
        }

        if let Some(quota) = lookup("TENANT_FLAG_QUOTA").and_then(|v| v.parse().ok()) {
            self.limits.tenant_flag_quota = quota;
        }

        if let Some(ttl) = lookup("IDEMPOTENCY_TTL_MS").and_then(|v| v.parse().ok()) {
            self.idempotency.ttl_ms = ttl;
        }

        if let Some(tokens) = lookup("FP_TOKENS") {
            self.tokens = parse_tokens(&tokens);
        }
    }
}
