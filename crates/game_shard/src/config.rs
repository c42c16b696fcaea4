use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::receipt::DEFAULT_RECEIPT_HISTORY_SIZE;

pub const DEFAULT_PORT: u16 = 4040;
pub const DEFAULT_NAMESPACE: &str = "world-dev";
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

pub const ENV_PORT: &str = "CARDINAL_PORT";
pub const ENV_NAMESPACE: &str = "CARDINAL_NAMESPACE";
pub const ENV_LOG_STORE_ADDR: &str = "REDIS_ADDR";
pub const ENV_LOG_STORE_PASSWORD: &str = "REDIS_PASSWORD";
pub const ENV_DEBUG: &str = "ENABLE_DEBUG";
pub const ENV_ALLOWLIST: &str = "ENABLE_ALLOWLIST";

/// World configuration. `from_env` reads the recognized environment
/// variables; everything else is set through the builder methods.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldConfig {
    pub port: u16,
    pub namespace: String,
    /// Durable log backing endpoint, carried for deployment parity. The
    /// in-tree store persists to `state_dir`.
    pub log_store_addr: Option<String>,
    pub log_store_password: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub debug: bool,
    pub allowlist_enabled: bool,
    pub production: bool,
    pub disable_signature_verification: bool,
    pub receipt_history_size: usize,
    pub tick_interval: Duration,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            namespace: DEFAULT_NAMESPACE.to_string(),
            log_store_addr: None,
            log_store_password: None,
            state_dir: None,
            debug: false,
            allowlist_enabled: false,
            production: false,
            disable_signature_verification: false,
            receipt_history_size: DEFAULT_RECEIPT_HISTORY_SIZE,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl WorldConfig {
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();
        if let Ok(raw) = env::var(ENV_PORT) {
            config.port = raw
                .parse::<u16>()
                .map_err(|_| format!("{ENV_PORT} must be a port number, got {raw:?}"))?;
        }
        if let Ok(namespace) = env::var(ENV_NAMESPACE) {
            if namespace.trim().is_empty() {
                return Err(format!("{ENV_NAMESPACE} must not be empty"));
            }
            config.namespace = namespace;
        }
        if let Ok(addr) = env::var(ENV_LOG_STORE_ADDR) {
            config.log_store_addr = Some(addr);
        }
        if let Ok(password) = env::var(ENV_LOG_STORE_PASSWORD) {
            config.log_store_password = Some(password);
        }
        config.debug = env_flag(ENV_DEBUG);
        config.allowlist_enabled = env_flag(ENV_ALLOWLIST);
        Ok(config)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn with_receipt_history_size(mut self, size: usize) -> Self {
        self.receipt_history_size = size;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_signature_verification_disabled(mut self) -> Self {
        self.disable_signature_verification = true;
        self
    }

    pub fn with_allowlist_enabled(mut self, enabled: bool) -> Self {
        self.allowlist_enabled = enabled;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = WorldConfig::default();
        assert_eq!(config.port, 4040);
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.receipt_history_size, 10);
        assert!(!config.debug);
        assert!(!config.allowlist_enabled);
        assert!(!config.production);
    }

    #[test]
    fn builders_override_defaults() {
        let config = WorldConfig::default()
            .with_namespace("prod-shard")
            .with_port(9000)
            .with_production(true)
            .with_receipt_history_size(32);
        assert_eq!(config.namespace, "prod-shard");
        assert_eq!(config.port, 9000);
        assert!(config.production);
        assert_eq!(config.receipt_history_size, 32);
    }
}
