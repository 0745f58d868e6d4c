//! Typed configuration (C11), parsed once at startup from the process
//! environment (optionally loaded from a `.env` file via `dotenvy`,
//! matching the teacher's `LearningConfig::from_env()` convention).

use std::env;
use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub enable_wireguard: bool,
    pub enable_socks: bool,

    pub wg_config_path: String,
    pub danted_config_path: String,
    pub danted_template_path: String,

    pub pool_url: String,
    pub payment_api_url: String,
    pub fallback_orchestrator_url: String,

    pub connect_timeout_seconds: u64,
    pub retry_seconds: u64,
    pub endpoint_rotate_seconds: u64,
    pub endpoint_rotate_jitter_seconds: u64,

    pub mesh_sample_size: usize,

    pub bandwidth_total_mbps: f64,
    pub bandwidth_test_url: String,
    pub bandwidth_sample_seconds: u64,

    pub auto_network_config: bool,
    pub upnp_enabled: bool,
    pub node_register_enabled: bool,
    pub node_public_endpoint: Option<String>,
    pub node_port: u16,
    pub node_id: String,
    pub user_id: String,

    pub control_host: IpAddr,
    pub control_port: u16,

    pub allow_private_endpoints: bool,

    pub log_stdout: bool,
    pub audit_enabled: bool,

    pub wg_address: String,
    pub wg_dns: Option<String>,
    pub wg_persistent_keepalive: u32,
    pub wg_provider_address: String,
    pub socks_port: u16,
    pub token_store_path: String,
}

fn env_str(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt_str(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_bool(name: &'static str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

fn env_required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

impl Config {
    /// Load configuration from the process environment, first merging in a
    /// `.env` file if present (no error if absent).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Config {
            enable_wireguard: env_bool("ENABLE_WIREGUARD", true),
            enable_socks: env_bool("ENABLE_SOCKS", true),

            wg_config_path: env_str("WG_CONFIG_PATH", "/etc/wireguard/wg0.conf"),
            danted_config_path: env_str("DANTED_CONFIG_PATH", "/etc/danted.conf"),
            danted_template_path: env_str("DANTED_TEMPLATE_PATH", "/etc/danted.conf.template"),

            pool_url: env_required("POOL_URL")?,
            payment_api_url: env_required("PAYMENT_API_URL")?,
            fallback_orchestrator_url: env_str("FALLBACK_ORCHESTRATOR_URL", ""),

            connect_timeout_seconds: env_parsed("CONNECT_TIMEOUT_SECONDS", 10)?,
            retry_seconds: env_parsed("RETRY_SECONDS", 15)?,
            endpoint_rotate_seconds: env_parsed("ENDPOINT_ROTATE_SECONDS", 300)?,
            endpoint_rotate_jitter_seconds: env_parsed("ENDPOINT_ROTATE_JITTER_SECONDS", 60)?,

            mesh_sample_size: env_parsed("MESH_SAMPLE_SIZE", 5)?,

            bandwidth_total_mbps: env_parsed("BANDWIDTH_TOTAL_MBPS", 100.0)?,
            bandwidth_test_url: env_str("BANDWIDTH_TEST_URL", ""),
            bandwidth_sample_seconds: env_parsed("BANDWIDTH_SAMPLE_SECONDS", 5)?,

            auto_network_config: env_bool("AUTO_NETWORK_CONFIG", true),
            upnp_enabled: env_bool("UPNP_ENABLED", false),
            node_register_enabled: env_bool("NODE_REGISTER_ENABLED", false),
            node_public_endpoint: env_opt_str("NODE_PUBLIC_ENDPOINT"),
            node_port: env_parsed("NODE_PORT", 51820)?,
            node_id: env_required("NODE_ID")?,
            user_id: env_str("USER_ID", ""),

            control_host: env_parsed("CONTROL_HOST", IpAddr::from([127, 0, 0, 1]))?,
            control_port: env_parsed("CONTROL_PORT", 8765)?,

            allow_private_endpoints: env_bool("ALLOW_PRIVATE_ENDPOINTS", false),

            log_stdout: env_bool("LOG_STDOUT", true),
            audit_enabled: env_bool("AUDIT_ENABLED", false),

            wg_address: env_str("WG_ADDRESS", "10.6.0.2/32"),
            wg_dns: env_opt_str("WG_DNS"),
            wg_persistent_keepalive: env_parsed("WG_PERSISTENT_KEEPALIVE", 25)?,
            wg_provider_address: env_str("WG_PROVIDER_ADDRESS", "10.66.0.1/24"),
            socks_port: env_parsed("SOCKS_PORT", 1080)?,
            token_store_path: env_str("TOKEN_STORE_PATH", "/var/lib/dvpn/token"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment mutation is process-global; serialize config tests.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_required() {
        env::remove_var("POOL_URL");
        env::remove_var("PAYMENT_API_URL");
        env::remove_var("NODE_ID");
    }

    #[test]
    fn missing_required_var_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_required();
        let result = Config::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_required();
        env::set_var("POOL_URL", "https://pool.example.com");
        env::set_var("PAYMENT_API_URL", "https://pay.example.com");
        env::set_var("NODE_ID", "node-1");
        env::remove_var("CONTROL_PORT");

        let config = Config::from_env().unwrap();
        assert_eq!(config.control_port, 8765);
        assert_eq!(config.retry_seconds, 15);
        assert!(config.enable_wireguard);
        clear_required();
    }

    #[test]
    fn invalid_numeric_value_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_required();
        env::set_var("POOL_URL", "https://pool.example.com");
        env::set_var("PAYMENT_API_URL", "https://pay.example.com");
        env::set_var("NODE_ID", "node-1");
        env::set_var("CONTROL_PORT", "not-a-port");

        let result = Config::from_env();
        assert!(result.is_err());

        env::remove_var("CONTROL_PORT");
        clear_required();
    }
}
