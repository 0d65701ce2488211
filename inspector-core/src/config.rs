use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct InspectorConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub ironic: IronicConfig,
    #[serde(default)]
    pub introspection: IntrospectionConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IronicConfig {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Total attempts for calls that fail on an optimistic-lock conflict.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_version() -> String {
    "1.6".to_string()
}

fn default_max_retries() -> usize {
    5
}

fn default_retry_interval_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IntrospectionConfig {
    /// Seconds before an unfinished session is force-finished. Non-positive disables timeouts.
    pub timeout_secs: i64,
    /// Seconds a finished session stays queryable before it is purged.
    pub node_status_keep_time_secs: i64,
    /// Sweep period in seconds; 0 disables the periodic sweep.
    pub clean_up_period_secs: u64,
    pub enable_setting_ipmi_credentials: bool,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            node_status_keep_time_secs: 604_800,
            clean_up_period_secs: 60,
            enable_setting_ipmi_credentials: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FirewallConfig {
    pub manage_firewall: bool,
    pub dnsmasq_interface: String,
    pub firewall_chain: String,
    pub iptables_binary: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            manage_firewall: false,
            dnsmasq_interface: "br-ctlplane".to_string(),
            firewall_chain: "ironic-inspector".to_string(),
            iptables_binary: "iptables".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 5050,
        }
    }
}

impl InspectorConfig {
    /// Load from a TOML file, overridden by `INSPECTOR__SECTION__KEY` environment variables.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("INSPECTOR").separator("__"))
            .build()?;
        s.try_deserialize()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from_str(contents, config::FileFormat::Toml))
            .build()?;
        s.try_deserialize()
    }
}
