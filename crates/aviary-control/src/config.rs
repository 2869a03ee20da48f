//! Configuration for aviary-control.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// PaaS client configuration.
    #[serde(default)]
    pub paas: PaasConfig,

    /// Transactional email configuration.
    #[serde(default)]
    pub mailer: MailerConfig,

    /// Coin economy configuration.
    #[serde(default)]
    pub economy: EconomyConfig,

    /// Deployment behaviour configuration.
    #[serde(default)]
    pub deployment: DeploymentConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `aviary.toml` in the current directory (if present)
    /// 3. Environment variables with `AVIARY_CONTROL_` prefix
    pub fn load() -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file("aviary.toml"))
            .merge(Env::prefixed("AVIARY_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("AVIARY_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8084)
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/aviary".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Which PaaS backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaasBackend {
    /// Real HTTP client against the platform API.
    #[default]
    Http,

    /// Mock backend for testing and local development.
    Mock,
}

/// PaaS client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PaasConfig {
    /// Backend to use.
    #[serde(default)]
    pub backend: PaasBackend,

    /// Base URL for the platform API.
    #[serde(default = "default_paas_url")]
    pub base_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_paas_timeout_secs")]
    pub timeout_secs: u64,

    /// Prefix for generated application names.
    #[serde(default = "default_app_prefix")]
    pub app_prefix: String,
}

fn default_paas_url() -> String {
    "https://api.heroku.com".to_owned()
}

const fn default_paas_timeout_secs() -> u64 {
    30
}

fn default_app_prefix() -> String {
    "avy".to_owned()
}

impl Default for PaasConfig {
    fn default() -> Self {
        Self {
            backend: PaasBackend::default(),
            base_url: default_paas_url(),
            timeout_secs: default_paas_timeout_secs(),
            app_prefix: default_app_prefix(),
        }
    }
}

/// Transactional email configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MailerConfig {
    /// Whether to send email at all. Disabled uses the no-op mailer.
    #[serde(default)]
    pub enabled: bool,

    /// Base URL for the email API.
    #[serde(default = "default_mailer_url")]
    pub base_url: String,

    /// API key for the email service.
    #[serde(default)]
    pub api_key: String,

    /// Sender address.
    #[serde(default = "default_from_address")]
    pub from_address: String,

    /// Request timeout in seconds.
    #[serde(default = "default_mailer_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_mailer_url() -> String {
    "https://api.mailgun.net/v3/aviary".to_owned()
}

fn default_from_address() -> String {
    "noreply@aviary.dev".to_owned()
}

const fn default_mailer_timeout_secs() -> u64 {
    10
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_mailer_url(),
            api_key: String::new(),
            from_address: default_from_address(),
            timeout_secs: default_mailer_timeout_secs(),
        }
    }
}

/// Coin economy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EconomyConfig {
    /// Coins credited per daily claim.
    #[serde(default = "default_daily_amount")]
    pub daily_amount: i64,

    /// Coins credited to the referrer when a referred signup verifies.
    #[serde(default = "default_referral_reward")]
    pub referral_reward: i64,

    /// Coins credited to the referred user when they verify.
    #[serde(default = "default_referral_bonus")]
    pub referral_bonus: i64,
}

const fn default_daily_amount() -> i64 {
    5
}

const fn default_referral_reward() -> i64 {
    10
}

const fn default_referral_bonus() -> i64 {
    5
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            daily_amount: default_daily_amount(),
            referral_reward: default_referral_reward(),
            referral_bonus: default_referral_bonus(),
        }
    }
}

/// Deployment behaviour configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    /// Timeout applied to each external call during provisioning, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

const fn default_call_timeout_secs() -> u64 {
    120
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}
