use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

pub mod metrics;
pub mod schedule;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by all fallible operations within this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("metrics error: {0}")]
    Prometheus(#[from] prometheus::Error),
    /// The upstream schedule URL is missing or still a placeholder.
    #[error("upstream schedule endpoint is not configured: {0:?}")]
    UnconfiguredEndpoint(String),
    /// Error while requesting the upstream schedule page.
    #[error("failure requesting school schedule: {0}")]
    Request(#[from] reqwest::Error),
    /// Error raised by the outbound request middleware.
    #[error("failure requesting school schedule: {0}")]
    Middleware(#[from] reqwest_middleware::Error),
    /// Error while building outbound HTTP headers.
    #[error("encountered invalid HTTP header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
    #[error("invalid CSS selector: {0}")]
    Selector(String),
}

/// HTTP method used to query the upstream schedule page.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    /// Send the year as a query parameter.
    Get,
    /// Send the year as a form field.
    #[default]
    Post,
}

/// Upstream schedule page configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct UpstreamConfig {
    /// URL of the `yearSchdul.do` endpoint.
    #[serde(default)]
    pub url: String,
    /// Request method, fixed for the lifetime of the process.
    #[serde(default)]
    pub method: RequestMethod,
    /// Timeout of a single outbound request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional `User-Agent` header sent upstream.
    pub user_agent: Option<String>,
}

fn default_timeout_secs() -> u64 {
    15
}

/// Year cache configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CacheConfig {
    /// Seconds a cached year is served without refetching.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    6 * 60 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: default_ttl_secs(),
        }
    }
}

/// HTTP server configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ServerConfig {
    /// Address on which the web server will listen.
    pub listen_addr: SocketAddr,
    /// Number of HTTP worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    2
}

/// Global application configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AppConfig {
    /// Server configuration section.
    pub server: ServerConfig,
    /// Upstream schedule page section.
    pub upstream: UpstreamConfig,
    /// Cache configuration section.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl AppConfig {
    /// Loads the application configuration from files in the `config/` directory and environment
    /// variables.
    pub fn load() -> Result<AppConfig> {
        AppConfig::load_from("config")
    }

    /// Like [`AppConfig::load`], but reads the configuration files from `dir`.
    pub fn load_from<P: AsRef<Path>>(dir: P) -> Result<AppConfig> {
        let dir = dir.as_ref();
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        log::info!("loading configuration using {} environment", app_env);

        let config = Config::builder()
            // Configuration defaults from `config/default.toml`.
            .add_source(File::from(dir.join("default")))
            // Optional environment specific config overrides, e.g. `config/production.toml`.
            .add_source(File::from(dir.join(&app_env)).required(false))
            // Optional local config overrides from `config/local.toml` (on .gitignore).
            .add_source(File::from(dir.join("local")).required(false))
            // Config from environment variables.
            .add_source(Environment::default().separator("__"))
            // Config from environment variables prefixed with `SCHOOLCAL_`.
            .add_source(
                Environment::with_prefix("SCHOOLCAL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        log::debug!("loaded configuration: {:?}", config);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> AppConfig {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults() {
        let config = from_toml(
            r#"
            [server]
            listen_addr = "127.0.0.1:4100"

            [upstream]
            url = "https://school.example/yearSchdul.do"
            "#,
        );

        assert_eq!(config.server.workers, 2);
        assert_eq!(config.upstream.method, RequestMethod::Post);
        assert_eq!(config.upstream.timeout_secs, 15);
        assert_eq!(config.upstream.user_agent, None);
        assert_eq!(config.cache.ttl_secs, 21600);
    }

    #[test]
    fn request_method() {
        let config = from_toml(
            r#"
            [server]
            listen_addr = "0.0.0.0:8080"

            [upstream]
            method = "GET"
            timeout_secs = 3

            [cache]
            ttl_secs = 60
            "#,
        );

        assert_eq!(config.upstream.method, RequestMethod::Get);
        assert_eq!(config.upstream.url, "");
        assert_eq!(config.upstream.timeout_secs, 3);
        assert_eq!(config.cache.ttl_secs, 60);
    }

    #[test]
    fn load_default_config_file() {
        let config = AppConfig::load_from(concat!(env!("CARGO_MANIFEST_DIR"), "/config")).unwrap();
        assert_eq!(config.upstream.method, RequestMethod::Post);
        assert!(config.upstream.url.ends_with("yearSchdul.do"));
    }
}
