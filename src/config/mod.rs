use std::collections::HashMap;
use std::env;
use std::time::Duration;

use reqwest::header::HeaderValue;
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "MINT_SENDER_";
const AUTHORIZATION_SCHEME: &str = "Api-token";

pub const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MINT_SENDER_ENDPOINT is required but not set")]
    EndpointMissing,

    #[error("endpoint is not a valid URL: {0}")]
    EndpointInvalidUrl(String),

    #[error("endpoint must use http or https: {0}")]
    EndpointUnsupportedScheme(String),

    #[error("API token contains characters that are not allowed in an HTTP header")]
    InvalidToken,

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("{0} must be greater than zero")]
    Zero(String),
}

/// Where metrics go, and the credential that goes with them.
///
/// Validated once; the authorization header value is derived up front so
/// every request reuses it.
#[derive(Debug, Clone)]
pub struct Endpoint {
    url: Url,
    authorization: Option<HeaderValue>,
}

impl Endpoint {
    /// A blank `token` means requests carry no `Authorization` header.
    pub fn parse(url: &str, token: &str) -> Result<Self, ConfigError> {
        let parsed =
            Url::parse(url.trim()).map_err(|_| ConfigError::EndpointInvalidUrl(url.to_owned()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::EndpointUnsupportedScheme(url.to_owned()));
        }

        let token = token.trim();
        let authorization = if token.is_empty() {
            None
        } else {
            let mut value = HeaderValue::from_str(&format!("{AUTHORIZATION_SCHEME} {token}"))
                .map_err(|_| ConfigError::InvalidToken)?;
            value.set_sensitive(true);
            Some(value)
        };

        Ok(Self {
            url: parsed,
            authorization,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn authorization(&self) -> Option<&HeaderValue> {
        self.authorization.as_ref()
    }
}

/// Everything about the HTTP client and delivery runtime except the endpoint.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    /// Maximum silence on an open socket while waiting for the response.
    pub read_timeout: Duration,
    /// How long a delivery may wait for a free pooled connection.
    pub pool_wait_timeout: Duration,
    /// Pool size, both per host and in total.
    pub max_connections: usize,
    pub io_threads: usize,
    pub shutdown_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(3000),
            pool_wait_timeout: Duration::from_millis(100),
            max_connections: 2,
            io_threads: 1,
            shutdown_timeout: Duration::from_millis(5000),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub endpoint: Endpoint,
    pub settings: ClientSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let endpoint = parse_endpoint(vars)?;
        let defaults = ClientSettings::default();

        let settings = ClientSettings {
            connect_timeout: parse_duration_ms(
                vars,
                "MINT_SENDER_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout,
            )?,
            read_timeout: parse_duration_ms(
                vars,
                "MINT_SENDER_READ_TIMEOUT_MS",
                defaults.read_timeout,
            )?,
            pool_wait_timeout: parse_duration_ms(
                vars,
                "MINT_SENDER_POOL_WAIT_MS",
                defaults.pool_wait_timeout,
            )?,
            max_connections: parse_count(
                vars,
                "MINT_SENDER_MAX_CONNECTIONS",
                defaults.max_connections,
            )?,
            io_threads: parse_count(vars, "MINT_SENDER_IO_THREADS", defaults.io_threads)?,
            shutdown_timeout: parse_duration_ms(
                vars,
                "MINT_SENDER_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout,
            )?,
            user_agent: vars
                .get("MINT_SENDER_USER_AGENT")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or(defaults.user_agent),
        };

        Ok(Self { endpoint, settings })
    }
}

fn parse_endpoint(vars: &HashMap<String, String>) -> Result<Endpoint, ConfigError> {
    let raw = vars
        .get("MINT_SENDER_ENDPOINT")
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::EndpointMissing)?;
    let token = vars.get("MINT_SENDER_TOKEN").map(String::as_str).unwrap_or("");

    Endpoint::parse(raw, token)
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(val) => {
            let ms: u64 = val
                .parse()
                .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?;
            Ok(Duration::from_millis(ms))
        }
        None => Ok(default),
    }
}

fn parse_count(
    vars: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match vars.get(name) {
        Some(val) => {
            let count: usize = val
                .parse()
                .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?;
            if count == 0 {
                return Err(ConfigError::Zero(name.to_owned()));
            }
            Ok(count)
        }
        None => Ok(default),
    }
}
