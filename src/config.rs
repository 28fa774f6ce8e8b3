/// Configuration module.
///
/// Connection identity and client tuning. Values set as environment
/// variables override the defaults below; the command-line front end layers
/// its own flags on top of these.
use crate::transfer::ScratchStrategy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const HOST_ENV_NAME: &str = "SCIDB_HOST";
pub const HOST_DEFAULT: &str = "https://localhost";

pub const PORT_ENV_NAME: &str = "SCIDB_PORT";
/// Default gateway port when the host uses TLS.
pub const PORT_DEFAULT_TLS: u16 = 8083;
/// Default gateway port over plain HTTP.
pub const PORT_DEFAULT_PLAIN: u16 = 8080;

pub const USER_ENV_NAME: &str = "SCIDB_USER";
pub const USER_DEFAULT: &str = "scidb";

pub const PASSWORD_ENV_NAME: &str = "SCIDB_PASSWORD";
pub const PASSWORD_DEFAULT: &str = "scidb";

pub const ATTEMPTS_ENV_NAME: &str = "SHIM_RETRIES";
/// Attempts per request before a transient failure is surfaced.
pub const ATTEMPTS_DEFAULT: u32 = 3;

pub const TIMEOUT_ENV_NAME: &str = "SHIM_TIMEOUT_SECS";
pub const TIMEOUT_DEFAULT_SECS: u64 = 120;

pub const INVALID_CERTS_ENV_NAME: &str = "SHIM_ACCEPT_INVALID_CERTS";

/// Where the gateway lives and who we are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Host URL; an `https` scheme selects TLS.
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::new(HOST_DEFAULT, None, USER_DEFAULT, PASSWORD_DEFAULT)
    }
}

impl ConnectionConfig {
    /// When `port` is `None` the default for the host's scheme is used.
    pub fn new(host: &str, port: Option<u16>, user: &str, password: &str) -> ConnectionConfig {
        let ssl = host_uses_tls(host);
        ConnectionConfig {
            host: host.trim_end_matches('/').to_string(),
            port: port.unwrap_or(if ssl { PORT_DEFAULT_TLS } else { PORT_DEFAULT_PLAIN }),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// Reads the connection from environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> ConnectionConfig {
        let host = env::var(HOST_ENV_NAME).unwrap_or_else(|_| HOST_DEFAULT.to_string());
        let port = env::var(PORT_ENV_NAME).ok().and_then(|p| p.parse::<u16>().ok());
        let user = env::var(USER_ENV_NAME).unwrap_or_else(|_| USER_DEFAULT.to_string());
        let password = env::var(PASSWORD_ENV_NAME).unwrap_or_else(|_| PASSWORD_DEFAULT.to_string());
        ConnectionConfig::new(&host, port, &user, &password)
    }

    pub fn is_tls(&self) -> bool {
        host_uses_tls(&self.host)
    }

    /// `scheme://host:port`, with `http://` assumed for a bare host name.
    pub fn base_url(&self) -> String {
        if self.host.contains("://") {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

fn host_uses_tls(host: &str) -> bool {
    host.get(..5).map_or(false, |scheme| scheme.eq_ignore_ascii_case("https"))
}

/// Everything a `ShimClient` needs besides its gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    /// Attempts per request, transient failures only.
    pub attempts: u32,
    /// Pause before the n-th retry is `retry_backoff * n`.
    pub retry_backoff: Duration,
    pub timeout: Duration,
    /// Gateways commonly run with self-signed certificates.
    pub accept_invalid_certs: bool,
    pub scratch: ScratchStrategy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connection: ConnectionConfig::default(),
            attempts: ATTEMPTS_DEFAULT,
            retry_backoff: Duration::from_millis(250),
            timeout: Duration::from_secs(TIMEOUT_DEFAULT_SECS),
            accept_invalid_certs: false,
            scratch: ScratchStrategy::Reuse,
        }
    }
}

impl ClientConfig {
    pub fn new(connection: ConnectionConfig) -> ClientConfig {
        ClientConfig {
            connection,
            ..ClientConfig::default()
        }
    }

    /// Connection and tuning from the environment, defaults otherwise.
    pub fn from_env() -> ClientConfig {
        let mut config = ClientConfig::new(ConnectionConfig::from_env());
        if let Some(attempts) = env::var(ATTEMPTS_ENV_NAME).ok().and_then(|v| v.parse().ok()) {
            config.attempts = attempts;
        }
        if let Some(secs) = env::var(TIMEOUT_ENV_NAME).ok().and_then(|v| v.parse().ok()) {
            config.timeout = Duration::from_secs(secs);
        }
        if let Ok(flag) = env::var(INVALID_CERTS_ENV_NAME) {
            config.accept_invalid_certs = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_default_follows_scheme() {
        assert_eq!(8083, ConnectionConfig::new("https://gw", None, "u", "p").port);
        assert_eq!(8080, ConnectionConfig::new("http://gw", None, "u", "p").port);
        assert_eq!(9000, ConnectionConfig::new("https://gw", Some(9000), "u", "p").port);
    }

    #[test]
    fn test_tls_inferred_from_scheme() {
        assert!(ConnectionConfig::new("HTTPS://gw", None, "u", "p").is_tls());
        assert!(!ConnectionConfig::new("http://gw", None, "u", "p").is_tls());
        assert!(!ConnectionConfig::new("gw", None, "u", "p").is_tls());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(
            "https://gw:8083",
            ConnectionConfig::new("https://gw/", None, "u", "p").base_url()
        );
        assert_eq!("http://gw:8080", ConnectionConfig::new("gw", None, "u", "p").base_url());
    }

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(ATTEMPTS_DEFAULT, config.attempts);
        assert!(!config.accept_invalid_certs);
        assert_eq!(ScratchStrategy::Reuse, config.scratch);
        assert_eq!("https://localhost:8083", config.connection.base_url());
    }

    #[test]
    fn test_env_overrides_defaults() {
        env::set_var(HOST_ENV_NAME, "http://gateway.local");
        env::set_var(ATTEMPTS_ENV_NAME, "5");
        env::set_var(INVALID_CERTS_ENV_NAME, "TRUE");
        let config = ClientConfig::from_env();
        env::remove_var(HOST_ENV_NAME);
        env::remove_var(ATTEMPTS_ENV_NAME);
        env::remove_var(INVALID_CERTS_ENV_NAME);

        assert_eq!("http://gateway.local:8080", config.connection.base_url());
        assert_eq!(5, config.attempts);
        assert!(config.accept_invalid_certs);
        assert_eq!(Duration::from_secs(TIMEOUT_DEFAULT_SECS), config.timeout);
    }
}
