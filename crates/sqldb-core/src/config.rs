//! Connection configuration.
//!
//! A [`Config`] is usually parsed from a URL of the shape
//! `driver://[user[:password]@]host[:port]/database[?key=value&...]`.
//! Formatting a parsed config reproduces the original URL exactly; extra
//! options keep their order and no percent-decoding is applied.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Driver name (the URL scheme)
    pub driver: String,
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    /// Extra `key=value` options in URL order
    pub extra: Vec<(String, String)>,
    /// Upper bound for open driver connections (0 = unlimited)
    pub max_open_conns: usize,
    /// Upper bound for idle driver connections
    pub max_idle_conns: usize,
    pub conn_max_lifetime: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl Config {
    /// Create a config for `driver` with default values.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            host: "localhost".to_string(),
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Append an extra option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn max_open_conns(mut self, n: usize) -> Self {
        self.max_open_conns = n;
        self
    }

    pub fn max_idle_conns(mut self, n: usize) -> Self {
        self.max_idle_conns = n;
        self
    }

    pub fn conn_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.conn_max_lifetime = Some(lifetime);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// First value of the extra option `key`.
    pub fn get_option(&self, key: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse a connection URL.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::Config(format!("invalid connection URL {url:?}: {reason}"));

        let (driver, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid("missing \"://\""))?;
        if driver.is_empty() {
            return Err(invalid("empty driver name"));
        }

        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing \"/database\""))?;

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };

        let (user, password) = match userinfo {
            Some(info) => {
                let (user, password) = match info.split_once(':') {
                    Some((user, password)) => (user, Some(password.to_string())),
                    None => (info, None),
                };
                if user.is_empty() {
                    return Err(invalid("empty user name"));
                }
                (Some(user.to_string()), password)
            }
            None => (None, None),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => {
                let parsed: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
                // Only the canonical form round-trips.
                if parsed.to_string() != port {
                    return Err(invalid("invalid port"));
                }
                (host, Some(parsed))
            }
            None => (hostport, None),
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let (database, query) = match path.split_once('?') {
            Some((database, query)) => (database, Some(query)),
            None => (path, None),
        };

        let mut extra = Vec::new();
        if let Some(query) = query {
            if query.is_empty() {
                return Err(invalid("empty option list"));
            }
            for pair in query.split('&') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| invalid("option without \"=\""))?;
                if key.is_empty() {
                    return Err(invalid("empty option name"));
                }
                extra.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Self {
            driver: driver.to_string(),
            host: host.to_string(),
            port,
            user,
            password,
            database: database.to_string(),
            extra,
            ..Self::default()
        })
    }

    /// The connection URL for this config.
    pub fn url(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.driver)?;
        if let Some(user) = &self.user {
            f.write_str(user)?;
            if let Some(password) = &self.password {
                write!(f, ":{password}")?;
            }
            f.write_str("@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "/{}", self.database)?;
        for (i, (key, value)) in self.extra.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Config::parse(s)
    }
}
