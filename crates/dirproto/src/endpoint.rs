use crate::error::{ProtocolError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 389;
pub const DEFAULT_SECURE_PORT: u16 = 636;

/// A directory server address
///
/// Parsed from `ldap://host[:port]` or `ldaps://host[:port]`. A bare
/// `host[:port]` is accepted as plain `ldap`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// TLS from the first byte (`ldaps`), as opposed to StartTLS
    pub use_ssl: bool,
    pub connect_timeout: Option<Duration>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, use_ssl: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_ssl,
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_ssl {
            "ldaps"
        } else {
            "ldap"
        }
    }

    /// `host:port` for socket address resolution
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme(), self.authority())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

impl FromStr for Endpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (use_ssl, rest) = if let Some(rest) = strip_scheme(s, "ldaps://") {
            (true, rest)
        } else if let Some(rest) = strip_scheme(s, "ldap://") {
            (false, rest)
        } else if s.contains("://") {
            return Err(ProtocolError::InvalidEndpoint(format!(
                "unsupported scheme in '{}'",
                s
            )));
        } else {
            (false, s)
        };

        // Drop any DN / query part of the URL
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(ProtocolError::InvalidEndpoint(format!(
                "missing host in '{}'",
                s
            )));
        }

        let default_port = if use_ssl {
            DEFAULT_SECURE_PORT
        } else {
            DEFAULT_PORT
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| {
                ProtocolError::InvalidEndpoint(format!("unterminated IPv6 address in '{}'", s))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, s)?,
                None => default_port,
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), parse_port(port, s)?),
                None => (authority.to_string(), default_port),
            }
        };

        Ok(Endpoint::new(host, port, use_ssl))
    }
}

fn strip_scheme<'a>(s: &'a str, scheme: &str) -> Option<&'a str> {
    if s.len() >= scheme.len() && s[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(&s[scheme.len()..])
    } else {
        None
    }
}

fn parse_port(port: &str, url: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| ProtocolError::InvalidEndpoint(format!("invalid port in '{}'", url)))
}
