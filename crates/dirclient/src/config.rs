//! Session configuration
//!
//! [`SessionConfig`] is a plain struct with defaults. It can also be read
//! from an `ldap.conf`-style file, where options are looked up in the
//! `[session]` section first and then in `[global]` (which also holds the
//! OpenLDAP-style lines that appear before any section header).

use crate::error::{Result, SessionError};
use bytes::Bytes;
use dirconf::{define_options, Count, Duration as ConfigDuration, LdapConfig, List, DEFAULT_SECTION};
use dirproto::builder::DEFAULT_PROTOCOL_VERSION;
use dirproto::Endpoint;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// URL used when no server is configured
pub const DEFAULT_URL: &str = "ldap://localhost:389";

/// Execution model a session delegates I/O to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StrategyKind {
    #[default]
    Sync,
    Async,
    /// Synchronous with one reconnect-and-retry on transport failure
    Restartable,
    /// Pool of workers, each with its own connection
    Reusable,
    /// Renders writes as LDIF change records, no connection at all
    Ldif,
    MockSync,
    MockAsync,
}

impl StrategyKind {
    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::Sync => "SYNC",
            StrategyKind::Async => "ASYNC",
            StrategyKind::Restartable => "RESTARTABLE",
            StrategyKind::Reusable => "REUSABLE",
            StrategyKind::Ldif => "LDIF",
            StrategyKind::MockSync => "MOCK_SYNC",
            StrategyKind::MockAsync => "MOCK_ASYNC",
        }
    }

    pub fn is_mock(self) -> bool {
        matches!(self, StrategyKind::MockSync | StrategyKind::MockAsync)
    }

    /// Whether the strategy needs a wire connector to open
    pub fn needs_connector(self) -> bool {
        matches!(
            self,
            StrategyKind::Sync
                | StrategyKind::Async
                | StrategyKind::Restartable
                | StrategyKind::Reusable
        )
    }
}

impl FromStr for StrategyKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SYNC" => Ok(StrategyKind::Sync),
            "ASYNC" => Ok(StrategyKind::Async),
            "RESTARTABLE" => Ok(StrategyKind::Restartable),
            "REUSABLE" => Ok(StrategyKind::Reusable),
            "LDIF" => Ok(StrategyKind::Ldif),
            "MOCK_SYNC" => Ok(StrategyKind::MockSync),
            "MOCK_ASYNC" => Ok(StrategyKind::MockAsync),
            _ => Err(SessionError::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticationKind {
    Anonymous,
    Simple,
    Sasl,
    /// Challenge-response over the sicily bind rounds
    Ntlm,
}

impl AuthenticationKind {
    pub fn name(self) -> &'static str {
        match self {
            AuthenticationKind::Anonymous => "ANONYMOUS",
            AuthenticationKind::Simple => "SIMPLE",
            AuthenticationKind::Sasl => "SASL",
            AuthenticationKind::Ntlm => "NTLM",
        }
    }
}

impl FromStr for AuthenticationKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ANONYMOUS" => Ok(AuthenticationKind::Anonymous),
            "SIMPLE" => Ok(AuthenticationKind::Simple),
            "SASL" => Ok(AuthenticationKind::Sasl),
            "NTLM" => Ok(AuthenticationKind::Ntlm),
            _ => Err(SessionError::UnknownAuthenticationMethod(s.to_string())),
        }
    }
}

impl fmt::Display for AuthenticationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a session does by itself right after construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoBind {
    #[default]
    None,
    NoTls,
    TlsBeforeBind,
    TlsAfterBind,
}

impl FromStr for AutoBind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" | "FALSE" | "NO" => Ok(AutoBind::None),
            "NO_TLS" | "TRUE" | "YES" => Ok(AutoBind::NoTls),
            "TLS_BEFORE_BIND" => Ok(AutoBind::TlsBeforeBind),
            "TLS_AFTER_BIND" => Ok(AutoBind::TlsAfterBind),
            _ => Err(SessionError::Config(dirconf::ConfigError::ParseError(
                format!("unknown auto_bind mode: {}", s),
            ))),
        }
    }
}

/// How much server metadata to read after open and bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerInfoMode {
    None,
    /// Root DSE only
    #[default]
    Dsa,
}

impl FromStr for ServerInfoMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" | "NO_INFO" => Ok(ServerInfoMode::None),
            "DSA" | "ALL" => Ok(ServerInfoMode::Dsa),
            _ => Err(SessionError::Config(dirconf::ConfigError::ParseError(
                format!("unknown server_info mode: {}", s),
            ))),
        }
    }
}

/// Whether a pooled bind counts as bound before workers answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PooledBindPolicy {
    /// Bound as soon as the bind has been handed to the workers
    #[default]
    Optimistic,
    /// Bound only once every worker reported success
    Confirm,
}

impl FromStr for PooledBindPolicy {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPTIMISTIC" => Ok(PooledBindPolicy::Optimistic),
            "CONFIRM" => Ok(PooledBindPolicy::Confirm),
            _ => Err(SessionError::Config(dirconf::ConfigError::ParseError(
                format!("unknown pool_bind_policy: {}", s),
            ))),
        }
    }
}

/// Directory session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server URLs, tried in order at open
    pub urls: Vec<String>,

    /// Bind name (DN, or `DOMAIN\user` for NTLM)
    pub user: Option<String>,

    pub password: Option<Bytes>,

    /// `None` picks SIMPLE when user and password are both set, ANONYMOUS otherwise
    pub authentication: Option<AuthenticationKind>,

    pub strategy: StrategyKind,

    /// Protocol version sent in bind requests
    pub version: u8,

    pub auto_bind: AutoBind,

    /// Postpone open, StartTLS and bind until the first real operation
    pub lazy: bool,

    /// Refuse add, delete, modify and modifyDn
    pub read_only: bool,

    /// Return errors instead of `false` outcomes
    pub raise_exceptions: bool,

    pub collect_usage: bool,

    /// Number of workers for the REUSABLE strategy
    pub pool_size: usize,

    /// Age after which a pooled worker is replaced
    pub pool_lifetime: Option<Duration>,

    pub pool_bind_policy: PooledBindPolicy,

    /// Pooled workers run the asynchronous strategy instead of the synchronous one
    pub pool_async: bool,

    /// Mechanism used when `authentication` is SASL
    pub sasl_mechanism: Option<String>,

    pub server_info: ServerInfoMode,

    pub connect_timeout: Option<Duration>,

    /// Upper bound on waiting for a response
    pub response_timeout: Option<Duration>,

    /// Age after which a finished, never collected response is dropped
    pub uncollected_age: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            user: None,
            password: None,
            authentication: None,
            strategy: StrategyKind::Sync,
            version: DEFAULT_PROTOCOL_VERSION,
            auto_bind: AutoBind::None,
            lazy: false,
            read_only: false,
            raise_exceptions: false,
            collect_usage: false,
            pool_size: 10,
            pool_lifetime: Some(Duration::from_secs(3600)),
            pool_bind_policy: PooledBindPolicy::Optimistic,
            pool_async: false,
            sasl_mechanism: None,
            server_info: ServerInfoMode::Dsa,
            connect_timeout: None,
            response_timeout: None,
            uncollected_age: Some(Duration::from_secs(600)),
        }
    }
}

define_options! {
    /// Session options as they appear in a configuration file
    pub struct SessionOptions {
        /// Server URLs
        uri: List = List(Vec::new()),

        binddn: String = String::new(),

        bindpw: String = String::new(),

        /// ANONYMOUS, SIMPLE, SASL or NTLM; empty picks a default
        authentication: String = String::new(),

        strategy: String = String::from("SYNC"),

        version: Count = Count(DEFAULT_PROTOCOL_VERSION as u64),

        auto_bind: String = String::from("NONE"),

        lazy: bool = false,

        read_only: bool = false,

        raise_exceptions: bool = false,

        collect_usage: bool = false,

        pool_size: Count = Count(10),

        /// Zero disables worker recycling
        pool_lifetime: ConfigDuration = ConfigDuration(Duration::from_secs(3600)),

        pool_bind_policy: String = String::from("OPTIMISTIC"),

        pool_async: bool = false,

        sasl_mech: String = String::new(),

        server_info: String = String::from("DSA"),

        /// Zero means no timeout
        network_timeout: ConfigDuration = ConfigDuration(Duration::ZERO),

        /// Zero means no timeout
        timeout: ConfigDuration = ConfigDuration(Duration::ZERO),

        /// Zero keeps uncollected responses until the connection closes
        uncollected_age: ConfigDuration = ConfigDuration(Duration::from_secs(600)),
    }
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn non_zero(value: ConfigDuration) -> Option<Duration> {
    (!value.0.is_zero()).then_some(value.0)
}

impl TryFrom<SessionOptions> for SessionConfig {
    type Error = SessionError;

    fn try_from(options: SessionOptions) -> Result<Self> {
        let version = u8::try_from(options.version.0).map_err(|_| {
            SessionError::Config(dirconf::ConfigError::ParseError(format!(
                "protocol version out of range: {}",
                options.version.0
            )))
        })?;

        Ok(SessionConfig {
            urls: options.uri.0,
            user: non_empty(options.binddn),
            password: non_empty(options.bindpw).map(Bytes::from),
            authentication: non_empty(options.authentication)
                .map(|name| name.parse())
                .transpose()?,
            strategy: options.strategy.parse()?,
            version,
            auto_bind: options.auto_bind.parse()?,
            lazy: options.lazy,
            read_only: options.read_only,
            raise_exceptions: options.raise_exceptions,
            collect_usage: options.collect_usage,
            pool_size: options.pool_size.0.max(1) as usize,
            pool_lifetime: non_zero(options.pool_lifetime),
            pool_bind_policy: options.pool_bind_policy.parse()?,
            pool_async: options.pool_async,
            sasl_mechanism: non_empty(options.sasl_mech),
            server_info: options.server_info.parse()?,
            connect_timeout: non_zero(options.network_timeout),
            response_timeout: non_zero(options.timeout),
            uncollected_age: non_zero(options.uncollected_age),
        })
    }
}

impl SessionConfig {
    /// Read options from a parsed configuration (`[session]`, then `[global]`)
    pub fn from_ldap_config(config: &LdapConfig) -> Result<Self> {
        let options = SessionOptions::try_from_ldap_config(config, &["session", DEFAULT_SECTION])?;
        options.try_into()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = LdapConfig::from_file(path)?;
        Self::from_ldap_config(&config)
    }

    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Effective authentication kind
    pub fn authentication_kind(&self) -> AuthenticationKind {
        match self.authentication {
            Some(kind) => kind,
            None if self.user.is_some() && self.password.is_some() => AuthenticationKind::Simple,
            None => AuthenticationKind::Anonymous,
        }
    }

    /// Parsed endpoints, [`DEFAULT_URL`] when none are configured
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let urls: Vec<&str> = if self.urls.is_empty() {
            vec![DEFAULT_URL]
        } else {
            self.urls.iter().map(String::as_str).collect()
        };
        urls.into_iter()
            .map(|url| {
                let endpoint: Endpoint = url.parse()?;
                Ok(endpoint.with_connect_timeout(self.connect_timeout))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_strategy_names() {
        assert_eq!("restartable".parse::<StrategyKind>().unwrap(), StrategyKind::Restartable);
        assert_eq!("MOCK_ASYNC".parse::<StrategyKind>().unwrap(), StrategyKind::MockAsync);
        let err = "THREADED".parse::<StrategyKind>().unwrap_err();
        assert!(matches!(err, SessionError::UnknownStrategy(name) if name == "THREADED"));
    }

    #[test]
    fn test_authentication_names() {
        assert_eq!("ntlm".parse::<AuthenticationKind>().unwrap(), AuthenticationKind::Ntlm);
        assert!(matches!(
            "KERBEROS".parse::<AuthenticationKind>(),
            Err(SessionError::UnknownAuthenticationMethod(_))
        ));
    }

    #[test]
    fn test_authentication_default() {
        let config = SessionConfig::default();
        assert_eq!(config.authentication_kind(), AuthenticationKind::Anonymous);

        let config = SessionConfig::default().with_credentials("cn=admin", "secret");
        assert_eq!(config.authentication_kind(), AuthenticationKind::Simple);

        let mut config = SessionConfig::default();
        config.user = Some("cn=admin".into());
        assert_eq!(config.authentication_kind(), AuthenticationKind::Anonymous);
    }

    #[test]
    fn test_default_endpoint() {
        let endpoints = SessionConfig::default().endpoints().unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].to_string(), DEFAULT_URL);
    }

    #[test]
    fn test_from_ldap_config_with_fallback() {
        let config = LdapConfig::parse(
            r#"
URI ldap://dir1.example.com ldaps://dir2.example.com
BINDDN cn=admin,dc=example,dc=com
bindpw = secret

[session]
strategy = REUSABLE
lazy = yes
pool_size = 4
pool_lifetime = 0
pool_bind_policy = confirm
timeout = 15s
uncollected_age = 0
"#,
        )
        .unwrap();

        let session = SessionConfig::from_ldap_config(&config).unwrap();
        assert_eq!(session.urls.len(), 2);
        assert_eq!(session.user.as_deref(), Some("cn=admin,dc=example,dc=com"));
        assert_eq!(session.password.as_deref(), Some(&b"secret"[..]));
        assert_eq!(session.strategy, StrategyKind::Reusable);
        assert!(session.lazy);
        assert_eq!(session.pool_size, 4);
        assert_eq!(session.pool_lifetime, None);
        assert_eq!(session.pool_bind_policy, PooledBindPolicy::Confirm);
        assert_eq!(session.response_timeout, Some(Duration::from_secs(15)));
        assert_eq!(session.connect_timeout, None);
        assert_eq!(session.uncollected_age, None);
        assert_eq!(session.authentication_kind(), AuthenticationKind::Simple);
    }

    #[test]
    fn test_unknown_strategy_in_file() {
        let config = LdapConfig::parse("[session]\nstrategy = THREADED\n").unwrap();
        assert!(matches!(
            SessionConfig::from_ldap_config(&config),
            Err(SessionError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "URI ldap://dir.example.com:1389").unwrap();
        writeln!(file, "[session]").unwrap();
        writeln!(file, "authentication = SASL").unwrap();
        writeln!(file, "sasl_mech = EXTERNAL").unwrap();
        writeln!(file, "server_info = NONE").unwrap();

        let session = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(session.authentication, Some(AuthenticationKind::Sasl));
        assert_eq!(session.sasl_mechanism.as_deref(), Some("EXTERNAL"));
        assert_eq!(session.server_info, ServerInfoMode::None);
        assert_eq!(session.endpoints().unwrap()[0].port, 1389);
        assert_eq!(session.uncollected_age, Some(Duration::from_secs(600)));
    }
}
