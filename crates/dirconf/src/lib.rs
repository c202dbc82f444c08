//! Directory client configuration file parser
//!
//! This crate parses `ldap.conf`-style configuration files and extracts
//! typed options for directory sessions. Both the INI form (`key = value`
//! under `[section]` headers) and the OpenLDAP form (`KEY value`) are
//! accepted. Keys are case-insensitive and spaces in key names are treated
//! like underscores, so `bind dn`, `BIND_DN` and `bind_dn` are the same key.
//!
//! # Example
//!
//! ```no_run
//! use dirconf::LdapConfig;
//!
//! let config = LdapConfig::from_file("/etc/ldap/ldap.conf").unwrap();
//! let urls = config.urls();
//! let base = config.base();
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Section used for lines appearing before any `[section]` header
pub const DEFAULT_SECTION: &str = "global";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(String),

    #[error("Missing required option: {0}")]
    MissingOption(String),
}

/// Trait for types that can be parsed from configuration values
pub trait ConfigValue: Sized + Clone {
    /// Parse from a string value in the configuration file
    fn parse_config_value(s: &str) -> Result<Self, ConfigError>;

    /// Get the type name for error messages
    fn type_name() -> &'static str;
}

/// Duration value (supports time units: s, ms, us, m, h, d)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration(pub std::time::Duration);

impl ConfigValue for Duration {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        parse_duration(s).map(Duration)
    }

    fn type_name() -> &'static str {
        "duration"
    }
}

/// Count value (plain integer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count(pub u64);

impl ConfigValue for Count {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        s.trim()
            .parse()
            .map(Count)
            .map_err(|_| ConfigError::ParseError(format!("Invalid count: {}", s)))
    }

    fn type_name() -> &'static str {
        "count"
    }
}

/// Whitespace- or comma-separated list of words
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct List(pub Vec<String>);

impl ConfigValue for List {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        Ok(List(split_list(s)))
    }

    fn type_name() -> &'static str {
        "list"
    }
}

impl ConfigValue for bool {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" => Ok(false),
            _ => Err(ConfigError::ParseError(format!("Invalid bool: {}", s))),
        }
    }

    fn type_name() -> &'static str {
        "bool"
    }
}

impl ConfigValue for String {
    fn parse_config_value(s: &str) -> Result<Self, ConfigError> {
        Ok(s.to_string())
    }

    fn type_name() -> &'static str {
        "string"
    }
}

/// A configuration option with name, type, and default value
pub struct ConfigOption<T: ConfigValue> {
    /// The option name (used in the configuration file)
    name: &'static str,
    /// The default value
    default: T,
    /// Optional description
    description: std::option::Option<&'static str>,
}

impl<T: ConfigValue> ConfigOption<T> {
    pub const fn new(name: &'static str, default: T) -> Self {
        Self {
            name,
            default,
            description: None,
        }
    }

    pub const fn with_description(mut self, desc: &'static str) -> Self {
        self.description = Some(desc);
        self
    }

    /// Get the value from config, falling back to default
    pub fn get(&self, config: &LdapConfig, sections: &[&str]) -> T {
        config
            .get_with_fallback(sections, self.name)
            .and_then(|s| T::parse_config_value(s).ok())
            .unwrap_or_else(|| self.default.clone())
    }

    /// Get the value from config, reporting values that fail to parse
    pub fn try_get(&self, config: &LdapConfig, sections: &[&str]) -> Result<T, ConfigError> {
        match config.get_with_fallback(sections, self.name) {
            Some(raw) => T::parse_config_value(raw).map_err(|e| {
                ConfigError::ParseError(format!(
                    "option {} expects a {}: {}",
                    self.name,
                    T::type_name(),
                    e
                ))
            }),
            None => Ok(self.default.clone()),
        }
    }

    /// Get the option name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the default value
    pub fn default_value(&self) -> &T {
        &self.default
    }

    /// Get the description
    pub fn description(&self) -> std::option::Option<&'static str> {
        self.description
    }
}

/// Parse duration string with time units
fn parse_duration(s: &str) -> Result<std::time::Duration, ConfigError> {
    let s = s.trim();

    let mut num_end = s.len();
    for (i, c) in s.char_indices() {
        if !c.is_ascii_digit() && c != '.' {
            num_end = i;
            break;
        }
    }

    let num_str = &s[..num_end];
    let unit = &s[num_end..].trim().to_lowercase();

    let num: f64 = num_str
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("Invalid number: {}", num_str)))?;

    let seconds = match unit.as_str() {
        "" | "s" | "sec" | "second" | "seconds" => num,
        "ms" | "msec" | "millisecond" | "milliseconds" => num / 1000.0,
        "us" | "usec" | "microsecond" | "microseconds" => num / 1_000_000.0,
        "m" | "min" | "minute" | "minutes" => num * 60.0,
        "h" | "hr" | "hour" | "hours" => num * 3600.0,
        "d" | "day" | "days" => num * 86400.0,
        _ => {
            return Err(ConfigError::ParseError(format!(
                "Unknown time unit: {}",
                unit
            )))
        }
    };

    Ok(std::time::Duration::from_secs_f64(seconds))
}

fn split_list(s: &str) -> Vec<String> {
    s.split(|c: char| c.is_whitespace() || c == ',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Normalize a key so that `Bind DN`, `BIND_DN` and `bind_dn` compare equal
fn normalize_key(key: &str) -> String {
    key.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Represents a parsed directory client configuration
#[derive(Debug, Clone, Default)]
pub struct LdapConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

impl LdapConfig {
    /// Parse a configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current_section = String::from(DEFAULT_SECTION);

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            // Section header
            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(ConfigError::ParseError(format!(
                        "line {}: malformed section header '{}'",
                        lineno + 1,
                        line
                    )));
                }
                current_section = line[1..line.len() - 1].trim().to_lowercase();
                sections.entry(current_section.clone()).or_default();
                continue;
            }

            // `key = value` first, then the OpenLDAP `KEY value` form.
            // `BASE dc=example,dc=com` is the latter: its `=` belongs to the value.
            let ini_split = line.find('=').filter(|&eq_pos| {
                let key_part = &line[..eq_pos];
                !key_part.trim().contains(char::is_whitespace)
                    || key_part.ends_with(char::is_whitespace)
            });
            let (key, value) = if let Some(eq_pos) = ini_split {
                (&line[..eq_pos], &line[eq_pos + 1..])
            } else if let Some(ws_pos) = line.find(char::is_whitespace) {
                (&line[..ws_pos], &line[ws_pos..])
            } else {
                return Err(ConfigError::ParseError(format!(
                    "line {}: option '{}' has no value",
                    lineno + 1,
                    line
                )));
            };

            sections
                .entry(current_section.clone())
                .or_default()
                .insert(normalize_key(key), value.trim().to_string());
        }

        Ok(Self { sections })
    }

    /// Get a configuration value from a specific section
    pub fn get(&self, section: &str, key: &str) -> std::option::Option<&str> {
        self.sections
            .get(&section.to_lowercase())
            .and_then(|s| s.get(&normalize_key(key)))
            .map(|v| v.as_str())
    }

    /// Get a configuration value, checking multiple sections in order
    /// Typically checks: specific section -> session -> global
    pub fn get_with_fallback(&self, sections: &[&str], key: &str) -> std::option::Option<&str> {
        for section in sections {
            if let Some(value) = self.get(section, key) {
                return Some(value);
            }
        }
        None
    }

    /// Get server URLs
    ///
    /// Parses the `uri` option, a whitespace- or comma-separated list such as
    /// `ldap://dir1.example.com ldaps://dir2.example.com:636`.
    pub fn urls(&self) -> Result<Vec<String>, ConfigError> {
        let uri = self
            .get_with_fallback(&["session", DEFAULT_SECTION], "uri")
            .ok_or_else(|| ConfigError::MissingOption("uri".to_string()))?;

        let urls = split_list(uri);
        if urls.is_empty() {
            return Err(ConfigError::ParseError(
                "No server URLs found in 'uri'".to_string(),
            ));
        }

        Ok(urls)
    }

    /// Get the default search base, if configured
    pub fn base(&self) -> std::option::Option<&str> {
        self.get_with_fallback(&["session", DEFAULT_SECTION], "base")
    }

    /// Get the bind DN, if configured
    pub fn bind_dn(&self) -> std::option::Option<&str> {
        self.get_with_fallback(&["session", DEFAULT_SECTION], "binddn")
    }

    /// Get all sections in the configuration
    pub fn sections(&self) -> Vec<&str> {
        self.sections.keys().map(|s| s.as_str()).collect()
    }

    /// Get all keys in a section
    pub fn keys(&self, section: &str) -> Vec<&str> {
        self.sections
            .get(&section.to_lowercase())
            .map(|s| s.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Define a configuration struct with typed options
///
/// # Example
///
/// ```
/// use dirconf::{define_options, LdapConfig, Count, Duration};
///
/// define_options! {
///     /// Pool configuration
///     pub struct PoolOptions {
///         /// Number of pooled connections
///         pool_size: Count = Count(5),
///
///         /// Lifetime of a pooled connection
///         pool_lifetime: Duration = Duration(std::time::Duration::from_secs(3600)),
///
///         /// Whether pooled binds are confirmed
///         pool_confirm_bind: bool = false,
///     }
/// }
///
/// let config_str = r#"
/// [pool]
/// pool_size = 10
/// pool_lifetime = 5m
/// "#;
/// let ldap_config = LdapConfig::parse(config_str).unwrap();
/// let pool = PoolOptions::from_ldap_config(&ldap_config, &["pool", "global"]);
///
/// assert_eq!(pool.pool_size.0, 10);
/// assert_eq!(pool.pool_lifetime.0, std::time::Duration::from_secs(300));
/// assert!(!pool.pool_confirm_bind);
/// ```
#[macro_export]
macro_rules! define_options {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident: $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            /// Create with default values
            pub fn new() -> Self {
                Self {
                    $(
                        $field: $default,
                    )*
                }
            }

            /// Load from a configuration file with section fallback
            pub fn from_ldap_config(
                config: &$crate::LdapConfig,
                sections: &[&str],
            ) -> Self {
                Self {
                    $(
                        $field: {
                            let opt = $crate::ConfigOption::new(stringify!($field), $default);
                            opt.get(config, sections)
                        },
                    )*
                }
            }

            /// Load from a configuration file, failing on values that do not parse
            pub fn try_from_ldap_config(
                config: &$crate::LdapConfig,
                sections: &[&str],
            ) -> ::std::result::Result<Self, $crate::ConfigError> {
                Ok(Self {
                    $(
                        $field: {
                            let opt = $crate::ConfigOption::new(stringify!($field), $default);
                            opt.try_get(config, sections)?
                        },
                    )*
                })
            }

            /// Get option names (for introspection)
            pub fn option_names() -> &'static [&'static str] {
                &[
                    $(stringify!($field),)*
                ]
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}
