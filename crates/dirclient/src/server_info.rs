//! Root DSE metadata

use dirproto::builder::SearchParams;
use dirproto::{Attributes, Response, Scope, SearchEntry};
use std::fmt;

/// Root DSE attributes requested on refresh
pub const ROOT_DSE_ATTRIBUTES: &[&str] = &[
    "namingContexts",
    "supportedControl",
    "supportedExtension",
    "supportedFeatures",
    "supportedSASLMechanisms",
    "supportedLDAPVersion",
    "vendorName",
    "vendorVersion",
    "altServer",
    "subschemaSubentry",
];

/// Search that reads the root DSE
pub fn root_dse_search() -> SearchParams {
    SearchParams::new("", "(objectClass=*)")
        .scope(Scope::Base)
        .attributes(ROOT_DSE_ATTRIBUTES.iter().copied())
}

/// What the server says about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub naming_contexts: Vec<String>,
    pub supported_controls: Vec<String>,
    pub supported_extensions: Vec<String>,
    pub supported_features: Vec<String>,
    pub supported_sasl_mechanisms: Vec<String>,
    pub supported_ldap_versions: Vec<String>,
    pub vendor_name: Option<String>,
    pub vendor_version: Option<String>,
    pub alt_servers: Vec<String>,
    pub raw: Attributes,
}

fn strings(entry: &SearchEntry, attribute: &str) -> Vec<String> {
    entry
        .attributes
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
        .map(|(_, values)| {
            values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect()
        })
        .unwrap_or_default()
}

impl ServerInfo {
    pub fn from_entry(entry: &SearchEntry) -> Self {
        Self {
            naming_contexts: strings(entry, "namingContexts"),
            supported_controls: strings(entry, "supportedControl"),
            supported_extensions: strings(entry, "supportedExtension"),
            supported_features: strings(entry, "supportedFeatures"),
            supported_sasl_mechanisms: strings(entry, "supportedSASLMechanisms"),
            supported_ldap_versions: strings(entry, "supportedLDAPVersion"),
            vendor_name: entry.first_str("vendorName").map(str::to_string),
            vendor_version: entry.first_str("vendorVersion").map(str::to_string),
            alt_servers: strings(entry, "altServer"),
            raw: entry.attributes.clone(),
        }
    }

    /// Build from the responses of a root DSE search
    pub fn from_responses(responses: &[Response]) -> Option<Self> {
        responses.iter().find_map(|response| match response {
            Response::Entry(entry) => Some(Self::from_entry(entry)),
            _ => None,
        })
    }

    pub fn supports_extension(&self, oid: &str) -> bool {
        self.supported_extensions.iter().any(|e| e == oid)
    }

    pub fn supports_sasl_mechanism(&self, mechanism: &str) -> bool {
        self.supported_sasl_mechanisms
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mechanism))
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(vendor) = &self.vendor_name {
            write!(f, "{}", vendor)?;
            if let Some(version) = &self.vendor_version {
                write!(f, " {}", version)?;
            }
            writeln!(f)?;
        }
        writeln!(f, "naming contexts: {}", self.naming_contexts.join(", "))?;
        writeln!(f, "protocol versions: {}", self.supported_ldap_versions.join(", "))?;
        write!(f, "SASL mechanisms: {}", self.supported_sasl_mechanisms.join(", "))
    }
}
