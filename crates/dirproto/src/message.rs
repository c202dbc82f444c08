//! Request side of the protocol message model
//!
//! These are the abstract, encodable request objects produced by the
//! builders in [`crate::builder`]. The byte-level encoding belongs to a
//! [`crate::link::Codec`] implementation.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;

/// Per-connection message sequence number, used to correlate responses
pub type MessageId = u32;

/// Message id reserved for unsolicited notifications
pub const UNSOLICITED_MESSAGE_ID: MessageId = 0;

/// Requests no attributes
pub const NO_ATTRIBUTES: &str = "1.1";
/// Requests all user attributes
pub const ALL_ATTRIBUTES: &str = "*";
/// Requests all operational attributes
pub const ALL_OPERATIONAL_ATTRIBUTES: &str = "+";

/// StartTLS extended operation
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// Notice of disconnection unsolicited notification
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";
/// "Who am I?" extended operation
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
/// Simple paged results control
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Operation kind of a request, used for bookkeeping and abandon checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operation {
    Bind,
    Unbind,
    Search,
    Add,
    Delete,
    Modify,
    ModifyDn,
    Compare,
    Abandon,
    Extended,
}

impl Operation {
    /// Protocol name of the request
    pub fn request_name(self) -> &'static str {
        match self {
            Operation::Bind => "bindRequest",
            Operation::Unbind => "unbindRequest",
            Operation::Search => "searchRequest",
            Operation::Add => "addRequest",
            Operation::Delete => "delRequest",
            Operation::Modify => "modifyRequest",
            Operation::ModifyDn => "modDNRequest",
            Operation::Compare => "compareRequest",
            Operation::Abandon => "abandonRequest",
            Operation::Extended => "extendedReq",
        }
    }

    /// Whether the server answers this request at all
    pub fn expects_response(self) -> bool {
        !matches!(self, Operation::Unbind | Operation::Abandon)
    }

    /// Whether the request changes directory content
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Operation::Add | Operation::Delete | Operation::Modify | Operation::ModifyDn
        )
    }

    /// Requests that must never be abandoned half-way
    pub fn is_abandonable(self) -> bool {
        !matches!(
            self,
            Operation::Bind | Operation::Unbind | Operation::Abandon
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.request_name())
    }
}

/// A request control: OID, criticality and an opaque encoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Bytes>,
}

impl Control {
    pub fn new(oid: impl Into<String>, critical: bool, value: Option<Bytes>) -> Self {
        Self {
            oid: oid.into(),
            critical,
            value,
        }
    }
}

/// Simple paged results request (size + continuation cookie)
///
/// Carried on the search request; the codec renders it as the
/// [`PAGED_RESULTS_OID`] control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResults {
    pub size: u32,
    pub cookie: Bytes,
    pub critical: bool,
}

/// Search scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    Base,
    OneLevel,
    #[default]
    Subtree,
}

/// Alias dereferencing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
    Never,
    InSearching,
    FindingBaseObject,
    #[default]
    Always,
}

/// Modify change type with its protocol code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeType {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

impl ChangeType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ChangeType::Add),
            1 => Some(ChangeType::Delete),
            2 => Some(ChangeType::Replace),
            3 => Some(ChangeType::Increment),
            _ => None,
        }
    }

    /// Accepts both `MODIFY_ADD` style names and bare `add`
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_uppercase();
        let name = name.strip_prefix("MODIFY_").unwrap_or(&name);
        match name {
            "ADD" => Some(ChangeType::Add),
            "DELETE" => Some(ChangeType::Delete),
            "REPLACE" => Some(ChangeType::Replace),
            "INCREMENT" => Some(ChangeType::Increment),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Keyword used in LDIF change records
    pub fn ldif_keyword(self) -> &'static str {
        match self {
            ChangeType::Add => "add",
            ChangeType::Delete => "delete",
            ChangeType::Replace => "replace",
            ChangeType::Increment => "increment",
        }
    }
}

/// One attribute change of a modify request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub attribute: String,
    pub change: ChangeType,
    pub values: Vec<Bytes>,
}

impl Modification {
    pub fn new(attribute: impl Into<String>, change: ChangeType, values: Vec<Bytes>) -> Self {
        Self {
            attribute: attribute.into(),
            change,
            values,
        }
    }
}

/// Bind credentials carried by a bind request
#[derive(Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(Bytes),
    Sasl {
        mechanism: String,
        credentials: Option<Bytes>,
    },
    /// Challenge-response package discovery (round 1)
    SicilyPackageDiscovery,
    /// Challenge-response negotiate message (round 2)
    SicilyNegotiate(Bytes),
    /// Challenge-response authenticate message (round 3)
    SicilyResponse(Bytes),
}

impl fmt::Debug for BindAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAuthentication::Simple(password) => f
                .debug_tuple("Simple")
                .field(&format_args!("<{} bytes>", password.len()))
                .finish(),
            BindAuthentication::Sasl { mechanism, .. } => f
                .debug_struct("Sasl")
                .field("mechanism", mechanism)
                .finish_non_exhaustive(),
            BindAuthentication::SicilyPackageDiscovery => f.write_str("SicilyPackageDiscovery"),
            BindAuthentication::SicilyNegotiate(_) => f.write_str("SicilyNegotiate"),
            BindAuthentication::SicilyResponse(_) => f.write_str("SicilyResponse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: u8,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub deref: DerefAliases,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: String,
    pub attributes: Vec<String>,
    pub paged: Option<PagedResults>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

/// An encodable protocol request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Bind(BindRequest),
    Unbind,
    Search(SearchRequest),
    Add {
        dn: String,
        attributes: Vec<(String, Vec<Bytes>)>,
    },
    Delete {
        dn: String,
    },
    Modify {
        dn: String,
        changes: Vec<Modification>,
    },
    ModifyDn(ModifyDnRequest),
    Compare {
        dn: String,
        attribute: String,
        value: Bytes,
    },
    Abandon {
        message_id: MessageId,
    },
    Extended {
        name: String,
        value: Option<Bytes>,
    },
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::Bind(_) => Operation::Bind,
            Request::Unbind => Operation::Unbind,
            Request::Search(_) => Operation::Search,
            Request::Add { .. } => Operation::Add,
            Request::Delete { .. } => Operation::Delete,
            Request::Modify { .. } => Operation::Modify,
            Request::ModifyDn(_) => Operation::ModifyDn,
            Request::Compare { .. } => Operation::Compare,
            Request::Abandon { .. } => Operation::Abandon,
            Request::Extended { .. } => Operation::Extended,
        }
    }

    /// Whether this is the StartTLS extended request
    pub fn is_start_tls(&self) -> bool {
        matches!(self, Request::Extended { name, .. } if name == START_TLS_OID)
    }
}
