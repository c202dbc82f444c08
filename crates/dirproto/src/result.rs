//! Response side of the protocol message model

use crate::message::{Operation, NOTICE_OF_DISCONNECTION_OID};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Attribute name → values, as returned in a search entry
pub type Attributes = BTreeMap<String, Vec<Bytes>>;

/// Numeric result code of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);
    pub const OPERATIONS_ERROR: Self = Self(1);
    pub const PROTOCOL_ERROR: Self = Self(2);
    pub const TIME_LIMIT_EXCEEDED: Self = Self(3);
    pub const SIZE_LIMIT_EXCEEDED: Self = Self(4);
    pub const COMPARE_FALSE: Self = Self(5);
    pub const COMPARE_TRUE: Self = Self(6);
    pub const AUTH_METHOD_NOT_SUPPORTED: Self = Self(7);
    pub const STRONGER_AUTH_REQUIRED: Self = Self(8);
    pub const REFERRAL: Self = Self(10);
    pub const ADMIN_LIMIT_EXCEEDED: Self = Self(11);
    pub const UNAVAILABLE_CRITICAL_EXTENSION: Self = Self(12);
    pub const CONFIDENTIALITY_REQUIRED: Self = Self(13);
    pub const SASL_BIND_IN_PROGRESS: Self = Self(14);
    pub const NO_SUCH_ATTRIBUTE: Self = Self(16);
    pub const UNDEFINED_ATTRIBUTE_TYPE: Self = Self(17);
    pub const INAPPROPRIATE_MATCHING: Self = Self(18);
    pub const CONSTRAINT_VIOLATION: Self = Self(19);
    pub const ATTRIBUTE_OR_VALUE_EXISTS: Self = Self(20);
    pub const INVALID_ATTRIBUTE_SYNTAX: Self = Self(21);
    pub const NO_SUCH_OBJECT: Self = Self(32);
    pub const ALIAS_PROBLEM: Self = Self(33);
    pub const INVALID_DN_SYNTAX: Self = Self(34);
    pub const INAPPROPRIATE_AUTHENTICATION: Self = Self(48);
    pub const INVALID_CREDENTIALS: Self = Self(49);
    pub const INSUFFICIENT_ACCESS_RIGHTS: Self = Self(50);
    pub const BUSY: Self = Self(51);
    pub const UNAVAILABLE: Self = Self(52);
    pub const UNWILLING_TO_PERFORM: Self = Self(53);
    pub const NAMING_VIOLATION: Self = Self(64);
    pub const OBJECT_CLASS_VIOLATION: Self = Self(65);
    pub const NOT_ALLOWED_ON_NON_LEAF: Self = Self(66);
    pub const ENTRY_ALREADY_EXISTS: Self = Self(68);
    pub const OTHER: Self = Self(80);

    /// Protocol name of the code
    pub fn description(self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "operationsError",
            2 => "protocolError",
            3 => "timeLimitExceeded",
            4 => "sizeLimitExceeded",
            5 => "compareFalse",
            6 => "compareTrue",
            7 => "authMethodNotSupported",
            8 => "strongerAuthRequired",
            10 => "referral",
            11 => "adminLimitExceeded",
            12 => "unavailableCriticalExtension",
            13 => "confidentialityRequired",
            14 => "saslBindInProgress",
            16 => "noSuchAttribute",
            17 => "undefinedAttributeType",
            18 => "inappropriateMatching",
            19 => "constraintViolation",
            20 => "attributeOrValueExists",
            21 => "invalidAttributeSyntax",
            32 => "noSuchObject",
            33 => "aliasProblem",
            34 => "invalidDNSyntax",
            48 => "inappropriateAuthentication",
            49 => "invalidCredentials",
            50 => "insufficientAccessRights",
            51 => "busy",
            52 => "unavailable",
            53 => "unwillingToPerform",
            64 => "namingViolation",
            65 => "objectClassViolation",
            66 => "notAllowedOnNonLeaf",
            68 => "entryAlreadyExists",
            80 => "other",
            _ => "unknown",
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Codes that describe a normal outcome rather than a failure
    pub fn is_tolerated(self) -> bool {
        matches!(
            self,
            Self::SUCCESS
                | Self::COMPARE_FALSE
                | Self::COMPARE_TRUE
                | Self::REFERRAL
                | Self::SASL_BIND_IN_PROGRESS
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.0)
    }
}

/// Type tag of a response message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResponseKind {
    BindResponse,
    SearchResEntry,
    SearchResRef,
    SearchResDone,
    ModifyResponse,
    AddResponse,
    DelResponse,
    ModDnResponse,
    CompareResponse,
    ExtendedResp,
    IntermediateResponse,
}

impl ResponseKind {
    /// Final response kind expected for an operation
    pub fn for_operation(operation: Operation) -> Option<Self> {
        match operation {
            Operation::Bind => Some(ResponseKind::BindResponse),
            Operation::Search => Some(ResponseKind::SearchResDone),
            Operation::Add => Some(ResponseKind::AddResponse),
            Operation::Delete => Some(ResponseKind::DelResponse),
            Operation::Modify => Some(ResponseKind::ModifyResponse),
            Operation::ModifyDn => Some(ResponseKind::ModDnResponse),
            Operation::Compare => Some(ResponseKind::CompareResponse),
            Operation::Extended => Some(ResponseKind::ExtendedResp),
            Operation::Unbind | Operation::Abandon => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ResponseKind::BindResponse => "bindResponse",
            ResponseKind::SearchResEntry => "searchResEntry",
            ResponseKind::SearchResRef => "searchResRef",
            ResponseKind::SearchResDone => "searchResDone",
            ResponseKind::ModifyResponse => "modifyResponse",
            ResponseKind::AddResponse => "addResponse",
            ResponseKind::DelResponse => "delResponse",
            ResponseKind::ModDnResponse => "modDNResponse",
            ResponseKind::CompareResponse => "compareResponse",
            ResponseKind::ExtendedResp => "extendedResp",
            ResponseKind::IntermediateResponse => "intermediateResponse",
        }
    }
}

/// Outcome record of a completed operation: type tag, result code, description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub kind: ResponseKind,
    pub code: ResultCode,
    pub matched_dn: String,
    pub message: String,
    pub referrals: Vec<String>,
    /// SASL or challenge-response material returned by the server on bind
    pub server_creds: Option<Bytes>,
    /// Extended response name and value
    pub response_name: Option<String>,
    pub response_value: Option<Bytes>,
    /// Paged results continuation cookie, empty when the last page was sent
    pub cookie: Option<Bytes>,
}

impl LdapResult {
    pub fn new(kind: ResponseKind, code: ResultCode) -> Self {
        Self {
            kind,
            code,
            matched_dn: String::new(),
            message: String::new(),
            referrals: Vec::new(),
            server_creds: None,
            response_name: None,
            response_value: None,
            cookie: None,
        }
    }

    pub fn success(kind: ResponseKind) -> Self {
        Self::new(kind, ResultCode::SUCCESS)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_server_creds(mut self, creds: impl Into<Bytes>) -> Self {
        self.server_creds = Some(creds.into());
        self
    }

    pub fn with_cookie(mut self, cookie: impl Into<Bytes>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    pub fn description(&self) -> &'static str {
        self.code.description()
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Whether this is the notice-of-disconnection notification
    pub fn is_notice_of_disconnection(&self) -> bool {
        self.kind == ResponseKind::ExtendedResp
            && self.response_name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID)
    }
}

impl fmt::Display for LdapResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.name(), self.code)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

/// One entry returned by a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Attributes,
}

impl SearchEntry {
    pub fn new(dn: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            dn: dn.into(),
            attributes,
        }
    }

    /// First value of an attribute as UTF-8, if present
    pub fn first_str(&self, attribute: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
            .and_then(|(_, values)| values.first())
            .and_then(|value| std::str::from_utf8(value).ok())
    }
}

/// A response message read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Entry(SearchEntry),
    Reference(Vec<String>),
    Intermediate {
        name: Option<String>,
        value: Option<Bytes>,
    },
    /// Final message of an operation
    Done(LdapResult),
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::Entry(_) => ResponseKind::SearchResEntry,
            Response::Reference(_) => ResponseKind::SearchResRef,
            Response::Intermediate { .. } => ResponseKind::IntermediateResponse,
            Response::Done(result) => result.kind,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Response::Done(_))
    }
}
