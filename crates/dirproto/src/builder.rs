//! Pure request builders
//!
//! Each builder takes the semantic parameters of one operation and returns
//! an encodable [`Request`]. Nothing here touches a socket.

use crate::message::{
    BindAuthentication, BindRequest, DerefAliases, MessageId, Modification, ModifyDnRequest,
    PagedResults, Request, Scope, SearchRequest, ALL_OPERATIONAL_ATTRIBUTES, NO_ATTRIBUTES,
    START_TLS_OID,
};
use bytes::Bytes;

/// Protocol version sent when the caller does not pick one
pub const DEFAULT_PROTOCOL_VERSION: u8 = 3;

pub fn bind_anonymous(version: u8) -> Request {
    bind_simple(version, "", Bytes::new())
}

pub fn bind_simple(version: u8, name: &str, password: impl Into<Bytes>) -> Request {
    Request::Bind(BindRequest {
        version,
        name: name.to_string(),
        authentication: BindAuthentication::Simple(password.into()),
    })
}

pub fn bind_sasl(
    version: u8,
    name: &str,
    mechanism: &str,
    credentials: Option<Bytes>,
) -> Request {
    Request::Bind(BindRequest {
        version,
        name: name.to_string(),
        authentication: BindAuthentication::Sasl {
            mechanism: mechanism.to_string(),
            credentials,
        },
    })
}

/// Bind request carrying one of the challenge-response rounds
pub fn bind_sicily(version: u8, name: &str, authentication: BindAuthentication) -> Request {
    Request::Bind(BindRequest {
        version,
        name: name.to_string(),
        authentication,
    })
}

pub fn unbind() -> Request {
    Request::Unbind
}

/// Search parameters with the usual defaults (subtree, always deref, no limits)
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub base: String,
    pub filter: String,
    pub scope: Scope,
    pub deref: DerefAliases,
    pub attributes: Vec<String>,
    pub operational_attributes: bool,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    pub paged_size: Option<u32>,
    pub paged_criticality: bool,
    pub paged_cookie: Option<Bytes>,
}

impl SearchParams {
    pub fn new(base: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            filter: filter.into(),
            scope: Scope::default(),
            deref: DerefAliases::default(),
            attributes: Vec::new(),
            operational_attributes: false,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            paged_size: None,
            paged_criticality: false,
            paged_cookie: None,
        }
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn operational_attributes(mut self, enabled: bool) -> Self {
        self.operational_attributes = enabled;
        self
    }

    pub fn size_limit(mut self, limit: u32) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn paged(mut self, size: u32, cookie: Option<Bytes>) -> Self {
        self.paged_size = Some(size);
        self.paged_cookie = cookie;
        self
    }
}

/// Build a search request
///
/// An empty attribute list asks for no attributes at all (`1.1`), and
/// `operational_attributes` appends `+` to whatever was requested.
pub fn search(params: &SearchParams) -> Request {
    let mut attributes: Vec<String> = if params.attributes.is_empty() {
        vec![NO_ATTRIBUTES.to_string()]
    } else {
        params.attributes.clone()
    };
    if params.operational_attributes && !attributes.iter().any(|a| a == ALL_OPERATIONAL_ATTRIBUTES)
    {
        attributes.push(ALL_OPERATIONAL_ATTRIBUTES.to_string());
    }

    let paged = params.paged_size.map(|size| PagedResults {
        size,
        cookie: params.paged_cookie.clone().unwrap_or_default(),
        critical: params.paged_criticality,
    });

    Request::Search(SearchRequest {
        base: params.base.clone(),
        scope: params.scope,
        deref: params.deref,
        size_limit: params.size_limit,
        time_limit: params.time_limit,
        types_only: params.types_only,
        filter: params.filter.clone(),
        attributes,
        paged,
    })
}

pub fn add(dn: &str, attributes: Vec<(String, Vec<Bytes>)>) -> Request {
    Request::Add {
        dn: dn.to_string(),
        attributes,
    }
}

pub fn delete(dn: &str) -> Request {
    Request::Delete { dn: dn.to_string() }
}

pub fn modify(dn: &str, changes: Vec<Modification>) -> Request {
    Request::Modify {
        dn: dn.to_string(),
        changes,
    }
}

pub fn modify_dn(
    dn: &str,
    new_rdn: &str,
    delete_old_rdn: bool,
    new_superior: Option<&str>,
) -> Request {
    Request::ModifyDn(ModifyDnRequest {
        dn: dn.to_string(),
        new_rdn: new_rdn.to_string(),
        delete_old_rdn,
        new_superior: new_superior.map(str::to_string),
    })
}

pub fn compare(dn: &str, attribute: &str, value: impl Into<Bytes>) -> Request {
    Request::Compare {
        dn: dn.to_string(),
        attribute: attribute.to_string(),
        value: value.into(),
    }
}

pub fn abandon(message_id: MessageId) -> Request {
    Request::Abandon { message_id }
}

pub fn extended(name: &str, value: Option<Bytes>) -> Request {
    Request::Extended {
        name: name.to_string(),
        value,
    }
}

pub fn start_tls() -> Request {
    extended(START_TLS_OID, None)
}
