//! In-memory directory answering protocol requests

use super::filter::Filter;
use bytes::Bytes;
use dirproto::{
    Attributes, BindAuthentication, BindRequest, ChangeType, LdapResult, Modification,
    ModifyDnRequest, Operation, PagedResults, Request, Response, ResponseKind, ResultCode, Scope,
    SearchEntry, SearchRequest, ALL_ATTRIBUTES, NO_ATTRIBUTES, PAGED_RESULTS_OID, START_TLS_OID,
    WHO_AM_I_OID,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Challenge the mock hands out in the sicily negotiate round
pub const SICILY_CHALLENGE: &[u8] = b"mock-challenge";

/// Something that happened to the directory, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    Open(String),
    StartTls,
    Request(Operation),
    Close,
}

/// Per-connection state of a mock client
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub bound_dn: Option<String>,
    pub tls: bool,
}

struct State {
    entries: BTreeMap<String, SearchEntry>,
    events: Vec<DirectoryEvent>,
    root_dse: Attributes,
    sicily_packages: String,
    fail_next: Option<ResultCode>,
}

/// Entries keyed by case-insensitive DN, plus an event log
pub struct MockDirectory {
    state: Mutex<State>,
}

fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

/// Normalized parent DN, `""` for a top-level entry
fn parent_of(normalized: &str) -> &str {
    normalized.split_once(',').map(|(_, parent)| parent).unwrap_or("")
}

fn split_rdn(rdn: &str) -> Option<(&str, &str)> {
    rdn.split_once('=').map(|(a, v)| (a.trim(), v.trim()))
}

fn find_attribute<'a>(attributes: &'a mut Attributes, name: &str) -> Option<&'a mut Vec<Bytes>> {
    attributes
        .iter_mut()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        .map(|(_, values)| values)
}

fn has_value(values: &[Bytes], value: &[u8]) -> bool {
    values.iter().any(|v| v.eq_ignore_ascii_case(value))
}

fn default_root_dse() -> Attributes {
    let strings = |values: &[&str]| -> Vec<Bytes> {
        values.iter().map(|v| Bytes::from(v.to_string())).collect()
    };
    let mut root = Attributes::new();
    root.insert("objectClass".into(), strings(&["top"]));
    root.insert("supportedLDAPVersion".into(), strings(&["3"]));
    root.insert(
        "supportedExtension".into(),
        strings(&[START_TLS_OID, WHO_AM_I_OID]),
    );
    root.insert("supportedControl".into(), strings(&[PAGED_RESULTS_OID]));
    root.insert("supportedSASLMechanisms".into(), strings(&["EXTERNAL"]));
    root.insert("vendorName".into(), strings(&["dirclient mock directory"]));
    root
}

impl Default for MockDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDirectory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: BTreeMap::new(),
                events: Vec::new(),
                root_dse: default_root_dse(),
                sicily_packages: "GSS-SPNEGO;NTLM".to_string(),
                fail_next: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an entry, replacing any entry with the same DN
    pub fn add_entry<I, A, V>(&self, dn: &str, attributes: I)
    where
        I: IntoIterator<Item = (A, Vec<V>)>,
        A: Into<String>,
        V: Into<Bytes>,
    {
        let attributes: Attributes = attributes
            .into_iter()
            .map(|(name, values)| (name.into(), values.into_iter().map(Into::into).collect()))
            .collect();
        self.state()
            .entries
            .insert(normalize_dn(dn), SearchEntry::new(dn, attributes));
    }

    pub fn entry(&self, dn: &str) -> Option<SearchEntry> {
        self.state().entries.get(&normalize_dn(dn)).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events(&self) -> Vec<DirectoryEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Number of logged requests of one operation kind
    pub fn count(&self, operation: Operation) -> usize {
        self.state()
            .events
            .iter()
            .filter(|e| **e == DirectoryEvent::Request(operation))
            .count()
    }

    pub fn set_root_dse_attribute<V: Into<Bytes>>(&self, name: &str, values: Vec<V>) {
        self.state()
            .root_dse
            .insert(name.to_string(), values.into_iter().map(Into::into).collect());
    }

    /// `;`-separated package list returned by sicily package discovery
    pub fn set_sicily_packages(&self, packages: &str) {
        self.state().sicily_packages = packages.to_string();
    }

    /// Answer the next request that expects a response with `code`
    pub fn fail_next(&self, code: ResultCode) {
        self.state().fail_next = Some(code);
    }

    /// Append an event to the log
    pub fn record(&self, event: DirectoryEvent) {
        self.state().events.push(event);
    }

    /// Execute one request and return every response message it produces
    ///
    /// `connection` carries what the directory knows about the calling
    /// connection: who is bound and whether TLS is on.
    pub fn execute(&self, request: &Request, connection: &mut ConnectionState) -> Vec<Response> {
        let mut state = self.state();
        let operation = request.operation();
        state.events.push(DirectoryEvent::Request(operation));

        let Some(kind) = ResponseKind::for_operation(operation) else {
            return Vec::new();
        };
        if let Some(code) = state.fail_next.take() {
            return vec![Response::Done(
                LdapResult::new(kind, code).with_message("injected failure"),
            )];
        }

        let (mut responses, result) = match request {
            Request::Bind(bind) => (Vec::new(), state.bind(bind, connection)),
            Request::Search(search) => state.search(search),
            Request::Add { dn, attributes } => (Vec::new(), state.add(dn, attributes)),
            Request::Delete { dn } => (Vec::new(), state.delete(dn)),
            Request::Modify { dn, changes } => (Vec::new(), state.modify(dn, changes)),
            Request::ModifyDn(modify_dn) => (Vec::new(), state.modify_dn(modify_dn)),
            Request::Compare {
                dn,
                attribute,
                value,
            } => (Vec::new(), state.compare(dn, attribute, value)),
            Request::Extended { name, .. } => {
                let result = state.extended(name, connection);
                if name == START_TLS_OID && result.is_success() {
                    state.events.push(DirectoryEvent::StartTls);
                }
                (Vec::new(), result)
            }
            Request::Unbind | Request::Abandon { .. } => return Vec::new(),
        };
        responses.push(Response::Done(result));
        responses
    }
}

impl State {
    fn bind(&self, bind: &BindRequest, connection: &mut ConnectionState) -> LdapResult {
        let result = |code| LdapResult::new(ResponseKind::BindResponse, code);
        connection.bound_dn = None;

        match &bind.authentication {
            BindAuthentication::Simple(password) => {
                if bind.name.is_empty() && password.is_empty() {
                    return result(ResultCode::SUCCESS);
                }
                if password.is_empty() {
                    return result(ResultCode::UNWILLING_TO_PERFORM)
                        .with_message("unauthenticated bind not allowed");
                }
                let matches = self
                    .entries
                    .get(&normalize_dn(&bind.name))
                    .and_then(|entry| {
                        entry
                            .attributes
                            .iter()
                            .find(|(name, _)| name.eq_ignore_ascii_case("userPassword"))
                    })
                    .is_some_and(|(_, values)| values.iter().any(|v| v == password));
                if matches {
                    connection.bound_dn = Some(bind.name.clone());
                    result(ResultCode::SUCCESS)
                } else {
                    result(ResultCode::INVALID_CREDENTIALS)
                }
            }
            BindAuthentication::Sasl { mechanism, credentials } => {
                if !mechanism.eq_ignore_ascii_case("EXTERNAL") {
                    return result(ResultCode::AUTH_METHOD_NOT_SUPPORTED)
                        .with_message(format!("SASL mechanism {} not supported", mechanism));
                }
                let authz = credentials
                    .as_ref()
                    .filter(|c| !c.is_empty())
                    .map(|c| String::from_utf8_lossy(c).into_owned());
                connection.bound_dn = Some(authz.unwrap_or_else(|| "cn=external".to_string()));
                result(ResultCode::SUCCESS)
            }
            BindAuthentication::SicilyPackageDiscovery => {
                result(ResultCode::SUCCESS).with_server_creds(self.sicily_packages.clone())
            }
            BindAuthentication::SicilyNegotiate(_) => {
                result(ResultCode::SUCCESS).with_server_creds(Bytes::from_static(SICILY_CHALLENGE))
            }
            BindAuthentication::SicilyResponse(response) => {
                if response.is_empty() {
                    result(ResultCode::INVALID_CREDENTIALS)
                } else {
                    connection.bound_dn = Some(bind.name.clone());
                    result(ResultCode::SUCCESS)
                }
            }
        }
    }

    fn root_dse(&self) -> SearchEntry {
        let mut attributes = self.root_dse.clone();
        if !attributes.contains_key("namingContexts") {
            let contexts: Vec<Bytes> = self
                .entries
                .iter()
                .filter(|(dn, _)| !self.entries.contains_key(parent_of(dn)))
                .map(|(_, entry)| Bytes::from(entry.dn.clone()))
                .collect();
            attributes.insert("namingContexts".into(), contexts);
        }
        SearchEntry::new("", attributes)
    }

    fn in_scope(&self, base: &str, scope: Scope) -> Vec<SearchEntry> {
        if base.is_empty() && scope == Scope::Base {
            return vec![self.root_dse()];
        }
        let suffix = format!(",{}", base);
        self.entries
            .iter()
            .filter(|(dn, _)| match scope {
                Scope::Base => dn.as_str() == base,
                Scope::OneLevel => parent_of(dn) == base,
                Scope::Subtree => base.is_empty() || dn.as_str() == base || dn.ends_with(&suffix),
            })
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    fn search(&self, search: &SearchRequest) -> (Vec<Response>, LdapResult) {
        let done = |code| LdapResult::new(ResponseKind::SearchResDone, code);
        let base = normalize_dn(&search.base);
        if !base.is_empty() && !self.entries.contains_key(&base) {
            return (Vec::new(), done(ResultCode::NO_SUCH_OBJECT));
        }
        let filter: Filter = match search.filter.parse() {
            Ok(filter) => filter,
            Err(e) => return (Vec::new(), done(ResultCode::PROTOCOL_ERROR).with_message(e)),
        };

        let matched: Vec<SearchEntry> = self
            .in_scope(&base, search.scope)
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect();

        let (window, next_cookie) = match &search.paged {
            Some(PagedResults { size, cookie, .. }) => {
                let offset: usize = std::str::from_utf8(cookie)
                    .ok()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                let size = (*size as usize).max(1);
                let end = (offset + size).min(matched.len());
                let next = if end < matched.len() {
                    Bytes::from(end.to_string())
                } else {
                    Bytes::new()
                };
                (matched.get(offset..end).unwrap_or_default().to_vec(), Some(next))
            }
            None => (matched, None),
        };

        let limit = search.size_limit as usize;
        let truncated = limit > 0 && window.len() > limit;
        let responses: Vec<Response> = window
            .into_iter()
            .take(if truncated { limit } else { usize::MAX })
            .map(|entry| Response::Entry(select_attributes(entry, &search.attributes, search.types_only)))
            .collect();

        let mut result = if truncated {
            done(ResultCode::SIZE_LIMIT_EXCEEDED)
        } else {
            done(ResultCode::SUCCESS)
        };
        result.cookie = next_cookie;
        (responses, result)
    }

    fn add(&mut self, dn: &str, attributes: &[(String, Vec<Bytes>)]) -> LdapResult {
        let result = |code| LdapResult::new(ResponseKind::AddResponse, code);
        let key = normalize_dn(dn);
        if self.entries.contains_key(&key) {
            return result(ResultCode::ENTRY_ALREADY_EXISTS);
        }
        let mut stored = Attributes::new();
        for (name, values) in attributes {
            stored.entry(name.clone()).or_default().extend(values.iter().cloned());
        }
        self.entries.insert(key, SearchEntry::new(dn, stored));
        result(ResultCode::SUCCESS)
    }

    fn has_children(&self, key: &str) -> bool {
        self.entries.keys().any(|dn| parent_of(dn) == key)
    }

    fn delete(&mut self, dn: &str) -> LdapResult {
        let result = |code| LdapResult::new(ResponseKind::DelResponse, code);
        let key = normalize_dn(dn);
        if !self.entries.contains_key(&key) {
            return result(ResultCode::NO_SUCH_OBJECT);
        }
        if self.has_children(&key) {
            return result(ResultCode::NOT_ALLOWED_ON_NON_LEAF);
        }
        self.entries.remove(&key);
        result(ResultCode::SUCCESS)
    }

    fn modify(&mut self, dn: &str, changes: &[Modification]) -> LdapResult {
        let result = |code| LdapResult::new(ResponseKind::ModifyResponse, code);
        let key = normalize_dn(dn);
        let Some(entry) = self.entries.get(&key) else {
            return result(ResultCode::NO_SUCH_OBJECT);
        };

        // Changes apply all or nothing
        let mut attributes = entry.attributes.clone();
        for change in changes {
            if let Err(code) = apply_change(&mut attributes, change) {
                return result(code).with_message(format!("{} on {}", code, change.attribute));
            }
        }
        attributes.retain(|_, values| !values.is_empty());
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.attributes = attributes;
        }
        result(ResultCode::SUCCESS)
    }

    fn modify_dn(&mut self, request: &ModifyDnRequest) -> LdapResult {
        let result = |code| LdapResult::new(ResponseKind::ModDnResponse, code);
        let key = normalize_dn(&request.dn);
        if !self.entries.contains_key(&key) {
            return result(ResultCode::NO_SUCH_OBJECT);
        }
        if self.has_children(&key) {
            return result(ResultCode::NOT_ALLOWED_ON_NON_LEAF);
        }
        let Some((new_attribute, new_value)) = split_rdn(&request.new_rdn) else {
            return result(ResultCode::INVALID_DN_SYNTAX);
        };

        let superior = match &request.new_superior {
            Some(superior) => superior.trim().to_string(),
            None => request
                .dn
                .split_once(',')
                .map(|(_, parent)| parent.trim().to_string())
                .unwrap_or_default(),
        };
        let new_dn = if superior.is_empty() {
            request.new_rdn.trim().to_string()
        } else {
            format!("{},{}", request.new_rdn.trim(), superior)
        };
        let new_key = normalize_dn(&new_dn);
        if new_key != key && self.entries.contains_key(&new_key) {
            return result(ResultCode::ENTRY_ALREADY_EXISTS);
        }

        let Some(mut entry) = self.entries.remove(&key) else {
            return result(ResultCode::NO_SUCH_OBJECT);
        };
        if request.delete_old_rdn {
            let old_rdn = request.dn.split(',').next().unwrap_or_default();
            if let Some((old_attribute, old_value)) = split_rdn(old_rdn) {
                if let Some(values) = find_attribute(&mut entry.attributes, old_attribute) {
                    values.retain(|v| !v.eq_ignore_ascii_case(old_value.as_bytes()));
                }
                entry.attributes.retain(|_, values| !values.is_empty());
            }
        }
        match find_attribute(&mut entry.attributes, new_attribute) {
            Some(values) if has_value(values, new_value.as_bytes()) => {}
            Some(values) => values.push(Bytes::from(new_value.to_string())),
            None => {
                entry
                    .attributes
                    .insert(new_attribute.to_string(), vec![Bytes::from(new_value.to_string())]);
            }
        }
        entry.dn = new_dn;
        self.entries.insert(new_key, entry);
        result(ResultCode::SUCCESS)
    }

    fn compare(&self, dn: &str, attribute: &str, value: &Bytes) -> LdapResult {
        let result = |code| LdapResult::new(ResponseKind::CompareResponse, code);
        let Some(entry) = self.entries.get(&normalize_dn(dn)) else {
            return result(ResultCode::NO_SUCH_OBJECT);
        };
        match entry
            .attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
        {
            None => result(ResultCode::NO_SUCH_ATTRIBUTE),
            Some((_, values)) if has_value(values, value) => result(ResultCode::COMPARE_TRUE),
            Some(_) => result(ResultCode::COMPARE_FALSE),
        }
    }

    fn extended(&self, name: &str, connection: &mut ConnectionState) -> LdapResult {
        let mut result = match name {
            START_TLS_OID if connection.tls => {
                LdapResult::new(ResponseKind::ExtendedResp, ResultCode::OPERATIONS_ERROR)
                    .with_message("TLS already started")
            }
            START_TLS_OID => {
                connection.tls = true;
                LdapResult::success(ResponseKind::ExtendedResp)
            }
            WHO_AM_I_OID => {
                let mut result = LdapResult::success(ResponseKind::ExtendedResp);
                result.response_value = Some(Bytes::from(
                    connection
                        .bound_dn
                        .as_ref()
                        .map(|dn| format!("dn:{}", dn))
                        .unwrap_or_default(),
                ));
                result
            }
            other => LdapResult::new(ResponseKind::ExtendedResp, ResultCode::PROTOCOL_ERROR)
                .with_message(format!("extended operation {} not supported", other)),
        };
        result.response_name = Some(name.to_string());
        result
    }
}

fn apply_change(attributes: &mut Attributes, change: &Modification) -> Result<(), ResultCode> {
    let existing = find_attribute(attributes, &change.attribute);
    match change.change {
        ChangeType::Add => match existing {
            Some(values) => {
                for value in &change.values {
                    if has_value(values, value) {
                        return Err(ResultCode::ATTRIBUTE_OR_VALUE_EXISTS);
                    }
                    values.push(value.clone());
                }
            }
            None => {
                attributes.insert(change.attribute.clone(), change.values.clone());
            }
        },
        ChangeType::Delete => {
            let values = existing.ok_or(ResultCode::NO_SUCH_ATTRIBUTE)?;
            if change.values.is_empty() {
                values.clear();
            } else {
                for value in &change.values {
                    if !has_value(values, value) {
                        return Err(ResultCode::NO_SUCH_ATTRIBUTE);
                    }
                    values.retain(|v| !v.eq_ignore_ascii_case(value));
                }
            }
        }
        ChangeType::Replace => match existing {
            Some(values) => *values = change.values.clone(),
            None => {
                attributes.insert(change.attribute.clone(), change.values.clone());
            }
        },
        ChangeType::Increment => {
            let values = existing.ok_or(ResultCode::NO_SUCH_ATTRIBUTE)?;
            let delta: i64 = change
                .values
                .first()
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|v| v.trim().parse().ok())
                .ok_or(ResultCode::INVALID_ATTRIBUTE_SYNTAX)?;
            for value in values.iter_mut() {
                let current: i64 = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.trim().parse().ok())
                    .ok_or(ResultCode::CONSTRAINT_VIOLATION)?;
                *value = Bytes::from((current + delta).to_string());
            }
        }
    }
    Ok(())
}

/// Apply the requested attribute list to an entry
fn select_attributes(entry: SearchEntry, requested: &[String], types_only: bool) -> SearchEntry {
    let all = requested.is_empty() || requested.iter().any(|a| a == ALL_ATTRIBUTES);
    let none = requested.iter().all(|a| a == NO_ATTRIBUTES || a == "+");
    let attributes = entry
        .attributes
        .into_iter()
        .filter(|(name, _)| {
            all || (!none && requested.iter().any(|r| r.eq_ignore_ascii_case(name)))
        })
        .map(|(name, values)| if types_only { (name, Vec::new()) } else { (name, values) })
        .collect();
    SearchEntry::new(entry.dn, attributes)
}
