//! The session façade
//!
//! A [`Session`] is a cheap, cloneable handle on one directory session. All
//! public entry points lock the same `tokio::sync::Mutex`, so calls made
//! from several tasks are linearised. Internally every operation works on
//! the already-locked `SessionState`; nested steps (bind opening the
//! connection, deferred resolution running a bind) call each other through
//! `&mut self` instead of re-locking.
//!
//! Lifecycle: closed → open → TLS → bound. In lazy mode `open`,
//! `start_tls` and `bind` only record intent; the next operation resolves
//! them, in that order, before its own request goes out.

use crate::changes::IntoChangeSet;
use crate::config::{AuthenticationKind, AutoBind, ServerInfoMode, SessionConfig, StrategyKind};
use crate::entries::{self, Entry, Signature};
use crate::error::{ErrorKind, LastError, Result, SessionError};
use crate::outcome::Outcome;
use crate::selector::{self, EndpointSelector};
use crate::server_info::{self, ServerInfo};
use crate::strategy::{self, Collected, Dispatched, MockDirectory, Strategy, StrategyContext};
use crate::tls::{StartTlsExtended, TlsNegotiator};
use crate::usage::Usage;
use bytes::Bytes;
use dirauth::{
    BindHandshake, ChallengeResponseFactory, Credentials, HandshakeStep, SaslCredentials,
    SaslNegotiation, SicilyHandshake, SimpleBind,
};
use dirproto::builder::{self, SearchParams};
use dirproto::{
    Connector, Control, Endpoint, LdapResult, MessageId, Operation, ProtocolError, Request, Response,
    ResponseKind, ResultCode, SearchEntry,
};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lifecycle steps recorded in lazy mode and not yet performed
#[derive(Debug, Default)]
struct Deferred {
    open: bool,
    start_tls: bool,
    /// Controls of a pending bind
    bind: Option<Vec<Control>>,
    /// Set while the pending steps run, so nested operations skip resolution
    executing: bool,
}

struct SessionState {
    config: SessionConfig,
    credentials: Option<Credentials>,
    sasl_credentials: SaslCredentials,
    challenge_response: Option<Arc<dyn ChallengeResponseFactory>>,
    tls: Arc<dyn TlsNegotiator>,
    selector: Box<dyn EndpointSelector>,
    endpoint: Option<Endpoint>,
    strategy: Box<dyn Strategy>,

    closed: bool,
    bound: bool,
    tls_started: bool,
    listening: bool,
    sasl_in_progress: bool,

    deferred: Deferred,
    resolutions: u64,

    last_error: Option<LastError>,
    last_request: Option<Request>,
    last_result: Option<LdapResult>,
    /// Items of the last operation; `entries` is derived from it and is
    /// reset whenever it changes
    responses: Vec<Response>,
    entries: Option<Vec<Entry>>,
    server_info: Option<ServerInfo>,
}

impl SessionState {
    fn is_lazy_intent(&self) -> bool {
        self.config.lazy && !self.deferred.executing
    }

    /// Record a failure and decide between raising and the sentinel
    fn finish<T>(&mut self, outcome: Result<T>, sentinel: T) -> Result<T> {
        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                // a failed result code was recorded with its description already
                if err.result().is_none() {
                    self.last_error = Some(LastError::from(&err));
                }
                debug!("Operation failed: {}", err);
                if self.config.raise_exceptions {
                    Err(err)
                } else {
                    Ok(sentinel)
                }
            }
        }
    }

    fn clear_response(&mut self) {
        self.last_result = None;
        self.responses.clear();
        self.entries = None;
    }

    /// Store what an operation produced
    ///
    /// A result code outside the tolerated set becomes the last error, and
    /// an error in raising mode.
    fn record(&mut self, collected: Collected) -> Result<()> {
        let Collected { responses, result } = collected;
        self.responses = responses;
        self.entries = None;
        self.last_result = result;

        if let Some(result) = &self.last_result {
            if !result.code.is_tolerated() {
                self.last_error = Some(LastError::new(
                    ErrorKind::OperationResult,
                    result.description(),
                ));
                if self.config.raise_exceptions {
                    return Err(SessionError::OperationResult(Box::new(result.clone())));
                }
            }
        }
        Ok(())
    }

    fn succeeded(&self, kind: ResponseKind) -> bool {
        self.last_result
            .as_ref()
            .is_some_and(|r| r.kind == kind && r.is_success())
    }

    fn check_writable(&self, operation: Operation) -> Result<()> {
        if self.config.read_only {
            return Err(SessionError::ReadOnlyViolation(
                operation.request_name().to_string(),
            ));
        }
        Ok(())
    }

    fn connection_lost(&mut self) {
        self.closed = true;
        self.bound = false;
        self.listening = false;
        self.tls_started = false;
    }

    async fn send_request(&mut self, request: Request, controls: &[Control]) -> Result<Dispatched> {
        let operation = request.operation();
        self.last_request = Some(request.clone());
        self.clear_response();
        debug!("Sending {}", operation);

        match self.strategy.send(request, controls).await {
            Ok(dispatched) => Ok(dispatched),
            Err(e) => {
                if e.is_transport_failure() && !self.strategy.is_open() {
                    warn!("{} lost the connection: {}", operation, e);
                    self.connection_lost();
                }
                Err(e)
            }
        }
    }

    /// Send, and record the outcome when the strategy completed it
    async fn perform(&mut self, request: Request, controls: &[Control]) -> Result<Option<MessageId>> {
        match self.send_request(request, controls).await? {
            Dispatched::Complete(collected) => {
                self.record(collected)?;
                Ok(None)
            }
            Dispatched::Pending(id) => Ok(Some(id)),
        }
    }

    /// Send and wait for the final result, whatever the strategy
    async fn exchange(&mut self, request: Request, controls: &[Control]) -> Result<Option<LdapResult>> {
        let collected = match self.send_request(request, controls).await? {
            Dispatched::Complete(collected) => collected,
            Dispatched::Pending(id) => self.strategy.collect(id).await?,
        };
        self.record(collected)?;
        Ok(self.last_result.clone())
    }

    async fn get_response_inner(&mut self, id: MessageId) -> Result<Collected> {
        let collected = self.strategy.collect(id).await?;
        self.record(collected.clone())?;
        Ok(collected)
    }

    async fn resolve_deferred(&mut self) -> Result<()> {
        if !self.is_lazy_intent() {
            return Ok(());
        }
        self.deferred.executing = true;
        self.resolutions += 1;
        let outcome = self.run_deferred().await;
        self.deferred.executing = false;
        outcome
    }

    async fn run_deferred(&mut self) -> Result<()> {
        let mut resolved = false;
        if self.deferred.open {
            debug!("Resolving deferred open");
            self.open_inner(false).await?;
            resolved = true;
        }
        if self.deferred.start_tls {
            debug!("Resolving deferred StartTLS");
            self.start_tls_inner(false).await?;
            resolved = true;
        }
        if let Some(controls) = self.deferred.bind.take() {
            debug!("Resolving deferred bind");
            self.bind_inner(&controls, false).await?;
            resolved = true;
        }
        if resolved {
            self.refresh_server_info_inner().await?;
        }
        Ok(())
    }

    async fn open_inner(&mut self, read_server_info: bool) -> Result<()> {
        if self.is_lazy_intent() {
            if self.closed {
                self.deferred.open = true;
                self.closed = false;
                debug!("Open deferred");
            }
            return Ok(());
        }
        self.deferred.open = false;
        if self.strategy.is_open() {
            self.closed = false;
            return Ok(());
        }

        let mut failure = None;
        let mut opened = None;
        for endpoint in self.selector.candidates() {
            match self.strategy.open(&endpoint).await {
                Ok(()) => {
                    opened = Some(endpoint);
                    break;
                }
                Err(e @ SessionError::Transport(_)) => {
                    self.selector.mark_failed(&endpoint);
                    failure = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        let Some(endpoint) = opened else {
            self.closed = true;
            return Err(failure.unwrap_or_else(|| {
                SessionError::Transport(ProtocolError::connection_error(
                    "no endpoint available to open",
                ))
            }));
        };

        info!("Session open to {} ({} strategy)", endpoint, self.strategy.kind());
        self.endpoint = Some(endpoint);
        self.closed = false;
        self.listening = true;
        self.tls_started = false;
        if read_server_info {
            self.refresh_server_info_inner().await?;
        }
        Ok(())
    }

    async fn start_tls_inner(&mut self, read_server_info: bool) -> Result<bool> {
        if self.is_lazy_intent() {
            self.deferred.start_tls = true;
            self.tls_started = true;
            debug!("StartTLS deferred");
            return Ok(true);
        }
        self.deferred.start_tls = false;
        if !self.strategy.is_open() {
            return Err(SessionError::Transport(ProtocolError::NotOpen));
        }

        let negotiator = Arc::clone(&self.tls);
        let started = negotiator.start_tls(self.strategy.as_mut()).await?;
        if started {
            self.tls_started = true;
            info!("TLS started");
        }
        if !self.strategy.is_synchronous() {
            // the upgrade completes inside the strategy
            return Ok(true);
        }
        if started && read_server_info {
            self.refresh_server_info_inner().await?;
        }
        Ok(started)
    }

    async fn bind_inner(&mut self, controls: &[Control], read_server_info: bool) -> Result<bool> {
        if self.is_lazy_intent() {
            self.deferred.bind = Some(controls.to_vec());
            self.bound = true;
            debug!("Bind deferred");
            return Ok(true);
        }
        self.deferred.bind = None;
        if self.closed || !self.strategy.is_open() {
            self.open_inner(false).await?;
        }

        let result = match self.authenticate(controls).await {
            Ok(result) => result,
            Err(e) => {
                self.bound = false;
                self.entries = None;
                return Err(e);
            }
        };
        self.bound = result
            .as_ref()
            .map_or(self.strategy.is_pooled(), LdapResult::is_success);
        self.entries = None;

        if self.bound {
            info!("Bound as {}", self.principal());
            if read_server_info {
                self.refresh_server_info_inner().await?;
            }
        } else if let Some(result) = &result {
            warn!("Bind failed: {}", result);
            self.last_error = Some(LastError::new(ErrorKind::BindFailure, result.description()));
        }
        Ok(self.bound)
    }

    fn principal(&self) -> &str {
        self.credentials
            .as_ref()
            .map(|c| c.user.as_str())
            .filter(|user| !user.is_empty())
            .unwrap_or("<anonymous>")
    }

    /// Run the bind exchange of the configured authentication kind
    async fn authenticate(&mut self, controls: &[Control]) -> Result<Option<LdapResult>> {
        let version = self.config.version;
        match self.config.authentication_kind() {
            AuthenticationKind::Anonymous => {
                let mut handshake = SimpleBind::anonymous(version);
                self.run_handshake(&mut handshake, controls).await
            }
            AuthenticationKind::Simple => {
                let credentials = self.credentials.clone().unwrap_or_else(|| {
                    Credentials::new(self.config.user.clone().unwrap_or_default(), Bytes::new())
                });
                let mut handshake = SimpleBind::new(version, credentials);
                self.run_handshake(&mut handshake, controls).await
            }
            AuthenticationKind::Sasl => self.sasl_bind(controls).await,
            AuthenticationKind::Ntlm => {
                let mut handshake = SicilyHandshake::new(
                    version,
                    self.credentials.as_ref(),
                    self.challenge_response.as_deref(),
                )?;
                self.run_handshake(&mut handshake, controls).await
            }
        }
    }

    async fn sasl_bind(&mut self, controls: &[Control]) -> Result<Option<LdapResult>> {
        let mechanism = self.config.sasl_mechanism.clone().unwrap_or_default();
        if !dirauth::sasl::is_supported(&mechanism) {
            return Err(SessionError::UnsupportedMechanism(format!(
                "requested SASL mechanism '{}' not supported",
                mechanism
            )));
        }
        if self.sasl_in_progress {
            debug!("SASL bind already in progress");
            return Ok(None);
        }
        let host = self
            .endpoint
            .as_ref()
            .map(|e| e.host.clone())
            .unwrap_or_default();
        let mut negotiation = SaslNegotiation::for_mechanism(
            self.config.version,
            &mechanism,
            &self.sasl_credentials,
            &host,
        )?;

        self.sasl_in_progress = true;
        let outcome = self.run_handshake(&mut negotiation, controls).await;
        self.sasl_in_progress = false;
        outcome
    }

    async fn run_handshake(
        &mut self,
        handshake: &mut dyn BindHandshake,
        controls: &[Control],
    ) -> Result<Option<LdapResult>> {
        debug!("Starting {} bind", handshake.name());
        let mut request = handshake.start()?;
        loop {
            let Some(result) = self.exchange(request, controls).await? else {
                return Ok(None);
            };
            match handshake.next(result)? {
                HandshakeStep::Send(next) => request = next,
                HandshakeStep::Done(result) => return Ok(Some(result)),
            }
        }
    }

    /// Read the root DSE, keeping the caller's last response intact
    fn refresh_server_info_inner(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            if self.closed
                || !self.strategy.is_open()
                || self.strategy.is_pooled()
                || self.strategy.no_real_endpoint()
                || self.config.server_info == ServerInfoMode::None
            {
                return Ok(());
            }

            let previous_request = self.last_request.take();
            let previous_result = self.last_result.take();
            let previous_responses = std::mem::take(&mut self.responses);
            let previous_entries = self.entries.take();

            let outcome = self.read_root_dse().await;

            self.last_request = previous_request;
            self.last_result = previous_result;
            self.responses = previous_responses;
            self.entries = previous_entries;

            match outcome {
                Ok(Some(info)) => {
                    debug!("Server info refreshed: {}", info);
                    self.server_info = Some(info);
                }
                Ok(None) => debug!("Server returned no root DSE"),
                Err(e) => {
                    warn!("Could not read server info: {}", e);
                    return Err(e);
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn read_root_dse(&mut self) -> Result<Option<ServerInfo>> {
        let search = server_info::root_dse_search();
        if let Outcome::Pending(id) = self.search_inner(&search, &[]).await? {
            self.get_response_inner(id).await?;
        }
        Ok(ServerInfo::from_responses(&self.responses))
    }

    async fn unbind_inner(&mut self, controls: &[Control]) {
        let only_deferred = self.deferred.open || self.deferred.bind.is_some();
        if self.is_lazy_intent() && only_deferred {
            if let Err(e) = self.strategy.close().await {
                debug!("Error closing deferred session: {}", e);
            }
            self.deferred = Deferred::default();
        } else if self.strategy.is_open() {
            if let Err(e) = self.send_request(builder::unbind(), controls).await {
                debug!("Ignoring unbind failure: {}", e);
            }
            if let Err(e) = self.strategy.close().await {
                debug!("Ignoring close failure: {}", e);
            }
            info!("Session unbound and closed");
        }
        self.connection_lost();
    }

    async fn search_inner(&mut self, params: &SearchParams, controls: &[Control]) -> Result<Outcome> {
        self.resolve_deferred().await?;
        let request = builder::search(params);
        Ok(match self.perform(request, controls).await? {
            Some(id) => Outcome::Pending(id),
            None => Outcome::Done(
                self.last_result
                    .as_ref()
                    .is_some_and(|r| r.kind == ResponseKind::SearchResDone)
                    && !self.responses.is_empty(),
            ),
        })
    }

    async fn paged_search_inner(
        &mut self,
        params: &SearchParams,
        page_size: u32,
        controls: &[Control],
    ) -> Result<Vec<SearchEntry>> {
        let mut entries = Vec::new();
        let mut cookie: Option<Bytes> = None;
        loop {
            let page = params.clone().paged(page_size, cookie.take());
            if let Outcome::Pending(id) = self.search_inner(&page, controls).await? {
                self.get_response_inner(id).await?;
            }
            entries.extend(self.responses.iter().filter_map(|r| match r {
                Response::Entry(entry) => Some(entry.clone()),
                _ => None,
            }));
            match self.last_result.as_ref() {
                Some(result) if result.is_success() => {}
                _ => break,
            }
            match self.last_result.as_ref().and_then(|r| r.cookie.clone()) {
                Some(next) if !next.is_empty() => cookie = Some(next),
                _ => break,
            }
        }
        debug!("Paged search returned {} entries", entries.len());
        Ok(entries)
    }

    /// Send a request of a kind that ends with one final result
    async fn simple_operation(
        &mut self,
        request: Request,
        controls: &[Control],
        success: impl FnOnce(&Self) -> bool,
    ) -> Result<Outcome> {
        self.resolve_deferred().await?;
        Ok(match self.perform(request, controls).await? {
            Some(id) => Outcome::Pending(id),
            None => Outcome::Done(success(self)),
        })
    }

    async fn abandon_inner(&mut self, id: MessageId, controls: &[Control]) -> Result<bool> {
        self.resolve_deferred().await?;
        match self.strategy.outstanding(id) {
            Some(operation) if operation.is_abandonable() => {
                self.send_request(builder::abandon(id), controls).await?;
                self.clear_response();
                debug!("Abandoned message {} ({})", id, operation);
                Ok(true)
            }
            Some(operation) => {
                debug!("Refusing to abandon {} message {}", operation, id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn describe(&self) -> String {
        let url = self
            .endpoint
            .as_ref()
            .map(Endpoint::url)
            .or_else(|| self.config.urls.first().cloned())
            .unwrap_or_else(|| crate::config::DEFAULT_URL.to_string());
        let secure = self.endpoint.as_ref().is_some_and(|e| e.use_ssl);
        let mut parts = vec![
            url,
            if secure { "ssl" } else { "cleartext" }.to_string(),
            format!("user: {}", self.principal()),
            if self.config.lazy { "lazy" } else { "not lazy" }.to_string(),
            if !self.bound {
                "unbound"
            } else if self.deferred.bind.is_some() {
                "deferred bind"
            } else {
                "bound"
            }
            .to_string(),
            if self.closed {
                "closed"
            } else if self.deferred.open {
                "deferred open"
            } else {
                "open"
            }
            .to_string(),
            if !self.tls_started {
                "tls not started"
            } else if self.deferred.start_tls {
                "deferred start_tls"
            } else {
                "tls started"
            }
            .to_string(),
            if self.listening { "listening" } else { "not listening" }.to_string(),
            format!("{} strategy", self.strategy.kind()),
        ];
        if self.config.read_only {
            parts.push("read-only".to_string());
        }
        parts.join(" - ")
    }
}

fn add_request(
    dn: &str,
    object_classes: &[&str],
    attributes: Vec<(String, Vec<Bytes>)>,
) -> Result<Request> {
    let (classes, rest) = merge_object_classes(object_classes, attributes);
    if classes.is_empty() {
        return Err(SessionError::ObjectClassMissing(dn.to_string()));
    }
    let mut all = Vec::with_capacity(rest.len() + 1);
    all.push(("objectClass".to_string(), classes));
    all.extend(rest);
    Ok(builder::add(dn, all))
}

/// Split an `objectClass` attribute out of `attributes`, merged with `classes`
fn merge_object_classes(
    classes: &[&str],
    attributes: Vec<(String, Vec<Bytes>)>,
) -> (Vec<Bytes>, Vec<(String, Vec<Bytes>)>) {
    let mut merged: Vec<Bytes> = Vec::new();
    let mut push = |value: Bytes| {
        if !merged.contains(&value) {
            merged.push(value);
        }
    };
    for class in classes {
        push(Bytes::from(class.to_string()));
    }
    let mut rest = Vec::with_capacity(attributes.len());
    for (name, values) in attributes {
        if name.eq_ignore_ascii_case("objectClass") {
            values.into_iter().for_each(&mut push);
        } else {
            rest.push((name, values));
        }
    }
    (merged, rest)
}

/// Handle on one directory session
///
/// Clones share the session. Operations answer with an [`Outcome`]:
/// `Done` when the strategy completed the request, `Pending` with the id to
/// pass to [`Session::get_response`] otherwise. Failures set
/// [`Session::last_error`]; they are returned as errors when
/// `raise_exceptions` is set, and as `Done(false)` / `false` otherwise.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionState>>,
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Open the connection (deferred in lazy mode)
    pub async fn open(&self) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let outcome = state.open_inner(true).await.map(|()| true);
        state.finish(outcome, false)
    }

    pub async fn start_tls(&self) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let outcome = state.start_tls_inner(true).await;
        state.finish(outcome, false)
    }

    /// Authenticate with the configured method
    pub async fn bind(&self, controls: &[Control]) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let outcome = state.bind_inner(controls, true).await;
        state.finish(outcome, false)
    }

    /// Send an unbind and close; never fails
    pub async fn unbind(&self) -> bool {
        let mut state = self.inner.lock().await;
        state.unbind_inner(&[]).await;
        true
    }

    pub async fn search(&self, params: &SearchParams, controls: &[Control]) -> Result<Outcome> {
        let mut state = self.inner.lock().await;
        let outcome = state.search_inner(params, controls).await;
        state.finish(outcome, Outcome::Done(false))
    }

    /// Run a paged search until the server's cookie is empty
    pub async fn paged_search_all(
        &self,
        params: &SearchParams,
        page_size: u32,
        controls: &[Control],
    ) -> Result<Vec<SearchEntry>> {
        let mut state = self.inner.lock().await;
        let outcome = state.paged_search_inner(params, page_size, controls).await;
        state.finish(outcome, Vec::new())
    }

    pub async fn compare(
        &self,
        dn: &str,
        attribute: &str,
        value: impl Into<Bytes>,
        controls: &[Control],
    ) -> Result<Outcome> {
        let request = builder::compare(dn, attribute, value);
        let mut state = self.inner.lock().await;
        let outcome = state
            .simple_operation(request, controls, |s| {
                s.last_result
                    .as_ref()
                    .is_some_and(|r| r.code == ResultCode::COMPARE_TRUE)
            })
            .await;
        state.finish(outcome, Outcome::Done(false))
    }

    /// Add an entry
    ///
    /// `object_classes` is merged with any `objectClass` attribute in
    /// `attributes`; at least one class is required.
    pub async fn add<I, A, V>(
        &self,
        dn: &str,
        object_classes: &[&str],
        attributes: I,
        controls: &[Control],
    ) -> Result<Outcome>
    where
        I: IntoIterator<Item = (A, Vec<V>)>,
        A: Into<String>,
        V: Into<Bytes>,
    {
        let attributes: Vec<(String, Vec<Bytes>)> = attributes
            .into_iter()
            .map(|(name, values)| (name.into(), values.into_iter().map(Into::into).collect()))
            .collect();

        let mut state = self.inner.lock().await;
        let request = state
            .check_writable(Operation::Add)
            .and_then(|()| add_request(dn, object_classes, attributes));
        let outcome = match request {
            Ok(request) => {
                state
                    .simple_operation(request, controls, |s| s.succeeded(ResponseKind::AddResponse))
                    .await
            }
            Err(e) => Err(e),
        };
        state.finish(outcome, Outcome::Done(false))
    }

    pub async fn delete(&self, dn: &str, controls: &[Control]) -> Result<Outcome> {
        let mut state = self.inner.lock().await;
        let outcome = match state.check_writable(Operation::Delete) {
            Ok(()) => {
                state
                    .simple_operation(builder::delete(dn), controls, |s| {
                        s.succeeded(ResponseKind::DelResponse)
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        state.finish(outcome, Outcome::Done(false))
    }

    /// Apply a change set to an entry
    ///
    /// The change set is validated before anything is sent.
    pub async fn modify(
        &self,
        dn: &str,
        changes: impl IntoChangeSet,
        controls: &[Control],
    ) -> Result<Outcome> {
        let mut state = self.inner.lock().await;
        let request = state
            .check_writable(Operation::Modify)
            .and_then(|()| changes.into_change_set())
            .map(|changes| builder::modify(dn, changes.into_modifications()));
        let outcome = match request {
            Ok(request) => {
                state
                    .simple_operation(request, controls, |s| {
                        s.succeeded(ResponseKind::ModifyResponse)
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        state.finish(outcome, Outcome::Done(false))
    }

    /// Rename or move an entry
    ///
    /// A move (`new_superior` set) must keep the entry's RDN.
    pub async fn modify_dn(
        &self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
        controls: &[Control],
    ) -> Result<Outcome> {
        let mut state = self.inner.lock().await;
        let request = state.check_writable(Operation::ModifyDn).and_then(|()| {
            if new_superior.is_some() && !dn.starts_with(new_rdn) {
                return Err(SessionError::InvalidDnTransition(format!(
                    "{} cannot change its RDN to {} while moving",
                    dn, new_rdn
                )));
            }
            Ok(builder::modify_dn(dn, new_rdn, delete_old_rdn, new_superior))
        });
        let outcome = match request {
            Ok(request) => {
                state
                    .simple_operation(request, controls, |s| {
                        s.succeeded(ResponseKind::ModDnResponse)
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        state.finish(outcome, Outcome::Done(false))
    }

    pub async fn extended(
        &self,
        name: &str,
        value: Option<Bytes>,
        controls: &[Control],
    ) -> Result<Outcome> {
        let mut state = self.inner.lock().await;
        let outcome = state
            .simple_operation(builder::extended(name, value), controls, |s| {
                s.succeeded(ResponseKind::ExtendedResp)
            })
            .await;
        state.finish(outcome, Outcome::Done(false))
    }

    /// Send an already built request
    pub async fn send(&self, request: Request, controls: &[Control]) -> Result<Outcome> {
        let mut state = self.inner.lock().await;
        let operation = request.operation();
        let writable = if operation.is_write() {
            state.check_writable(operation)
        } else {
            Ok(())
        };
        let outcome = match writable {
            Ok(()) => {
                state
                    .simple_operation(request, controls, |s| {
                        s.last_result.as_ref().is_some_and(LdapResult::is_success)
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        state.finish(outcome, Outcome::Done(false))
    }

    /// Ask the server to drop a pending operation
    ///
    /// Returns `false` for unknown ids and for bind, unbind and abandon
    /// requests.
    pub async fn abandon(&self, id: MessageId, controls: &[Control]) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let outcome = state.abandon_inner(id, controls).await;
        state.finish(outcome, false)
    }

    /// Wait for the outcome of a pending operation and make it the last response
    ///
    /// When the strategy can wait on its own, the session is unlocked for
    /// the duration of the wait, so other tasks may abandon `id` or unbind.
    pub async fn get_response(&self, id: MessageId) -> Result<Collected> {
        let mut state = self.inner.lock().await;
        let outcome = match state.strategy.collect_handle(id) {
            Some(handle) => {
                drop(state);
                let waited = handle.await;
                state = self.inner.lock().await;
                state.strategy.release(id);
                waited.and_then(|collected| state.record(collected.clone()).map(|()| collected))
            }
            None => state.get_response_inner(id).await,
        };
        if let Err(e) = &outcome {
            if e.result().is_none() {
                state.last_error = Some(LastError::from(e));
            }
        }
        outcome
    }

    pub async fn refresh_server_info(&self) -> Result<()> {
        let mut state = self.inner.lock().await;
        let outcome = state.refresh_server_info_inner().await;
        state.finish(outcome, ())
    }

    /// Entries of the last response, grouped by their own attribute sets
    pub async fn entries(&self) -> Result<Vec<Entry>> {
        let mut state = self.inner.lock().await;
        if let Some(entries) = &state.entries {
            return Ok(entries.clone());
        }
        let entries = entries::materialize(&state.responses, None)?;
        state.entries = Some(entries.clone());
        Ok(entries)
    }

    /// Entries of the last response, typed by the given signatures
    pub async fn materialize_with(&self, signatures: &[Signature]) -> Result<Vec<Entry>> {
        let mut state = self.inner.lock().await;
        let outcome = entries::materialize(&state.responses, Some(signatures));
        if let Err(e) = &outcome {
            state.last_error = Some(LastError::from(e));
        }
        outcome
    }

    pub async fn is_bound(&self) -> bool {
        self.inner.lock().await.bound
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn is_listening(&self) -> bool {
        self.inner.lock().await.listening
    }

    pub async fn tls_started(&self) -> bool {
        self.inner.lock().await.tls_started
    }

    pub async fn last_error(&self) -> Option<LastError> {
        self.inner.lock().await.last_error.clone()
    }

    pub async fn last_result(&self) -> Option<LdapResult> {
        self.inner.lock().await.last_result.clone()
    }

    pub async fn last_response(&self) -> Vec<Response> {
        self.inner.lock().await.responses.clone()
    }

    pub async fn last_request(&self) -> Option<Request> {
        self.inner.lock().await.last_request.clone()
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.inner.lock().await.server_info.clone()
    }

    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.inner.lock().await.endpoint.clone()
    }

    pub async fn strategy_kind(&self) -> StrategyKind {
        self.inner.lock().await.strategy.kind()
    }

    /// Usage counters, when `collect_usage` is on
    pub async fn usage(&self) -> Option<Usage> {
        let state = self.inner.lock().await;
        state.config.collect_usage.then(|| state.strategy.usage())
    }

    /// Change records rendered by the LDIF producer
    pub async fn change_stream(&self) -> Option<String> {
        self.inner.lock().await.strategy.change_stream()
    }

    /// Number of times deferred work was resolved
    pub async fn deferred_resolutions(&self) -> u64 {
        self.inner.lock().await.resolutions
    }

    /// One-line state summary
    pub async fn status(&self) -> String {
        self.inner.lock().await.describe()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Ok(state) => f.write_str(&state.describe()),
            Err(_) => f.write_str("Session { <busy> }"),
        }
    }
}

/// Assembles a [`Session`] and the collaborators that cannot come from a file
pub struct SessionBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
    tls: Option<Arc<dyn TlsNegotiator>>,
    challenge_response: Option<Arc<dyn ChallengeResponseFactory>>,
    sasl_credentials: SaslCredentials,
    selector: Option<Box<dyn EndpointSelector>>,
    directory: Option<Arc<MockDirectory>>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connector: None,
            tls: None,
            challenge_response: None,
            sasl_credentials: SaslCredentials::default(),
            selector: None,
            directory: None,
        }
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn tls_negotiator(mut self, tls: Arc<dyn TlsNegotiator>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Challenge-response package; without it NTLM binds report a missing package
    pub fn challenge_response(mut self, factory: Arc<dyn ChallengeResponseFactory>) -> Self {
        self.challenge_response = Some(factory);
        self
    }

    pub fn sasl_credentials(mut self, credentials: SaslCredentials) -> Self {
        self.sasl_credentials = credentials;
        self
    }

    pub fn endpoint_selector(mut self, selector: Box<dyn EndpointSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Directory served by the mock strategies
    pub fn mock_directory(mut self, directory: Arc<MockDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Build a closed session without contacting anything
    pub fn build(self) -> Result<Session> {
        let context = StrategyContext {
            connector: self.connector,
            directory: self.directory,
        };
        let strategy = strategy::build(&self.config, &context)?;
        let mut selector = match self.selector {
            Some(selector) => selector,
            None => selector::for_endpoints(self.config.endpoints()?),
        };
        selector.initialize();

        let credentials = match (&self.config.user, &self.config.password) {
            (Some(user), Some(password)) => Some(Credentials::new(user.clone(), password.clone())),
            (Some(user), None) => Some(Credentials::new(user.clone(), Bytes::new())),
            _ => None,
        };

        debug!(
            "Session built: {} strategy, {} authentication",
            strategy.kind(),
            self.config.authentication_kind().name()
        );
        let state = SessionState {
            config: self.config,
            credentials,
            sasl_credentials: self.sasl_credentials,
            challenge_response: self.challenge_response,
            tls: self.tls.unwrap_or_else(|| Arc::new(StartTlsExtended)),
            selector,
            endpoint: None,
            strategy,
            closed: true,
            bound: false,
            tls_started: false,
            listening: false,
            sasl_in_progress: false,
            deferred: Deferred::default(),
            resolutions: 0,
            last_error: None,
            last_request: None,
            last_result: None,
            responses: Vec::new(),
            entries: None,
            server_info: None,
        };
        Ok(Session {
            inner: Arc::new(Mutex::new(state)),
        })
    }

    /// Build the session and run the configured automatic bind
    pub async fn connect(self) -> Result<Session> {
        let auto_bind = self.config.auto_bind;
        let session = self.build()?;
        {
            let mut state = session.inner.lock().await;
            if auto_bind == AutoBind::None || state.strategy.no_real_endpoint() {
                drop(state);
                return Ok(session);
            }

            let outcome = auto_bind_sequence(&mut state, auto_bind).await;
            if let Err(e) = outcome {
                if e.result().is_none() {
                    state.last_error = Some(LastError::from(&e));
                }
                return Err(e);
            }
            if !state.bound {
                let reason = state
                    .last_error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                return Err(SessionError::BindFailure(format!(
                    "automatic bind not successful - {}",
                    reason
                )));
            }
        }
        Ok(session)
    }
}

async fn auto_bind_sequence(state: &mut SessionState, mode: AutoBind) -> Result<()> {
    state.open_inner(false).await?;
    if mode == AutoBind::TlsBeforeBind {
        state.start_tls_inner(false).await?;
    }
    state.bind_inner(&[], false).await?;
    if mode == AutoBind::TlsAfterBind {
        state.start_tls_inner(false).await?;
    }
    if state.bound {
        state.refresh_server_info_inner().await?;
    }
    Ok(())
}
