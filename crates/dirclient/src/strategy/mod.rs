//! Transport strategies
//!
//! A [`Strategy`] owns the connection(s) of a session and moves requests
//! and responses over them. The session holds exactly one boxed strategy
//! and only looks at its capability flags; [`build`] is the single place
//! that turns a [`StrategyKind`] into a concrete type.

pub mod asynchronous;
pub mod ldif_producer;
pub mod mock;
pub mod pooled;
pub mod restartable;
pub mod sync;

pub use asynchronous::AsyncStrategy;
pub use ldif_producer::LdifProducer;
pub use mock::{DirectoryEvent, MockDirectory, MockStrategy};
pub use pooled::{PoolSettings, PooledStrategy};
pub use restartable::RestartableStrategy;
pub use sync::SyncStrategy;

use crate::config::{SessionConfig, StrategyKind};
use crate::error::{Result, SessionError};
use crate::usage::Usage;
use async_trait::async_trait;
use dirconf::ConfigError;
use futures::future::BoxFuture;
use dirproto::{
    Connector, Control, Endpoint, LdapResult, Link, MessageId, Operation, ProtocolError, Request,
    Response, UNSOLICITED_MESSAGE_ID,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything an operation produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collected {
    /// Entries, references and intermediate responses, in arrival order
    pub responses: Vec<Response>,
    /// Final result; absent for requests the server never answers
    pub result: Option<LdapResult>,
}

impl Collected {
    pub fn new(responses: Vec<Response>, result: Option<LdapResult>) -> Self {
        Self { responses, result }
    }

    /// Split a message sequence into items and final result
    pub fn from_messages(messages: Vec<Response>) -> Self {
        let mut collected = Collected::default();
        for message in messages {
            match message {
                Response::Done(result) => collected.result = Some(result),
                other => collected.responses.push(other),
            }
        }
        collected
    }

    pub fn is_success(&self) -> bool {
        self.result.as_ref().is_some_and(LdapResult::is_success)
    }
}

/// What `send` hands back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// The operation is over
    Complete(Collected),
    /// Present this id to [`Strategy::collect`] for the outcome
    Pending(MessageId),
}

/// A detached wait for one pending outcome
///
/// Owns everything it needs, so it can be awaited after the strategy (and
/// the session lock around it) has been let go.
pub type CollectHandle = BoxFuture<'static, Result<Collected>>;

/// Message id allocator; 0 is reserved for unsolicited notifications
#[derive(Debug, Clone)]
pub struct MessageIds {
    last: MessageId,
}

impl MessageIds {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    pub fn next(&mut self) -> MessageId {
        self.last = self.last.wrapping_add(1);
        if self.last == UNSOLICITED_MESSAGE_ID {
            self.last = 1;
        }
        self.last
    }
}

impl Default for MessageIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Execution model of a session
#[async_trait]
pub trait Strategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Whether `send` always completes the operation
    fn is_synchronous(&self) -> bool;

    /// Whether the strategy talks to no server at all
    fn no_real_endpoint(&self) -> bool {
        false
    }

    fn is_pooled(&self) -> bool {
        false
    }

    fn is_open(&self) -> bool;

    async fn open(&mut self, endpoint: &Endpoint) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    async fn send(&mut self, request: Request, controls: &[Control]) -> Result<Dispatched>;

    /// Outcome of a request that `send` left pending
    async fn collect(&mut self, id: MessageId) -> Result<Collected>;

    /// Wait for `id` without holding on to the strategy
    ///
    /// `None` when the outcome can only be read through [`Strategy::collect`].
    /// A handle that resolved is followed by [`Strategy::release`].
    fn collect_handle(&mut self, _id: MessageId) -> Option<CollectHandle> {
        None
    }

    /// Forget a request whose outcome was read through a [`CollectHandle`]
    fn release(&mut self, _id: MessageId) {}

    /// Run the StartTLS exchange and upgrade the transport
    async fn start_tls(&mut self) -> Result<bool>;

    /// Operation of a request still waiting for its outcome
    fn outstanding(&self, id: MessageId) -> Option<Operation>;

    fn usage(&self) -> Usage;

    /// Rendered change records, for strategies that produce them
    fn change_stream(&self) -> Option<String> {
        None
    }
}

/// Connect a link, counting the socket in `usage`
pub(crate) async fn connect_link(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    usage: &mut Usage,
) -> Result<Box<dyn Link>> {
    match connector.connect(endpoint).await {
        Ok(link) => {
            usage.open_sockets += 1;
            debug!("Connected to {}", link.peer());
            Ok(link)
        }
        Err(e) => {
            usage.failed_sockets += 1;
            warn!("Connection to {} failed: {}", endpoint, e);
            Err(SessionError::Transport(e))
        }
    }
}

/// Transport error for an unsolicited message, if it ends the connection
pub(crate) fn unsolicited_failure(response: &Response) -> Option<ProtocolError> {
    match response {
        Response::Done(result) if result.is_notice_of_disconnection() => {
            warn!("Notice of disconnection received: {}", result);
            Some(ProtocolError::ConnectionClosed)
        }
        _ => None,
    }
}

/// Whether a bind request can be replayed in a single round
pub(crate) fn is_single_round_bind(request: &Request) -> bool {
    use dirproto::BindAuthentication;
    match request {
        Request::Bind(bind) => match &bind.authentication {
            BindAuthentication::Simple(_) => true,
            BindAuthentication::Sasl { mechanism, .. } => mechanism.eq_ignore_ascii_case("EXTERNAL"),
            _ => false,
        },
        _ => false,
    }
}

/// Collaborators a strategy may need
#[derive(Clone, Default)]
pub struct StrategyContext {
    pub connector: Option<Arc<dyn Connector>>,
    pub directory: Option<Arc<MockDirectory>>,
}

/// Build the strategy named in `config`
pub fn build(config: &SessionConfig, context: &StrategyContext) -> Result<Box<dyn Strategy>> {
    let connector = || {
        context
            .connector
            .clone()
            .ok_or_else(|| SessionError::Config(ConfigError::MissingOption("connector".into())))
    };
    let directory = || context.directory.clone().unwrap_or_default();

    let strategy: Box<dyn Strategy> = match config.strategy {
        StrategyKind::Sync => Box::new(SyncStrategy::new(connector()?, config.response_timeout)),
        StrategyKind::Async => Box::new(
            AsyncStrategy::new(connector()?, config.response_timeout)
                .with_uncollected_age(config.uncollected_age),
        ),
        StrategyKind::Restartable => Box::new(RestartableStrategy::new(SyncStrategy::new(
            connector()?,
            config.response_timeout,
        ))),
        StrategyKind::Reusable => {
            let connector = connector()?;
            let timeout = config.response_timeout;
            let uncollected_age = config.uncollected_age;
            let asynchronous = config.pool_async;
            Box::new(PooledStrategy::new(
                PoolSettings::from_config(config),
                Box::new(move || -> Box<dyn Strategy> {
                    if asynchronous {
                        Box::new(
                            AsyncStrategy::new(Arc::clone(&connector), timeout)
                                .with_uncollected_age(uncollected_age),
                        )
                    } else {
                        Box::new(SyncStrategy::new(Arc::clone(&connector), timeout))
                    }
                }),
            ))
        }
        StrategyKind::Ldif => Box::new(LdifProducer::new()),
        StrategyKind::MockSync => Box::new(MockStrategy::new(directory(), true)),
        StrategyKind::MockAsync => Box::new(MockStrategy::new(directory(), false)),
    };
    debug!("Built {} strategy", strategy.kind());
    Ok(strategy)
}
