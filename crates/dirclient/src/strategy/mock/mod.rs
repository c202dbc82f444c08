//! Strategies backed by an in-memory directory
//!
//! `MockSync` answers every request inside `send`; `MockAsync` parks the
//! answer and hands back a message id to collect later. Both log what the
//! directory saw, which is what the session tests assert against.

pub mod directory;
pub mod filter;

pub use directory::{ConnectionState, DirectoryEvent, MockDirectory};

use super::{Collected, Dispatched, MessageIds, Strategy};
use crate::config::StrategyKind;
use crate::error::{Result, SessionError};
use crate::usage::Usage;
use async_trait::async_trait;
use dirproto::{builder, Control, Endpoint, MessageId, Operation, ProtocolError, Request, Response};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct MockStrategy {
    directory: Arc<MockDirectory>,
    synchronous: bool,
    open: bool,
    connection: ConnectionState,
    ids: MessageIds,
    pending: HashMap<MessageId, (Operation, Vec<Response>)>,
    usage: Usage,
    endpoint: Option<Endpoint>,
}

impl MockStrategy {
    pub fn new(directory: Arc<MockDirectory>, synchronous: bool) -> Self {
        Self {
            directory,
            synchronous,
            open: false,
            connection: ConnectionState::default(),
            ids: MessageIds::new(),
            pending: HashMap::new(),
            usage: Usage::new(),
            endpoint: None,
        }
    }

    pub fn directory(&self) -> &Arc<MockDirectory> {
        &self.directory
    }

    fn answer(&mut self, request: &Request) -> Vec<Response> {
        let responses = self.directory.execute(request, &mut self.connection);
        for response in &responses {
            self.usage.received(response);
        }
        responses
    }
}

#[async_trait]
impl Strategy for MockStrategy {
    fn kind(&self) -> StrategyKind {
        if self.synchronous {
            StrategyKind::MockSync
        } else {
            StrategyKind::MockAsync
        }
    }

    fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.open {
            return Ok(());
        }
        self.directory.record(DirectoryEvent::Open(endpoint.url()));
        self.open = true;
        self.connection = ConnectionState {
            bound_dn: None,
            tls: endpoint.use_ssl,
        };
        self.endpoint = Some(endpoint.clone());
        self.usage.open_sockets += 1;
        debug!("Mock connection to {} open", endpoint);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.directory.record(DirectoryEvent::Close);
        self.open = false;
        self.pending.clear();
        self.usage.closed_sockets += 1;
        Ok(())
    }

    async fn send(&mut self, request: Request, _controls: &[Control]) -> Result<Dispatched> {
        if !self.open {
            return Err(SessionError::Transport(ProtocolError::NotOpen));
        }
        let operation = request.operation();
        self.usage.transmitted(operation);
        if let Request::Abandon { message_id } = &request {
            if self.pending.remove(message_id).is_some() {
                trace!("Mock abandoned message {}", message_id);
            }
        }

        let responses = self.answer(&request);
        if !operation.expects_response() {
            return Ok(Dispatched::Complete(Collected::default()));
        }
        if self.synchronous {
            return Ok(Dispatched::Complete(Collected::from_messages(responses)));
        }
        let id = self.ids.next();
        self.pending.insert(id, (operation, responses));
        Ok(Dispatched::Pending(id))
    }

    async fn collect(&mut self, id: MessageId) -> Result<Collected> {
        self.pending
            .remove(&id)
            .map(|(_, responses)| Collected::from_messages(responses))
            .ok_or_else(|| {
                SessionError::Unsupported(format!("no outstanding request with message id {}", id))
            })
    }

    async fn start_tls(&mut self) -> Result<bool> {
        if self.endpoint.as_ref().is_some_and(|e| e.use_ssl) {
            return Ok(false);
        }
        let dispatched = self.send(builder::start_tls(), &[]).await?;
        let collected = match dispatched {
            Dispatched::Complete(collected) => collected,
            Dispatched::Pending(id) => self.collect(id).await?,
        };
        Ok(collected.is_success())
    }

    fn outstanding(&self, id: MessageId) -> Option<Operation> {
        self.pending.get(&id).map(|(operation, _)| *operation)
    }

    fn usage(&self) -> Usage {
        self.usage.clone()
    }
}
