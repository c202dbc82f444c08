//! Synchronous strategy: each send reads until its final response

use super::{connect_link, unsolicited_failure, Collected, Dispatched, MessageIds, Strategy};
use crate::config::StrategyKind;
use crate::error::{Result, SessionError};
use crate::usage::Usage;
use async_trait::async_trait;
use dirproto::builder;
use dirproto::{
    Connector, Control, Endpoint, Link, MessageId, Operation, ProtocolError, Request, Response,
    UNSOLICITED_MESSAGE_ID,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub struct SyncStrategy {
    connector: Arc<dyn Connector>,
    link: Option<Box<dyn Link>>,
    endpoint: Option<Endpoint>,
    ids: MessageIds,
    /// Requests on the wire whose final response has not been read yet
    outstanding: HashMap<MessageId, Operation>,
    response_timeout: Option<Duration>,
    usage: Usage,
}

impl SyncStrategy {
    pub fn new(connector: Arc<dyn Connector>, response_timeout: Option<Duration>) -> Self {
        Self {
            connector,
            link: None,
            endpoint: None,
            ids: MessageIds::new(),
            outstanding: HashMap::new(),
            response_timeout,
            usage: Usage::new(),
        }
    }

    fn link(&mut self) -> Result<&mut Box<dyn Link>> {
        self.link
            .as_mut()
            .ok_or(SessionError::Transport(ProtocolError::NotOpen))
    }

    /// Forget a link that failed underneath us
    fn drop_link(&mut self, reason: &SessionError) {
        if let Some(link) = self.link.take() {
            warn!("Dropping link to {}: {}", link.peer(), reason);
            self.usage.closed_sockets += 1;
        }
        self.outstanding.clear();
    }

    async fn recv_one(&mut self) -> Result<(MessageId, Response)> {
        let timeout = self.response_timeout;
        let link = self.link()?;
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, link.recv())
                .await
                .map_err(|_| SessionError::Transport(ProtocolError::Timeout))?
                .map_err(SessionError::from),
            None => link.recv().await.map_err(SessionError::from),
        }
    }

    async fn read_until_done(&mut self, id: MessageId) -> Result<Collected> {
        let mut messages = Vec::new();
        loop {
            let (received_id, response) = self.recv_one().await?;
            if received_id == UNSOLICITED_MESSAGE_ID {
                if let Some(e) = unsolicited_failure(&response) {
                    return Err(SessionError::Transport(e));
                }
                debug!("Ignoring unsolicited {}", response.kind().name());
                continue;
            }
            if received_id != id {
                trace!("Discarding response for message {} while waiting for {}", received_id, id);
                continue;
            }
            self.usage.received(&response);
            let done = response.is_done();
            messages.push(response);
            if done {
                return Ok(Collected::from_messages(messages));
            }
        }
    }

    async fn exchange(&mut self, id: MessageId, request: &Request, controls: &[Control]) -> Result<Collected> {
        let operation = request.operation();
        self.link()?.send(id, request, controls).await?;
        self.usage.transmitted(operation);
        if !operation.expects_response() {
            return Ok(Collected::default());
        }
        self.outstanding.insert(id, operation);
        let collected = self.read_until_done(id).await;
        self.outstanding.remove(&id);
        collected
    }
}

#[async_trait]
impl Strategy for SyncStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sync
    }

    fn is_synchronous(&self) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    async fn open(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let link = connect_link(self.connector.as_ref(), endpoint, &mut self.usage).await?;
        self.link = Some(link);
        self.endpoint = Some(endpoint.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.outstanding.clear();
        if let Some(mut link) = self.link.take() {
            self.usage.closed_sockets += 1;
            debug!("Closing link to {}", link.peer());
            link.close().await?;
        }
        Ok(())
    }

    async fn send(&mut self, request: Request, controls: &[Control]) -> Result<Dispatched> {
        let id = self.ids.next();
        match self.exchange(id, &request, controls).await {
            Ok(collected) => Ok(Dispatched::Complete(collected)),
            Err(e) => {
                if e.is_transport_failure() {
                    self.drop_link(&e);
                }
                Err(e)
            }
        }
    }

    async fn collect(&mut self, id: MessageId) -> Result<Collected> {
        Err(SessionError::Unsupported(format!(
            "message {} is not pending: synchronous sends complete immediately",
            id
        )))
    }

    async fn start_tls(&mut self) -> Result<bool> {
        if self.endpoint.as_ref().is_some_and(|e| e.use_ssl) {
            debug!("Endpoint already uses TLS, StartTLS skipped");
            return Ok(false);
        }
        let collected = match self.send(builder::start_tls(), &[]).await? {
            Dispatched::Complete(collected) => collected,
            Dispatched::Pending(id) => self.collect(id).await?,
        };
        if !collected.is_success() {
            warn!(
                "StartTLS refused: {}",
                collected
                    .result
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            );
            return Ok(false);
        }
        if let Err(e) = self.link()?.start_tls().await {
            let e = SessionError::from(e);
            if e.is_transport_failure() {
                self.drop_link(&e);
            }
            return Err(e);
        }
        info!("TLS started");
        Ok(true)
    }

    fn outstanding(&self, id: MessageId) -> Option<Operation> {
        self.outstanding.get(&id).copied()
    }

    fn usage(&self) -> Usage {
        self.usage.clone()
    }
}
