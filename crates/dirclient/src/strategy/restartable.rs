//! Synchronous strategy with one reconnect-and-retry per call
//!
//! When a send fails below the protocol (reset, EOF, timeout), the link is
//! reopened, StartTLS is redone if it was active, the last successful
//! single-round bind is replayed, and the request is sent once more. A
//! second failure is reported; there is no further retry.

use super::{is_single_round_bind, Collected, Dispatched, Strategy, SyncStrategy};
use crate::config::StrategyKind;
use crate::error::{Result, SessionError};
use crate::usage::Usage;
use async_trait::async_trait;
use dirproto::{Control, Endpoint, MessageId, Operation, ProtocolError, Request};
use tracing::{debug, info, warn};

pub struct RestartableStrategy {
    inner: SyncStrategy,
    endpoint: Option<Endpoint>,
    tls_active: bool,
    last_bind: Option<(Request, Vec<Control>)>,
    failures: u64,
    successes: u64,
}

/// A transport failure as the error kind callers see after the retry
fn into_transport(err: SessionError) -> SessionError {
    match err {
        SessionError::Timeout(_) => SessionError::Transport(ProtocolError::Timeout),
        other => other,
    }
}

impl RestartableStrategy {
    pub fn new(inner: SyncStrategy) -> Self {
        Self {
            inner,
            endpoint: None,
            tls_active: false,
            last_bind: None,
            failures: 0,
            successes: 0,
        }
    }

    fn record_bind(&mut self, request: &Request, controls: &[Control], dispatched: &Dispatched) {
        if request.operation() != Operation::Bind {
            return;
        }
        let succeeded = matches!(dispatched, Dispatched::Complete(c) if c.is_success());
        if succeeded && is_single_round_bind(request) {
            self.last_bind = Some((request.clone(), controls.to_vec()));
        } else {
            self.last_bind = None;
        }
    }

    async fn restart(&mut self) -> Result<()> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or(SessionError::Transport(ProtocolError::NotOpen))?;

        if let Err(e) = self.inner.close().await {
            debug!("Ignoring error while closing failed link: {}", e);
        }
        self.inner.open(&endpoint).await?;
        if self.tls_active {
            self.inner.start_tls().await?;
        }
        if let Some((bind, controls)) = self.last_bind.clone() {
            let collected = match self.inner.send(bind, &controls).await? {
                Dispatched::Complete(collected) => collected,
                Dispatched::Pending(id) => self.inner.collect(id).await?,
            };
            if !collected.is_success() {
                return Err(SessionError::BindFailure(format!(
                    "rebind after restart failed: {}",
                    collected
                        .result
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "no result".into())
                )));
            }
        }
        info!("Connection to {} restarted", endpoint);
        Ok(())
    }
}

#[async_trait]
impl Strategy for RestartableStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Restartable
    }

    fn is_synchronous(&self) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn open(&mut self, endpoint: &Endpoint) -> Result<()> {
        self.inner.open(endpoint).await?;
        self.endpoint = Some(endpoint.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.tls_active = false;
        self.last_bind = None;
        self.inner.close().await
    }

    async fn send(&mut self, request: Request, controls: &[Control]) -> Result<Dispatched> {
        let first = self.inner.send(request.clone(), controls).await;
        let err = match first {
            Ok(dispatched) => {
                self.record_bind(&request, controls, &dispatched);
                return Ok(dispatched);
            }
            Err(e) if e.is_transport_failure() && request.operation() != Operation::Unbind => e,
            Err(e) => return Err(e),
        };

        self.failures += 1;
        warn!(
            "{} failed at transport level ({}), restarting connection",
            request.operation(),
            err
        );
        self.restart().await.map_err(into_transport)?;

        match self.inner.send(request.clone(), controls).await {
            Ok(dispatched) => {
                self.successes += 1;
                self.record_bind(&request, controls, &dispatched);
                Ok(dispatched)
            }
            Err(e) => {
                warn!("{} failed again after restart: {}", request.operation(), e);
                Err(into_transport(e))
            }
        }
    }

    async fn collect(&mut self, id: MessageId) -> Result<Collected> {
        self.inner.collect(id).await
    }

    async fn start_tls(&mut self) -> Result<bool> {
        let started = self.inner.start_tls().await?;
        if started {
            self.tls_active = true;
        }
        Ok(started)
    }

    fn outstanding(&self, id: MessageId) -> Option<Operation> {
        self.inner.outstanding(id)
    }

    fn usage(&self) -> Usage {
        let mut usage = self.inner.usage();
        usage.restartable_failures += self.failures;
        usage.restartable_successes += self.successes;
        usage
    }
}
