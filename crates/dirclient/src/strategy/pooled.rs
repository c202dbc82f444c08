//! Pool of worker strategies
//!
//! Each worker is a synchronous or asynchronous strategy with its own
//! connection. Operations go to workers round robin and are answered with
//! a pool ticket; binds and unbinds go to every worker. Workers older than
//! the configured lifetime are retired and replaced between operations,
//! once no request is in flight on them. Tickets nobody collects are
//! dropped after the uncollected-response age.

use super::{is_single_round_bind, Collected, CollectHandle, Dispatched, MessageIds, Strategy};
use crate::config::{PooledBindPolicy, SessionConfig, StrategyKind};
use crate::error::{Result, SessionError};
use crate::usage::Usage;
use async_trait::async_trait;
use dirproto::{Control, Endpoint, MessageId, Operation, ProtocolError, Request};
use futures::future::{self, join_all, FutureExt};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Builds one fresh, unopened worker
pub type WorkerFactory = Box<dyn Fn() -> Box<dyn Strategy> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub size: usize,
    pub lifetime: Option<Duration>,
    pub bind_policy: PooledBindPolicy,
    pub uncollected_age: Option<Duration>,
}

impl PoolSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            size: config.pool_size.max(1),
            lifetime: config.pool_lifetime,
            bind_policy: config.pool_bind_policy,
            uncollected_age: config.uncollected_age,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

struct Worker {
    id: usize,
    strategy: Box<dyn Strategy>,
    created: Instant,
    /// Bind sent optimistically whose outcome has not been read yet
    pending_bind: Option<MessageId>,
}

enum TicketState {
    Ready(Collected),
    Waiting(MessageId),
}

struct Ticket {
    worker: usize,
    operation: Operation,
    state: TicketState,
    issued: Instant,
}

pub struct PooledStrategy {
    settings: PoolSettings,
    factory: WorkerFactory,
    workers: Vec<Worker>,
    next_worker: usize,
    next_worker_id: usize,
    endpoint: Option<Endpoint>,
    tls_active: bool,
    last_bind: Option<(Request, Vec<Control>)>,
    tickets: HashMap<MessageId, Ticket>,
    ids: MessageIds,
    retired_usage: Usage,
    recycled: u64,
}

impl PooledStrategy {
    pub fn new(settings: PoolSettings, factory: WorkerFactory) -> Self {
        Self {
            settings,
            factory,
            workers: Vec::new(),
            next_worker: 0,
            next_worker_id: 0,
            endpoint: None,
            tls_active: false,
            last_bind: None,
            tickets: HashMap::new(),
            ids: MessageIds::new(),
            retired_usage: Usage::new(),
            recycled: 0,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Open a new worker and bring it to the pool's TLS and bind state
    async fn spawn_worker(&mut self, endpoint: &Endpoint) -> Result<Worker> {
        let mut strategy = (self.factory)();
        strategy.open(endpoint).await?;
        if self.tls_active {
            strategy.start_tls().await?;
        }
        if let Some((bind, controls)) = &self.last_bind {
            let collected = match strategy.send(bind.clone(), controls).await? {
                Dispatched::Complete(collected) => collected,
                Dispatched::Pending(id) => strategy.collect(id).await?,
            };
            if !collected.is_success() {
                warn!("Worker bind failed: {:?}", collected.result);
            }
        }
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        debug!("Pool worker {} connected to {}", id, endpoint);
        Ok(Worker {
            id,
            strategy,
            created: Instant::now(),
            pending_bind: None,
        })
    }

    /// Whether a request sent through `worker` still waits for its answer
    fn in_flight(&self, worker: &Worker) -> bool {
        worker.pending_bind.is_some()
            || self.tickets.values().any(|ticket| match ticket.state {
                TicketState::Waiting(id) => {
                    ticket.worker == worker.id && worker.strategy.outstanding(id).is_some()
                }
                TicketState::Ready(_) => false,
            })
    }

    /// Drop tickets that can no longer be collected or sat uncollected too long
    fn prune_tickets(&mut self) {
        let age = self.settings.uncollected_age;
        let workers = &self.workers;
        let before = self.tickets.len();
        self.tickets.retain(|_, ticket| match ticket.state {
            TicketState::Ready(_) => age.map_or(true, |age| ticket.issued.elapsed() < age),
            TicketState::Waiting(id) => workers
                .iter()
                .find(|w| w.id == ticket.worker)
                .is_some_and(|w| w.strategy.outstanding(id).is_some()),
        });
        if self.tickets.len() < before {
            debug!("Dropped {} uncollected ticket(s)", before - self.tickets.len());
        }
    }

    /// Replace expired workers that have nothing in flight
    async fn recycle_expired(&mut self) -> Result<()> {
        let Some(lifetime) = self.settings.lifetime else {
            return Ok(());
        };
        let Some(endpoint) = self.endpoint.clone() else {
            return Ok(());
        };

        for index in 0..self.workers.len() {
            let worker = &self.workers[index];
            if worker.created.elapsed() < lifetime || self.in_flight(worker) {
                continue;
            }

            let replacement = self.spawn_worker(&endpoint).await?;
            let mut retired = std::mem::replace(&mut self.workers[index], replacement);
            if let Err(e) = retired.strategy.close().await {
                debug!("Error closing retired worker {}: {}", retired.id, e);
            }
            self.retired_usage += &retired.strategy.usage();
            self.recycled += 1;
            info!("Pool worker {} retired after {:?}", retired.id, lifetime);
        }
        Ok(())
    }

    /// Read the outcome of an optimistic bind before reusing a worker
    async fn settle_bind(worker: &mut Worker) -> Result<()> {
        if let Some(id) = worker.pending_bind.take() {
            let collected = worker.strategy.collect(id).await?;
            if !collected.is_success() {
                warn!("Pool worker {} bind failed: {:?}", worker.id, collected.result);
            }
        }
        Ok(())
    }

    async fn pick_worker(&mut self) -> Result<usize> {
        if self.workers.is_empty() {
            return Err(SessionError::Transport(ProtocolError::NotOpen));
        }
        self.prune_tickets();
        self.recycle_expired().await?;
        let index = self.next_worker % self.workers.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        Self::settle_bind(&mut self.workers[index]).await?;
        Ok(index)
    }

    async fn bind_all(&mut self, request: Request, controls: &[Control]) -> Result<Dispatched> {
        if !is_single_round_bind(&request) {
            return Err(SessionError::Unsupported(
                "multi-round binds cannot be spread over a connection pool".into(),
            ));
        }
        if self.workers.is_empty() {
            return Err(SessionError::Transport(ProtocolError::NotOpen));
        }

        let mut sent = Vec::with_capacity(self.workers.len());
        for worker in &mut self.workers {
            Self::settle_bind(worker).await?;
            sent.push(worker.strategy.send(request.clone(), controls).await?);
        }
        self.last_bind = Some((request, controls.to_vec()));

        match self.settings.bind_policy {
            PooledBindPolicy::Optimistic => {
                for (worker, dispatched) in self.workers.iter_mut().zip(sent) {
                    if let Dispatched::Pending(id) = dispatched {
                        worker.pending_bind = Some(id);
                    }
                }
                Ok(Dispatched::Complete(Collected::default()))
            }
            PooledBindPolicy::Confirm => {
                let mut outcome: Option<Collected> = None;
                for (worker, dispatched) in self.workers.iter_mut().zip(sent) {
                    let collected = match dispatched {
                        Dispatched::Complete(collected) => collected,
                        Dispatched::Pending(id) => worker.strategy.collect(id).await?,
                    };
                    let failed = !collected.is_success();
                    if outcome.is_none() || failed {
                        outcome = Some(collected);
                    }
                    if failed {
                        break;
                    }
                }
                Ok(Dispatched::Complete(outcome.unwrap_or_default()))
            }
        }
    }
}

#[async_trait]
impl Strategy for PooledStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Reusable
    }

    fn is_synchronous(&self) -> bool {
        false
    }

    fn is_pooled(&self) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        !self.workers.is_empty()
    }

    async fn open(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.endpoint = Some(endpoint.clone());
        for _ in 0..self.settings.size {
            match self.spawn_worker(endpoint).await {
                Ok(worker) => self.workers.push(worker),
                Err(e) => {
                    warn!("Pool open failed: {}", e);
                    self.close().await?;
                    return Err(e);
                }
            }
        }
        info!("Pool of {} workers open to {}", self.workers.len(), endpoint);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let results = join_all(self.workers.iter_mut().map(|w| w.strategy.close())).await;
        for worker in self.workers.drain(..) {
            self.retired_usage += &worker.strategy.usage();
        }
        self.tickets.clear();
        self.tls_active = false;
        self.last_bind = None;
        results.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    async fn send(&mut self, request: Request, controls: &[Control]) -> Result<Dispatched> {
        match request {
            Request::Bind(_) => self.bind_all(request, controls).await,
            Request::Unbind => {
                for worker in &mut self.workers {
                    worker.strategy.send(Request::Unbind, controls).await?;
                }
                Ok(Dispatched::Complete(Collected::default()))
            }
            Request::Abandon { message_id } => {
                if let Some(ticket) = self.tickets.remove(&message_id) {
                    if let TicketState::Waiting(worker_message) = ticket.state {
                        if let Some(worker) = self.workers.iter_mut().find(|w| w.id == ticket.worker) {
                            worker
                                .strategy
                                .send(Request::Abandon { message_id: worker_message }, controls)
                                .await?;
                        }
                    }
                }
                Ok(Dispatched::Complete(Collected::default()))
            }
            request => {
                let operation = request.operation();
                let index = self.pick_worker().await?;
                let worker = &mut self.workers[index];
                let state = match worker.strategy.send(request, controls).await? {
                    Dispatched::Complete(collected) => TicketState::Ready(collected),
                    Dispatched::Pending(id) => TicketState::Waiting(id),
                };
                let ticket = self.ids.next();
                self.tickets.insert(
                    ticket,
                    Ticket {
                        worker: worker.id,
                        operation,
                        state,
                        issued: Instant::now(),
                    },
                );
                Ok(Dispatched::Pending(ticket))
            }
        }
    }

    async fn collect(&mut self, id: MessageId) -> Result<Collected> {
        let ticket = self.tickets.remove(&id).ok_or_else(|| {
            SessionError::Unsupported(format!("no outstanding request with message id {}", id))
        })?;
        match ticket.state {
            TicketState::Ready(collected) => Ok(collected),
            TicketState::Waiting(worker_message) => {
                let worker = self
                    .workers
                    .iter_mut()
                    .find(|w| w.id == ticket.worker)
                    .ok_or(SessionError::Transport(ProtocolError::ConnectionClosed))?;
                worker.strategy.collect(worker_message).await
            }
        }
    }

    /// Ready tickets are handed over at once; waiting ones stay registered
    /// so they can still be abandoned while the caller waits
    fn collect_handle(&mut self, id: MessageId) -> Option<CollectHandle> {
        let ticket = self.tickets.get(&id)?;
        if let TicketState::Waiting(message) = ticket.state {
            let worker_id = ticket.worker;
            return self
                .workers
                .iter_mut()
                .find(|w| w.id == worker_id)?
                .strategy
                .collect_handle(message);
        }
        match self.tickets.remove(&id)?.state {
            TicketState::Ready(collected) => Some(future::ready(Ok(collected)).boxed()),
            TicketState::Waiting(_) => None,
        }
    }

    fn release(&mut self, id: MessageId) {
        let Some(ticket) = self.tickets.remove(&id) else {
            return;
        };
        if let TicketState::Waiting(message) = ticket.state {
            if let Some(worker) = self.workers.iter_mut().find(|w| w.id == ticket.worker) {
                worker.strategy.release(message);
            }
        }
    }

    async fn start_tls(&mut self) -> Result<bool> {
        let mut started = !self.workers.is_empty();
        for worker in &mut self.workers {
            Self::settle_bind(worker).await?;
            started &= worker.strategy.start_tls().await?;
        }
        self.tls_active = started;
        Ok(started)
    }

    fn outstanding(&self, id: MessageId) -> Option<Operation> {
        self.tickets.get(&id).map(|ticket| ticket.operation)
    }

    fn usage(&self) -> Usage {
        let mut usage = self.retired_usage.clone();
        for worker in &self.workers {
            usage += &worker.strategy.usage();
        }
        usage.workers_recycled += self.recycled;
        usage
    }
}
