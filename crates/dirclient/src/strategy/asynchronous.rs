//! Asynchronous strategy
//!
//! A background I/O task owns the link. Outgoing requests reach it over a
//! command channel; every response it reads is posted into a table keyed
//! by message id, and waiters are woken to check their own slot.
//!
//! A finished response nobody collects is dropped once it is older than
//! the strategy's uncollected-response age; callers that do not want an
//! outcome should abandon the request instead.

use super::{
    connect_link, unsolicited_failure, Collected, CollectHandle, Dispatched, MessageIds, Strategy,
};
use crate::config::StrategyKind;
use crate::error::{Result, SessionError};
use crate::usage::Usage;
use crate::wait_helper::wait_for_condition;
use async_trait::async_trait;
use dirproto::builder;
use dirproto::{
    Connector, Control, Endpoint, Link, MessageId, Operation, ProtocolError, Request, Response,
    UNSOLICITED_MESSAGE_ID,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use futures::FutureExt;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

enum Command {
    Send {
        id: MessageId,
        request: Request,
        controls: Vec<Control>,
        ack: oneshot::Sender<dirproto::Result<()>>,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

#[derive(Default)]
struct Slot {
    responses: Vec<Response>,
    /// When the final response arrived
    completed: Option<Instant>,
}

impl Slot {
    fn is_stale(&self, age: Option<Duration>) -> bool {
        match (self.completed, age) {
            (Some(completed), Some(age)) => completed.elapsed() >= age,
            _ => false,
        }
    }
}

#[derive(Default)]
struct Table {
    slots: HashMap<MessageId, Slot>,
    /// Set once the I/O task stopped; no slot will fill after that
    failure: Option<String>,
}

/// State shared between the strategy and its I/O task
struct Shared {
    table: Mutex<Table>,
    notify: Notify,
    usage: Arc<Mutex<Usage>>,
}

impl Shared {
    fn new(usage: Arc<Mutex<Usage>>) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            notify: Notify::new(),
            usage,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(&self, id: MessageId, response: Response) {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .received(&response);
        {
            let mut table = self.table();
            match table.slots.get_mut(&id) {
                Some(slot) => {
                    if response.is_done() {
                        slot.completed = Some(Instant::now());
                    }
                    slot.responses.push(response);
                }
                None => trace!("No waiter for message {}, response dropped", id),
            }
        }
        self.notify.notify_waiters();
    }

    fn fail(&self, reason: String) {
        self.table().failure.get_or_insert(reason);
        self.notify.notify_waiters();
    }

    /// Drop a slot; a task waiting on it gives up
    fn forget(&self, id: MessageId) {
        self.table().slots.remove(&id);
        self.notify.notify_waiters();
    }

    /// Wait until the slot of `id` is complete and take it
    async fn wait(self: Arc<Self>, id: MessageId, timeout: Option<Duration>) -> Result<Collected> {
        let outcome = wait_for_condition(
            || {
                let mut table = self.table();
                match table.slots.get(&id) {
                    None => Some(Err(SessionError::Unsupported(format!(
                        "message {} was abandoned",
                        id
                    )))),
                    Some(slot) if slot.completed.is_some() => {
                        let slot = table.slots.remove(&id).unwrap_or_default();
                        Some(Ok(Collected::from_messages(slot.responses)))
                    }
                    Some(_) => table.failure.clone().map(|reason| {
                        Err(SessionError::Transport(ProtocolError::Connection(reason)))
                    }),
                }
            },
            &self.notify,
            timeout,
            SessionError::Timeout(id),
        )
        .await?;
        if outcome.is_err() {
            self.table().slots.remove(&id);
        }
        outcome
    }
}

async fn io_task(
    mut link: Box<dyn Link>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) {
    debug!("I/O task started for {}", link.peer());
    // While a StartTLS response is outstanding no other request may go out
    let mut upgrade_after: Option<MessageId> = None;

    loop {
        tokio::select! {
            command = commands.recv(), if upgrade_after.is_none() => {
                match command {
                    Some(Command::Send { id, request, controls, ack }) => {
                        let result = link.send(id, &request, &controls).await;
                        let failure = result.as_ref().err().map(ToString::to_string);
                        if result.is_ok() && request.is_start_tls() {
                            upgrade_after = Some(id);
                        }
                        let _ = ack.send(result);
                        if let Some(reason) = failure {
                            warn!("Send failed, stopping I/O task: {}", reason);
                            shared.fail(reason);
                            break;
                        }
                    }
                    Some(Command::Close { ack }) => {
                        if let Err(e) = link.close().await {
                            debug!("Error closing link: {}", e);
                        }
                        shared.fail("connection closed".into());
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        let _ = link.close().await;
                        shared.fail("strategy dropped".into());
                        return;
                    }
                }
            }

            received = link.recv() => {
                match received {
                    Ok((UNSOLICITED_MESSAGE_ID, response)) => {
                        if let Some(e) = unsolicited_failure(&response) {
                            shared.fail(e.to_string());
                            let _ = link.close().await;
                            break;
                        }
                        debug!("Ignoring unsolicited {}", response.kind().name());
                    }
                    Ok((id, response)) => {
                        let upgrade = upgrade_after == Some(id);
                        let accepted = matches!(&response, Response::Done(result) if result.is_success());
                        let done = response.is_done();
                        shared.post(id, response);
                        if upgrade && done {
                            upgrade_after = None;
                            if !accepted {
                                warn!("StartTLS refused by server");
                                continue;
                            }
                            if let Err(e) = link.start_tls().await {
                                warn!("TLS upgrade failed: {}", e);
                                shared.fail(e.to_string());
                                break;
                            }
                            info!("TLS started");
                        }
                    }
                    Err(e) => {
                        warn!("Receive failed, stopping I/O task: {}", e);
                        shared.fail(e.to_string());
                        break;
                    }
                }
            }
        }
    }
    debug!("I/O task stopped");
}

pub struct AsyncStrategy {
    connector: Arc<dyn Connector>,
    endpoint: Option<Endpoint>,
    ids: MessageIds,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    outstanding: HashMap<MessageId, Operation>,
    response_timeout: Option<Duration>,
    uncollected_age: Option<Duration>,
    usage: Arc<Mutex<Usage>>,
}

impl AsyncStrategy {
    pub fn new(connector: Arc<dyn Connector>, response_timeout: Option<Duration>) -> Self {
        let usage = Arc::new(Mutex::new(Usage::new()));
        Self {
            connector,
            endpoint: None,
            ids: MessageIds::new(),
            commands: None,
            task: None,
            shared: Arc::new(Shared::new(Arc::clone(&usage))),
            outstanding: HashMap::new(),
            response_timeout,
            uncollected_age: None,
            usage,
        }
    }

    /// Drop finished responses left uncollected for longer than `age`
    pub fn with_uncollected_age(mut self, age: Option<Duration>) -> Self {
        self.uncollected_age = age;
        self
    }

    fn wait_for(&self, id: MessageId) -> CollectHandle {
        if !self.shared.table().slots.contains_key(&id) {
            return futures::future::ready(Err(SessionError::Unsupported(format!(
                "no outstanding request with message id {}",
                id
            ))))
            .boxed();
        }
        Arc::clone(&self.shared)
            .wait(id, self.response_timeout)
            .boxed()
    }

    fn prune_uncollected(&mut self) {
        let age = self.uncollected_age;
        let mut table = self.shared.table();
        let before = table.slots.len();
        table.slots.retain(|_, slot| !slot.is_stale(age));
        if table.slots.len() < before {
            debug!(
                "Dropped {} uncollected response(s)",
                before - table.slots.len()
            );
            self.outstanding.retain(|id, _| table.slots.contains_key(id));
        }
    }

    fn with_usage<R>(&self, f: impl FnOnce(&mut Usage) -> R) -> R {
        f(&mut self.usage.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Hand a request to the I/O task and wait until it is on the wire
    async fn dispatch(&mut self, request: Request, controls: &[Control], track: bool) -> Result<MessageId> {
        let commands = self
            .commands
            .as_ref()
            .ok_or(SessionError::Transport(ProtocolError::NotOpen))?
            .clone();
        let id = self.ids.next();
        let operation = request.operation();

        self.prune_uncollected();
        if track {
            self.shared.table().slots.insert(id, Slot::default());
        }

        let (ack, acked) = oneshot::channel();
        let sent = commands
            .send(Command::Send {
                id,
                request,
                controls: controls.to_vec(),
                ack,
            })
            .map_err(|_| ProtocolError::ConnectionClosed);
        let sent = match sent {
            Ok(()) => acked.await.unwrap_or(Err(ProtocolError::ConnectionClosed)),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.shared.table().slots.remove(&id);
            return Err(SessionError::Transport(e));
        }

        self.with_usage(|usage| usage.transmitted(operation));
        Ok(id)
    }
}

#[async_trait]
impl Strategy for AsyncStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Async
    }

    fn is_synchronous(&self) -> bool {
        false
    }

    fn is_open(&self) -> bool {
        self.commands.is_some() && self.shared.table().failure.is_none()
    }

    async fn open(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let mut opened = Usage::new();
        let link = connect_link(self.connector.as_ref(), endpoint, &mut opened).await;
        self.with_usage(|usage| *usage += &opened);
        let link = link?;

        let shared = Arc::new(Shared::new(Arc::clone(&self.usage)));
        let (tx, rx) = mpsc::unbounded_channel();
        self.task = Some(tokio::spawn(io_task(link, rx, Arc::clone(&shared))));
        self.commands = Some(tx);
        self.shared = shared;
        self.outstanding.clear();
        self.endpoint = Some(endpoint.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.outstanding.clear();
        let Some(commands) = self.commands.take() else {
            return Ok(());
        };
        let (ack, closed) = oneshot::channel();
        if commands.send(Command::Close { ack }).is_ok() {
            let _ = closed.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.with_usage(|usage| usage.closed_sockets += 1);
        Ok(())
    }

    async fn send(&mut self, request: Request, controls: &[Control]) -> Result<Dispatched> {
        let operation = request.operation();
        let abandoned = match &request {
            Request::Abandon { message_id } => Some(*message_id),
            _ => None,
        };

        let id = self
            .dispatch(request, controls, operation.expects_response())
            .await?;

        if let Some(target) = abandoned {
            self.outstanding.remove(&target);
            self.shared.forget(target);
        }
        if !operation.expects_response() {
            return Ok(Dispatched::Complete(Collected::default()));
        }
        self.outstanding.insert(id, operation);
        Ok(Dispatched::Pending(id))
    }

    async fn collect(&mut self, id: MessageId) -> Result<Collected> {
        let outcome = self.wait_for(id).await;
        self.release(id);
        outcome
    }

    fn collect_handle(&mut self, id: MessageId) -> Option<CollectHandle> {
        Some(self.wait_for(id))
    }

    fn release(&mut self, id: MessageId) {
        self.outstanding.remove(&id);
    }

    /// Queues StartTLS and reports success at once
    ///
    /// The I/O task holds back further requests until the StartTLS
    /// response arrives and upgrades the link itself when it is a success.
    async fn start_tls(&mut self) -> Result<bool> {
        if self.endpoint.as_ref().is_some_and(|e| e.use_ssl) {
            return Ok(false);
        }
        self.dispatch(builder::start_tls(), &[], false).await?;
        Ok(true)
    }

    fn outstanding(&self, id: MessageId) -> Option<Operation> {
        let stale = self
            .shared
            .table()
            .slots
            .get(&id)
            .is_some_and(|slot| slot.is_stale(self.uncollected_age));
        if stale {
            return None;
        }
        self.outstanding.get(&id).copied()
    }

    fn usage(&self) -> Usage {
        self.with_usage(|usage| usage.clone())
    }
}
