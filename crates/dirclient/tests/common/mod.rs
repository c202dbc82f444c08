//! Shared fixtures for the session integration tests
//!
//! `DirectoryConnector` hands out in-memory links served by a
//! [`MockDirectory`], so the wire strategies (SYNC, ASYNC, RESTARTABLE,
//! REUSABLE) run their real code paths without a socket.

#![allow(dead_code)]

use async_trait::async_trait;
use dirclient::strategy::mock::ConnectionState;
use dirclient::{MockDirectory, SessionConfig, StrategyKind};
use dirproto::{
    Connector, Control, Endpoint, Link, MessageId, Operation, ProtocolError, Request, Response,
};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const BASE: &str = "dc=example,dc=com";
pub const ADMIN: &str = "cn=admin,dc=example,dc=com";
pub const ADMIN_PASSWORD: &str = "secret";

/// A small tree: the suffix, two organisational units and three people
pub fn populated_directory() -> Arc<MockDirectory> {
    let directory = Arc::new(MockDirectory::new());
    directory.add_entry(BASE, [("objectClass", vec!["top", "domain"]), ("dc", vec!["example"])]);
    directory.add_entry(
        ADMIN,
        [
            ("objectClass", vec!["person"]),
            ("cn", vec!["admin"]),
            ("sn", vec!["admin"]),
            ("userPassword", vec![ADMIN_PASSWORD]),
        ],
    );
    directory.add_entry(
        "ou=people,dc=example,dc=com",
        [("objectClass", vec!["organizationalUnit"]), ("ou", vec!["people"])],
    );
    directory.add_entry(
        "ou=groups,dc=example,dc=com",
        [("objectClass", vec!["organizationalUnit"]), ("ou", vec!["groups"])],
    );
    for (cn, uid) in [("alice", "1001"), ("bob", "1002"), ("carol", "1003")] {
        directory.add_entry(
            &format!("cn={},ou=people,dc=example,dc=com", cn),
            [
                ("objectClass", vec!["person", "posixAccount"]),
                ("cn", vec![cn]),
                ("sn", vec![cn]),
                ("uidNumber", vec![uid]),
            ],
        );
    }
    directory
}

/// Configuration bound as the administrator on `strategy`
pub fn admin_config(strategy: StrategyKind) -> SessionConfig {
    SessionConfig::default()
        .with_strategy(strategy)
        .with_urls(["ldap://directory.test:389"])
        .with_credentials(ADMIN, ADMIN_PASSWORD)
}

pub fn init_tracing() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

/// Counters shared by a connector and every link it opened
#[derive(Default)]
struct Script {
    connects: AtomicUsize,
    /// Upcoming sends that fail with a connection reset
    failing_sends: AtomicUsize,
    /// Requests that reached a link, in order
    requests: Mutex<Vec<Request>>,
    /// Operations the server receives but never answers
    muted: Mutex<Vec<Operation>>,
}

#[derive(Clone)]
pub struct DirectoryConnector {
    directory: Arc<MockDirectory>,
    script: Arc<Script>,
    refuse_all: bool,
    refused_hosts: Vec<String>,
}

impl DirectoryConnector {
    pub fn new(directory: Arc<MockDirectory>) -> Self {
        Self {
            directory,
            script: Arc::default(),
            refuse_all: false,
            refused_hosts: Vec::new(),
        }
    }

    /// A connector whose every connection attempt is refused
    pub fn refusing(directory: Arc<MockDirectory>) -> Self {
        Self {
            refuse_all: true,
            ..Self::new(directory)
        }
    }

    /// Refuse connections to `host` only
    pub fn refuse_host(mut self, host: &str) -> Self {
        self.refused_hosts.push(host.to_string());
        self
    }

    pub fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    /// Make the next `count` sends fail as if the peer reset the connection
    pub fn fail_sends(&self, count: usize) {
        self.script.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Leave every later request of `operation` unanswered
    pub fn mute(&self, operation: Operation) {
        self.script
            .muted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(operation);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.script
            .requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for DirectoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> dirproto::Result<Box<dyn Link>> {
        if self.refuse_all || self.refused_hosts.contains(&endpoint.host) {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused the connection", endpoint),
            )));
        }
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(DirectoryLink {
            directory: Arc::clone(&self.directory),
            script: Arc::clone(&self.script),
            connection: ConnectionState {
                bound_dn: None,
                tls: endpoint.use_ssl,
            },
            queue: VecDeque::new(),
            peer: endpoint.url(),
            broken: false,
        }))
    }
}

struct DirectoryLink {
    directory: Arc<MockDirectory>,
    script: Arc<Script>,
    connection: ConnectionState,
    queue: VecDeque<(MessageId, Response)>,
    peer: String,
    broken: bool,
}

#[async_trait]
impl Link for DirectoryLink {
    async fn send(&mut self, id: MessageId, request: &Request, _controls: &[Control]) -> dirproto::Result<()> {
        let failing = self
            .script
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing || self.broken {
            self.broken = true;
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        self.script
            .requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
        let muted = self
            .script
            .muted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&request.operation());
        if muted {
            return Ok(());
        }
        for response in self.directory.execute(request, &mut self.connection) {
            self.queue.push_back((id, response));
        }
        Ok(())
    }

    async fn recv(&mut self) -> dirproto::Result<(MessageId, Response)> {
        match self.queue.pop_front() {
            Some(message) => Ok(message),
            // nothing in flight: behave like an idle socket
            None => std::future::pending().await,
        }
    }

    async fn start_tls(&mut self) -> dirproto::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> dirproto::Result<()> {
        self.queue.clear();
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
