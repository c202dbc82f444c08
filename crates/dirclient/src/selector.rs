//! Endpoint selection at open time

use crate::error::{Result, SessionError};
use dirproto::{Endpoint, ProtocolError};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Picks the server endpoint a session connects to
///
/// Consulted only when a session opens; the session walks
/// [`EndpointSelector::candidates`] and reports each failed attempt.
pub trait EndpointSelector: Send + Sync {
    fn initialize(&mut self) {}

    /// Endpoint the next open should try first
    fn current_endpoint(&self) -> Result<Endpoint>;

    fn mark_failed(&mut self, endpoint: &Endpoint);

    /// Endpoints in the order an open should try them
    fn candidates(&self) -> Vec<Endpoint>;
}

/// Always the same endpoint
#[derive(Debug, Clone)]
pub struct SingleEndpoint {
    endpoint: Endpoint,
}

impl SingleEndpoint {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

impl EndpointSelector for SingleEndpoint {
    fn current_endpoint(&self) -> Result<Endpoint> {
        Ok(self.endpoint.clone())
    }

    fn mark_failed(&mut self, endpoint: &Endpoint) {
        debug!("Endpoint {} failed", endpoint);
    }

    fn candidates(&self) -> Vec<Endpoint> {
        vec![self.endpoint.clone()]
    }
}

/// Round robin over several endpoints
///
/// With `exhaust` set, an endpoint that failed once is skipped from then on.
#[derive(Debug, Clone)]
pub struct EndpointPool {
    endpoints: Vec<Endpoint>,
    next: usize,
    exhaust: bool,
    failed: HashSet<String>,
}

impl EndpointPool {
    pub fn new(endpoints: Vec<Endpoint>, exhaust: bool) -> Self {
        Self {
            endpoints,
            next: 0,
            exhaust,
            failed: HashSet::new(),
        }
    }

    fn available(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints
            .iter()
            .filter(|e| !self.exhaust || !self.failed.contains(&e.url()))
    }
}

impl EndpointSelector for EndpointPool {
    fn initialize(&mut self) {
        self.next = 0;
        self.failed.clear();
    }

    fn current_endpoint(&self) -> Result<Endpoint> {
        self.candidates().into_iter().next().ok_or_else(|| {
            SessionError::Transport(ProtocolError::connection_error(
                "no active server available in endpoint pool",
            ))
        })
    }

    fn mark_failed(&mut self, endpoint: &Endpoint) {
        if self.exhaust {
            warn!("Endpoint {} exhausted", endpoint);
            self.failed.insert(endpoint.url());
        }
        if !self.endpoints.is_empty() {
            self.next = (self.next + 1) % self.endpoints.len();
        }
    }

    fn candidates(&self) -> Vec<Endpoint> {
        let available: Vec<Endpoint> = self.available().cloned().collect();
        if available.is_empty() {
            return available;
        }
        let start = self.next % available.len();
        available[start..]
            .iter()
            .chain(&available[..start])
            .cloned()
            .collect()
    }
}

/// Selector for a list of endpoints: one endpoint is [`SingleEndpoint`]
pub fn for_endpoints(mut endpoints: Vec<Endpoint>) -> Box<dyn EndpointSelector> {
    if endpoints.len() == 1 {
        Box::new(SingleEndpoint::new(endpoints.remove(0)))
    } else {
        Box::new(EndpointPool::new(endpoints, true))
    }
}
