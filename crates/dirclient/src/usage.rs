//! Usage counters

use dirproto::{Operation, Response};
use serde::Serialize;
use std::fmt;
use std::ops::{Add, AddAssign};

/// Counters collected by a strategy while it runs
///
/// Pooled strategies report the sum of their live workers plus a running
/// total for workers already retired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub open_sockets: u64,
    pub closed_sockets: u64,
    pub failed_sockets: u64,
    pub messages_transmitted: u64,
    pub messages_received: u64,
    pub operations: u64,
    pub abandon_operations: u64,
    pub add_operations: u64,
    pub bind_operations: u64,
    pub compare_operations: u64,
    pub delete_operations: u64,
    pub extended_operations: u64,
    pub modify_operations: u64,
    pub modify_dn_operations: u64,
    pub search_operations: u64,
    pub unbind_operations: u64,
    pub entries_received: u64,
    pub referrals_received: u64,
    pub restartable_failures: u64,
    pub restartable_successes: u64,
    pub workers_recycled: u64,
}

impl Usage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Count one outgoing request
    pub fn transmitted(&mut self, operation: Operation) {
        self.messages_transmitted += 1;
        self.operations += 1;
        let counter = match operation {
            Operation::Abandon => &mut self.abandon_operations,
            Operation::Add => &mut self.add_operations,
            Operation::Bind => &mut self.bind_operations,
            Operation::Compare => &mut self.compare_operations,
            Operation::Delete => &mut self.delete_operations,
            Operation::Extended => &mut self.extended_operations,
            Operation::Modify => &mut self.modify_operations,
            Operation::ModifyDn => &mut self.modify_dn_operations,
            Operation::Search => &mut self.search_operations,
            Operation::Unbind => &mut self.unbind_operations,
        };
        *counter += 1;
    }

    /// Count one incoming response message
    pub fn received(&mut self, response: &Response) {
        self.messages_received += 1;
        match response {
            Response::Entry(_) => self.entries_received += 1,
            Response::Reference(_) => self.referrals_received += 1,
            Response::Done(result) if !result.referrals.is_empty() => {
                self.referrals_received += 1
            }
            _ => {}
        }
    }
}

impl AddAssign<&Usage> for Usage {
    fn add_assign(&mut self, other: &Usage) {
        self.open_sockets += other.open_sockets;
        self.closed_sockets += other.closed_sockets;
        self.failed_sockets += other.failed_sockets;
        self.messages_transmitted += other.messages_transmitted;
        self.messages_received += other.messages_received;
        self.operations += other.operations;
        self.abandon_operations += other.abandon_operations;
        self.add_operations += other.add_operations;
        self.bind_operations += other.bind_operations;
        self.compare_operations += other.compare_operations;
        self.delete_operations += other.delete_operations;
        self.extended_operations += other.extended_operations;
        self.modify_operations += other.modify_operations;
        self.modify_dn_operations += other.modify_dn_operations;
        self.search_operations += other.search_operations;
        self.unbind_operations += other.unbind_operations;
        self.entries_received += other.entries_received;
        self.referrals_received += other.referrals_received;
        self.restartable_failures += other.restartable_failures;
        self.restartable_successes += other.restartable_successes;
        self.workers_recycled += other.workers_recycled;
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Usage) {
        *self += &other;
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(mut self, other: Usage) -> Usage {
        self += &other;
        self
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "sockets: open {}, closed {}, failed {}",
            self.open_sockets, self.closed_sockets, self.failed_sockets
        )?;
        writeln!(
            f,
            "messages: sent {}, received {}",
            self.messages_transmitted, self.messages_received
        )?;
        writeln!(
            f,
            "operations: {} (bind {}, search {}, add {}, modify {}, delete {}, modify dn {}, compare {}, extended {}, abandon {}, unbind {})",
            self.operations,
            self.bind_operations,
            self.search_operations,
            self.add_operations,
            self.modify_operations,
            self.delete_operations,
            self.modify_dn_operations,
            self.compare_operations,
            self.extended_operations,
            self.abandon_operations,
            self.unbind_operations
        )?;
        writeln!(
            f,
            "received: {} entries, {} referrals",
            self.entries_received, self.referrals_received
        )?;
        write!(
            f,
            "restarts: {} failures, {} successes; workers recycled: {}",
            self.restartable_failures, self.restartable_successes, self.workers_recycled
        )
    }
}
