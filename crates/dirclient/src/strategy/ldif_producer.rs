//! Offline strategy that renders write operations as LDIF change records

use super::{Collected, Dispatched, Strategy};
use crate::config::StrategyKind;
use crate::error::{Result, SessionError};
use crate::usage::Usage;
use async_trait::async_trait;
use dirproto::ldif::ChangeStream;
use dirproto::{Control, Endpoint, LdapResult, MessageId, Operation, Request, ResponseKind};
use tracing::debug;

#[derive(Default)]
pub struct LdifProducer {
    stream: ChangeStream,
    open: bool,
    usage: Usage,
}

impl LdifProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(&self) -> &ChangeStream {
        &self.stream
    }
}

#[async_trait]
impl Strategy for LdifProducer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Ldif
    }

    fn is_synchronous(&self) -> bool {
        true
    }

    fn no_real_endpoint(&self) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self, _endpoint: &Endpoint) -> Result<()> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn send(&mut self, request: Request, controls: &[Control]) -> Result<Dispatched> {
        let operation = request.operation();
        let result = match operation {
            Operation::Add | Operation::Delete | Operation::Modify | Operation::ModifyDn => {
                self.stream.push(&request, controls)?;
                debug!("{} rendered as change record {}", operation, self.stream.len());
                ResponseKind::for_operation(operation).map(LdapResult::success)
            }
            Operation::Bind => Some(LdapResult::success(ResponseKind::BindResponse)),
            Operation::Unbind | Operation::Abandon => None,
            Operation::Search | Operation::Compare | Operation::Extended => {
                return Err(SessionError::Unsupported(format!(
                    "{} has no meaning for the LDIF producer",
                    operation
                )))
            }
        };
        self.usage.transmitted(operation);
        Ok(Dispatched::Complete(Collected::new(Vec::new(), result)))
    }

    async fn collect(&mut self, id: MessageId) -> Result<Collected> {
        Err(SessionError::Unsupported(format!(
            "message {} is not pending: the LDIF producer completes immediately",
            id
        )))
    }

    async fn start_tls(&mut self) -> Result<bool> {
        Err(SessionError::Unsupported(
            "StartTLS has no meaning for the LDIF producer".into(),
        ))
    }

    fn outstanding(&self, _id: MessageId) -> Option<Operation> {
        None
    }

    fn usage(&self) -> Usage {
        self.usage.clone()
    }

    fn change_stream(&self) -> Option<String> {
        Some(self.stream.render())
    }
}
