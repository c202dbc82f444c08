use dirproto::MessageId;
use std::fmt;

/// Result of an operation call
///
/// Synchronous strategies always answer `Done`. Asynchronous and pooled
/// strategies answer `Pending` with the id to hand to
/// [`Session::get_response`](crate::Session::get_response) later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done(bool),
    Pending(MessageId),
}

impl Outcome {
    /// `true` only for a completed, successful operation
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Done(true))
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Outcome::Pending(_))
    }

    pub fn message_id(self) -> Option<MessageId> {
        match self {
            Outcome::Pending(id) => Some(id),
            Outcome::Done(_) => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Done(ok) => write!(f, "done ({})", ok),
            Outcome::Pending(id) => write!(f, "pending (message {})", id),
        }
    }
}
