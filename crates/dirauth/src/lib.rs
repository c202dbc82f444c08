//! Bind handshakes for directory sessions
//!
//! Every handshake here is sans-io: it produces bind requests and consumes
//! the server's bind results, and the session that owns the transport
//! shuttles messages between the two. A handshake lives for exactly one
//! bind call.
//!
//! - [`SimpleBind`]: anonymous or name/password, one round
//! - [`SicilyHandshake`]: three-round challenge-response (package
//!   discovery, negotiate, response) driven by an injected
//!   [`ChallengeResponseClient`]
//! - [`SaslNegotiation`]: generic SASL over an allow-listed
//!   [`SaslMechanism`] (EXTERNAL and DIGEST-MD5)

pub mod error;
pub mod sasl;
pub mod sicily;
pub mod simple;

pub use error::{AuthError, Result};
pub use sasl::{SaslCredentials, SaslMechanism, SaslNegotiation, SUPPORTED_MECHANISMS};
pub use sicily::{
    split_domain_user, ChallengeResponseClient, ChallengeResponseFactory, SicilyHandshake,
};
pub use simple::{Credentials, SimpleBind};

use dirproto::{LdapResult, Request};

/// What a handshake wants after seeing a bind result
#[derive(Debug)]
pub enum HandshakeStep {
    /// Send another bind request and feed its result back
    Send(Request),
    /// Negotiation is over; this result is the bind outcome
    Done(LdapResult),
}

/// A multi-round bind exchange
pub trait BindHandshake: Send {
    /// Mechanism name for logs
    fn name(&self) -> &str;

    /// First bind request of the exchange
    fn start(&mut self) -> Result<Request>;

    /// Consume the result of the last request sent
    ///
    /// A non-success result always ends negotiation with that result as
    /// the outcome; errors are reserved for local failures such as an
    /// unsupported server offer or a malformed challenge.
    fn next(&mut self, result: LdapResult) -> Result<HandshakeStep>;
}
