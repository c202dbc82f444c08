//! SASL bind negotiation
//!
//! A [`SaslNegotiation`] drives one [`SaslMechanism`] through as many
//! `saslBindInProgress` rounds as the server asks for. Only mechanisms in
//! [`SUPPORTED_MECHANISMS`] can be selected; anything else is refused
//! before a message is built.

mod digest_md5;
mod external;

pub use digest_md5::DigestMd5;
pub use external::External;

use crate::error::{AuthError, Result};
use crate::{BindHandshake, HandshakeStep};
use bytes::Bytes;
use dirproto::{builder, LdapResult, Request, ResultCode};
use std::fmt;
use tracing::{debug, trace};

/// Mechanism names that can be negotiated
pub const SUPPORTED_MECHANISMS: &[&str] = &["EXTERNAL", "DIGEST-MD5"];

/// Upper bound on challenge rounds before giving up on a server
pub const MAX_ROUNDS: usize = 10;

/// Material the mechanisms may need
#[derive(Clone, Default)]
pub struct SaslCredentials {
    /// Identity to act as, if different from the authenticated one
    pub authz_id: Option<String>,
    pub user: Option<String>,
    pub password: Option<Bytes>,
    pub realm: Option<String>,
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("authz_id", &self.authz_id)
            .field("user", &self.user)
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}

/// Client side of one SASL mechanism
pub trait SaslMechanism: Send {
    fn name(&self) -> &'static str;

    /// Credentials sent with the first bind request
    fn initial_response(&mut self) -> Result<Option<Bytes>>;

    /// Answer a server challenge
    fn step(&mut self, challenge: &[u8]) -> Result<Option<Bytes>>;

    /// Check whatever the server sent along with its final success
    fn verify_final(&mut self, _server_creds: Option<&[u8]>) -> Result<()> {
        Ok(())
    }
}

/// Whether `name` is an allow-listed mechanism
pub fn is_supported(name: &str) -> bool {
    SUPPORTED_MECHANISMS
        .iter()
        .any(|m| m.eq_ignore_ascii_case(name))
}

/// Instantiate an allow-listed mechanism
///
/// `host` is the server host name used by mechanisms that bind to a
/// service principal (DIGEST-MD5 `digest-uri`).
pub fn mechanism_for(
    name: &str,
    credentials: &SaslCredentials,
    host: &str,
) -> Result<Box<dyn SaslMechanism>> {
    match name.to_ascii_uppercase().as_str() {
        "EXTERNAL" => Ok(Box::new(External::new(credentials.authz_id.clone()))),
        "DIGEST-MD5" => Ok(Box::new(DigestMd5::new(credentials, host)?)),
        _ => Err(AuthError::UnsupportedMechanism(name.to_string())),
    }
}

pub struct SaslNegotiation {
    version: u8,
    mechanism: Box<dyn SaslMechanism>,
    rounds: usize,
}

impl SaslNegotiation {
    pub fn new(version: u8, mechanism: Box<dyn SaslMechanism>) -> Self {
        Self {
            version,
            mechanism,
            rounds: 0,
        }
    }

    /// Allow-list check plus mechanism construction
    pub fn for_mechanism(
        version: u8,
        name: &str,
        credentials: &SaslCredentials,
        host: &str,
    ) -> Result<Self> {
        if !is_supported(name) {
            return Err(AuthError::UnsupportedMechanism(name.to_string()));
        }
        Ok(Self::new(version, mechanism_for(name, credentials, host)?))
    }

    fn request(&self, credentials: Option<Bytes>) -> Request {
        builder::bind_sasl(self.version, "", self.mechanism.name(), credentials)
    }
}

impl BindHandshake for SaslNegotiation {
    fn name(&self) -> &str {
        self.mechanism.name()
    }

    fn start(&mut self) -> Result<Request> {
        self.rounds = 0;
        let initial = self.mechanism.initial_response()?;
        debug!("starting SASL {} bind", self.mechanism.name());
        Ok(self.request(initial))
    }

    fn next(&mut self, result: LdapResult) -> Result<HandshakeStep> {
        if result.code == ResultCode::SASL_BIND_IN_PROGRESS {
            self.rounds += 1;
            if self.rounds > MAX_ROUNDS {
                return Err(AuthError::AuthenticationFailed(format!(
                    "SASL {} did not complete after {} rounds",
                    self.mechanism.name(),
                    MAX_ROUNDS
                )));
            }
            let challenge = result.server_creds.unwrap_or_default();
            trace!(
                "SASL {} round {}: {} byte challenge",
                self.mechanism.name(),
                self.rounds,
                challenge.len()
            );
            let response = self.mechanism.step(&challenge)?;
            return Ok(HandshakeStep::Send(self.request(response)));
        }

        if result.is_success() {
            self.mechanism.verify_final(result.server_creds.as_deref())?;
        }
        Ok(HandshakeStep::Done(result))
    }
}
