//! Three-round challenge-response bind ("sicily")
//!
//! 1. package discovery: the server answers with a `;`-separated list of
//!    packages in its credentials, which must include `NTLM`
//! 2. negotiate: the client's negotiate message, built by the
//!    [`ChallengeResponseClient`]
//! 3. response: sent only when round 2 succeeded, answering the server's
//!    challenge carried in the round 2 credentials
//!
//! The message formats of the challenge-response package itself are not
//! handled here; a [`ChallengeResponseFactory`] is injected by the caller
//! and its absence is reported as a missing package.

use crate::error::{AuthError, Result};
use crate::simple::Credentials;
use crate::{BindHandshake, HandshakeStep};
use bytes::Bytes;
use dirproto::{builder, BindAuthentication, LdapResult, Request};
use tracing::{debug, trace};

/// Package name the server must advertise during discovery
pub const NTLM_PACKAGE: &str = "NTLM";

/// Client half of a challenge-response package
pub trait ChallengeResponseClient: Send {
    /// Type 1 (negotiate) message
    fn negotiate(&mut self) -> Result<Bytes>;

    /// Type 3 (authenticate) message for the server's type 2 challenge
    fn authenticate(&mut self, challenge: &[u8]) -> Result<Bytes>;
}

/// Creates challenge-response clients for a domain account
pub trait ChallengeResponseFactory: Send + Sync {
    fn create(
        &self,
        domain: &str,
        user: &str,
        password: &[u8],
    ) -> Result<Box<dyn ChallengeResponseClient>>;
}

/// Split a `DOMAIN\user` principal
pub fn split_domain_user(principal: &str) -> Result<(&str, &str)> {
    match principal.split_once('\\') {
        Some((domain, user)) if !domain.is_empty() && !user.is_empty() => Ok((domain, user)),
        _ => Err(AuthError::UnknownAuthenticationMethod(format!(
            "'{}' is not in DOMAIN\\username form",
            principal
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    Start,
    Discovery,
    Negotiate,
    Response,
    Finished,
}

pub struct SicilyHandshake {
    version: u8,
    user: String,
    client: Box<dyn ChallengeResponseClient>,
    round: Round,
}

impl SicilyHandshake {
    /// Validate the credentials and build the handshake
    ///
    /// Fails before any message exists when the principal is not
    /// domain-qualified, the password is missing, or no
    /// challenge-response package is available.
    pub fn new(
        version: u8,
        credentials: Option<&Credentials>,
        factory: Option<&dyn ChallengeResponseFactory>,
    ) -> Result<Self> {
        let creds = credentials
            .filter(|c| !c.user.is_empty() && !c.password.is_empty())
            .ok_or_else(|| {
                AuthError::UnknownAuthenticationMethod(
                    "NTLM needs domain\\username and a password".into(),
                )
            })?;
        let (domain, user) = split_domain_user(&creds.user)?;
        let factory = factory.ok_or_else(|| {
            AuthError::MissingPackage("no challenge-response package available".into())
        })?;
        let client = factory.create(domain, user, &creds.password)?;
        debug!("challenge-response bind prepared for {}\\{}", domain, user);

        Ok(Self {
            version,
            user: creds.user.clone(),
            client,
            round: Round::Start,
        })
    }

    fn request(&self, name: &str, authentication: BindAuthentication) -> Request {
        builder::bind_sicily(self.version, name, authentication)
    }
}

impl BindHandshake for SicilyHandshake {
    fn name(&self) -> &str {
        NTLM_PACKAGE
    }

    fn start(&mut self) -> Result<Request> {
        self.round = Round::Discovery;
        Ok(self.request("", BindAuthentication::SicilyPackageDiscovery))
    }

    fn next(&mut self, result: LdapResult) -> Result<HandshakeStep> {
        match self.round {
            Round::Discovery => {
                if !result.is_success() {
                    self.round = Round::Finished;
                    return Ok(HandshakeStep::Done(result));
                }
                let packages = result
                    .server_creds
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default();
                trace!("server challenge-response packages: {}", packages);
                if !packages.split(';').any(|p| p.trim() == NTLM_PACKAGE) {
                    self.round = Round::Finished;
                    return Err(AuthError::AuthMethodNotSupported(format!(
                        "server does not offer {} (offered: '{}')",
                        NTLM_PACKAGE, packages
                    )));
                }
                let negotiate = self.client.negotiate()?;
                self.round = Round::Negotiate;
                Ok(HandshakeStep::Send(self.request(
                    NTLM_PACKAGE,
                    BindAuthentication::SicilyNegotiate(negotiate),
                )))
            }
            Round::Negotiate => {
                if !result.is_success() {
                    self.round = Round::Finished;
                    return Ok(HandshakeStep::Done(result));
                }
                let challenge = result.server_creds.clone().unwrap_or_default();
                let response = self.client.authenticate(&challenge)?;
                self.round = Round::Response;
                let user = self.user.clone();
                Ok(HandshakeStep::Send(self.request(
                    &user,
                    BindAuthentication::SicilyResponse(response),
                )))
            }
            Round::Response => {
                self.round = Round::Finished;
                Ok(HandshakeStep::Done(result))
            }
            Round::Start | Round::Finished => Err(AuthError::AuthenticationFailed(
                "challenge-response handshake is not in progress".into(),
            )),
        }
    }
}
