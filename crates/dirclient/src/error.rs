//! Error types for directory sessions

use dirauth::AuthError;
use dirconf::ConfigError;
use dirproto::{LdapResult, MessageId, ProtocolError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Unknown authentication method: {0}")]
    UnknownAuthenticationMethod(String),

    #[error("Unsupported SASL mechanism: {0}")]
    UnsupportedMechanism(String),

    #[error("Authentication method not supported by server: {0}")]
    AuthMethodNotSupported(String),

    #[error("Bind failed: {0}")]
    BindFailure(String),

    #[error("Session is read-only: {0} refused")]
    ReadOnlyViolation(String),

    #[error("Malformed change set: {0}")]
    MalformedChangeSet(String),

    #[error("Unknown change type: {0}")]
    UnknownChangeType(String),

    #[error("Invalid DN transition: {0}")]
    InvalidDnTransition(String),

    #[error("Missing package: {0}")]
    MissingPackage(String),

    #[error("Attribute set not found for {0}")]
    AttributeSetUnmatched(String),

    #[error("Transport failure: {0}")]
    Transport(#[from] ProtocolError),

    #[error("Operation failed: {0}")]
    OperationResult(Box<LdapResult>),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Timeout waiting for response to message {0}")]
    Timeout(MessageId),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("objectClass attribute is mandatory for {0}")]
    ObjectClassMissing(String),
}

/// Error classification recorded in a session's last error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    UnknownStrategy,
    UnknownAuthenticationMethod,
    UnsupportedMechanism,
    AuthMethodNotSupported,
    BindFailure,
    ReadOnlyViolation,
    MalformedChangeSet,
    UnknownChangeType,
    InvalidDnTransition,
    MissingPackage,
    AttributeSetUnmatched,
    TransportFailure,
    OperationResult,
    Unsupported,
    Timeout,
    Config,
    ObjectClassMissing,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::UnknownStrategy(_) => ErrorKind::UnknownStrategy,
            SessionError::UnknownAuthenticationMethod(_) => ErrorKind::UnknownAuthenticationMethod,
            SessionError::UnsupportedMechanism(_) => ErrorKind::UnsupportedMechanism,
            SessionError::AuthMethodNotSupported(_) => ErrorKind::AuthMethodNotSupported,
            SessionError::BindFailure(_) => ErrorKind::BindFailure,
            SessionError::ReadOnlyViolation(_) => ErrorKind::ReadOnlyViolation,
            SessionError::MalformedChangeSet(_) => ErrorKind::MalformedChangeSet,
            SessionError::UnknownChangeType(_) => ErrorKind::UnknownChangeType,
            SessionError::InvalidDnTransition(_) => ErrorKind::InvalidDnTransition,
            SessionError::MissingPackage(_) => ErrorKind::MissingPackage,
            SessionError::AttributeSetUnmatched(_) => ErrorKind::AttributeSetUnmatched,
            SessionError::Transport(_) => ErrorKind::TransportFailure,
            SessionError::OperationResult(_) => ErrorKind::OperationResult,
            SessionError::Unsupported(_) => ErrorKind::Unsupported,
            SessionError::Timeout(_) => ErrorKind::Timeout,
            SessionError::Config(_) => ErrorKind::Config,
            SessionError::ObjectClassMissing(_) => ErrorKind::ObjectClassMissing,
        }
    }

    /// Whether the failure happened below the protocol, on the connection
    ///
    /// Only these failures are worth a reconnect; a server that answered
    /// with an error code is not.
    pub fn is_transport_failure(&self) -> bool {
        match self {
            SessionError::Transport(e) => e.is_recoverable(),
            SessionError::Timeout(_) => true,
            _ => false,
        }
    }

    /// The result carried by an [`SessionError::OperationResult`]
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            SessionError::OperationResult(result) => Some(result),
            _ => None,
        }
    }
}

impl From<AuthError> for SessionError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::AuthMethodNotSupported(m) => SessionError::AuthMethodNotSupported(m),
            AuthError::UnknownAuthenticationMethod(m) => {
                SessionError::UnknownAuthenticationMethod(m)
            }
            AuthError::UnsupportedMechanism(m) => SessionError::UnsupportedMechanism(m),
            AuthError::MissingPackage(m) => SessionError::MissingPackage(m),
            AuthError::InvalidChallenge(m) | AuthError::AuthenticationFailed(m) => {
                SessionError::BindFailure(m)
            }
        }
    }
}

/// Last failure seen by a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
}

impl LastError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&SessionError> for LastError {
    fn from(err: &SessionError) -> Self {
        LastError::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
