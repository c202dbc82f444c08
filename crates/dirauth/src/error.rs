//! Error types for bind handshakes

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The server does not offer the mechanism the handshake needs
    #[error("Authentication method not supported: {0}")]
    AuthMethodNotSupported(String),

    /// Credentials cannot be used with the requested method
    #[error("Unknown authentication method: {0}")]
    UnknownAuthenticationMethod(String),

    #[error("Unsupported SASL mechanism: {0}")]
    UnsupportedMechanism(String),

    /// An optional capability needed by the handshake is not installed
    #[error("Missing package: {0}")]
    MissingPackage(String),

    #[error("Invalid server challenge: {0}")]
    InvalidChallenge(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;
