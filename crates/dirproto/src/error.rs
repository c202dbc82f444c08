use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Link is not open")]
    NotOpen,
    #[error("Timeout error")]
    Timeout,
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ProtocolError {
    pub fn protocol_error(msg: &str) -> Self {
        Self::Protocol(msg.to_string())
    }

    pub fn codec_error(msg: &str) -> Self {
        Self::Codec(msg.to_string())
    }

    pub fn connection_error(msg: &str) -> Self {
        Self::Connection(msg.to_string())
    }

    /// Check if this error represents a transport-level failure
    ///
    /// Transport failures are connection resets, broken pipes, timeouts and
    /// links closed underneath us. A protocol-level error response is never
    /// a transport failure.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProtocolError::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            ProtocolError::Timeout
            | ProtocolError::Connection(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::NotOpen => true,
            _ => false,
        }
    }

    /// Get a human-readable category for this error
    pub fn category(&self) -> &'static str {
        match self {
            ProtocolError::Protocol(_) => "Protocol",
            ProtocolError::Io(_) => "I/O",
            ProtocolError::Codec(_) => "Codec",
            ProtocolError::Connection(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::NotOpen => "Connection",
            ProtocolError::Timeout => "Timeout",
            ProtocolError::InvalidEndpoint(_) => "Endpoint",
            ProtocolError::Unsupported(_) => "Unsupported",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
