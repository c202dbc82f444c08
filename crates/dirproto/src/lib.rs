//! Directory protocol message model
//!
//! This crate holds the abstract request/response objects exchanged with a
//! directory server, the pure builders that produce requests, the wire
//! boundary traits that move them, and the LDIF change-record renderer.

pub mod builder;
pub mod endpoint;
pub mod error;
pub mod ldif;
pub mod link;
pub mod message;
pub mod result;

pub use endpoint::Endpoint;
pub use error::{ProtocolError, Result};
pub use link::{Codec, Connector, FramedLink, Link, TcpConnector};
pub use message::*;
pub use result::*;
