//! Directory session engine
//!
//! This crate provides the client-side session for a directory server:
//! connection lifecycle, StartTLS, bind handshakes, lazy (deferred)
//! execution, and a pluggable transport strategy underneath the same
//! operation API.
//!
//! # Example
//!
//! ```no_run
//! use dirclient::{Session, SessionConfig, StrategyKind};
//! use dirproto::builder::SearchParams;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> dirclient::Result<()> {
//!     let directory = Arc::new(dirclient::MockDirectory::new());
//!     directory.add_entry(
//!         "cn=admin,dc=example,dc=com",
//!         [("objectClass", vec!["person"]), ("userPassword", vec!["secret"])],
//!     );
//!
//!     let config = SessionConfig::default()
//!         .with_strategy(StrategyKind::MockSync)
//!         .with_credentials("cn=admin,dc=example,dc=com", "secret");
//!     let session = Session::builder(config).mock_directory(directory).build()?;
//!
//!     session.bind(&[]).await?;
//!     let found = session
//!         .search(&SearchParams::new("dc=example,dc=com", "(objectClass=person)"), &[])
//!         .await?;
//!     println!("search: {}", found);
//!     session.unbind().await;
//!     Ok(())
//! }
//! ```

pub mod changes;
pub mod config;
pub mod entries;
pub mod error;
pub mod outcome;
pub mod selector;
pub mod server_info;
pub mod session;
pub mod strategy;
pub mod tls;
pub mod usage;
pub mod wait_helper;

pub use changes::{ChangeSet, IntoChangeSet};
pub use config::{
    AuthenticationKind, AutoBind, PooledBindPolicy, ServerInfoMode, SessionConfig, StrategyKind,
};
pub use entries::{signature, Entry, Signature};
pub use error::{ErrorKind, LastError, Result, SessionError};
pub use outcome::Outcome;
pub use selector::{EndpointPool, EndpointSelector, SingleEndpoint};
pub use server_info::ServerInfo;
pub use session::{Session, SessionBuilder};
pub use strategy::{Collected, DirectoryEvent, Dispatched, MockDirectory, Strategy};
pub use tls::{StartTlsExtended, TlsNegotiator};
pub use usage::Usage;
