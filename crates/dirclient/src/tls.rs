//! StartTLS collaborator

use crate::error::Result;
use crate::strategy::Strategy;
use async_trait::async_trait;

/// Upgrades an open session to TLS
///
/// Invoked only from `start_tls` and from deferred resolution. Returns
/// whether the upgrade happened.
#[async_trait]
pub trait TlsNegotiator: Send + Sync {
    async fn start_tls(&self, strategy: &mut dyn Strategy) -> Result<bool>;
}

/// The StartTLS extended operation, then an in-place link upgrade
#[derive(Debug, Default, Clone, Copy)]
pub struct StartTlsExtended;

#[async_trait]
impl TlsNegotiator for StartTlsExtended {
    async fn start_tls(&self, strategy: &mut dyn Strategy) -> Result<bool> {
        strategy.start_tls().await
    }
}
