use super::SaslMechanism;
use crate::error::{AuthError, Result};
use bytes::Bytes;

/// SASL EXTERNAL: identity comes from the transport (client certificate)
#[derive(Debug, Clone)]
pub struct External {
    authz_id: Option<String>,
}

impl External {
    pub fn new(authz_id: Option<String>) -> Self {
        Self { authz_id }
    }
}

impl SaslMechanism for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn initial_response(&mut self) -> Result<Option<Bytes>> {
        Ok(Some(
            self.authz_id
                .as_ref()
                .map(|id| Bytes::from(id.clone()))
                .unwrap_or_default(),
        ))
    }

    fn step(&mut self, _challenge: &[u8]) -> Result<Option<Bytes>> {
        Err(AuthError::InvalidChallenge(
            "EXTERNAL does not expect a server challenge".into(),
        ))
    }
}
