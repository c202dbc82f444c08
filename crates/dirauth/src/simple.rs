use crate::error::Result;
use crate::{BindHandshake, HandshakeStep};
use bytes::Bytes;
use dirproto::{builder, LdapResult, Request};
use std::fmt;

/// A bind principal and its secret
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Bytes,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<Bytes>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn password_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.password).ok()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Anonymous or name/password bind: one request, one result
#[derive(Debug, Clone)]
pub struct SimpleBind {
    version: u8,
    credentials: Option<Credentials>,
}

impl SimpleBind {
    pub fn anonymous(version: u8) -> Self {
        Self {
            version,
            credentials: None,
        }
    }

    pub fn new(version: u8, credentials: Credentials) -> Self {
        Self {
            version,
            credentials: Some(credentials),
        }
    }

    pub fn request(&self) -> Request {
        match &self.credentials {
            Some(creds) => builder::bind_simple(self.version, &creds.user, creds.password.clone()),
            None => builder::bind_anonymous(self.version),
        }
    }
}

impl BindHandshake for SimpleBind {
    fn name(&self) -> &str {
        if self.credentials.is_some() {
            "SIMPLE"
        } else {
            "ANONYMOUS"
        }
    }

    fn start(&mut self) -> Result<Request> {
        Ok(self.request())
    }

    fn next(&mut self, result: LdapResult) -> Result<HandshakeStep> {
        Ok(HandshakeStep::Done(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirproto::{BindAuthentication, ResponseKind};

    #[test]
    fn test_anonymous_bind_has_empty_name_and_password() {
        let mut bind = SimpleBind::anonymous(3);
        match bind.start().unwrap() {
            Request::Bind(request) => {
                assert_eq!(request.version, 3);
                assert!(request.name.is_empty());
                assert_eq!(request.authentication, BindAuthentication::Simple(Bytes::new()));
            }
            other => panic!("unexpected request {:?}", other),
        }
        assert_eq!(bind.name(), "ANONYMOUS");
    }

    #[test]
    fn test_simple_bind_finishes_after_one_round() {
        let mut bind = SimpleBind::new(3, Credentials::new("cn=admin", "secret"));
        bind.start().unwrap();
        let step = bind
            .next(LdapResult::success(ResponseKind::BindResponse))
            .unwrap();
        assert!(matches!(step, HandshakeStep::Done(result) if result.is_success()));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("cn=admin", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
