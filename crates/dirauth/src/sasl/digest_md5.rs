//! DIGEST-MD5 (RFC 2831), `qop=auth` only

use super::{SaslCredentials, SaslMechanism};
use crate::error::{AuthError, Result};
use bytes::Bytes;
use md5::{Digest, Md5};
use rand::RngCore;
use std::collections::HashMap;
use tracing::debug;

const NONCE_COUNT: &str = "00000001";
const QOP_AUTH: &str = "auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitChallenge,
    AwaitRspauth,
    Done,
}

pub struct DigestMd5 {
    user: String,
    password: Bytes,
    realm: Option<String>,
    authz_id: Option<String>,
    service: String,
    host: String,
    cnonce: Option<String>,
    expected_rspauth: Option<String>,
    state: State,
}

impl DigestMd5 {
    pub fn new(credentials: &SaslCredentials, host: &str) -> Result<Self> {
        let (Some(user), Some(password)) = (&credentials.user, &credentials.password) else {
            return Err(AuthError::AuthenticationFailed(
                "DIGEST-MD5 needs a user and a password".into(),
            ));
        };
        Ok(Self {
            user: user.clone(),
            password: password.clone(),
            realm: credentials.realm.clone(),
            authz_id: credentials.authz_id.clone(),
            service: "ldap".to_string(),
            host: host.to_string(),
            cnonce: None,
            expected_rspauth: None,
            state: State::AwaitChallenge,
        })
    }

    /// Service part of `digest-uri`, `ldap` by default
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Fix the client nonce instead of drawing a random one
    pub fn with_cnonce(mut self, cnonce: impl Into<String>) -> Self {
        self.cnonce = Some(cnonce.into());
        self
    }

    fn digest_uri(&self) -> String {
        format!("{}/{}", self.service, self.host)
    }

    /// HEX(H(A1)) with A1 = H(user:realm:password):nonce:cnonce[:authzid]
    fn ha1(&self, realm: &str, nonce: &str, cnonce: &str) -> String {
        let mut inner = Md5::new();
        inner.update(self.user.as_bytes());
        inner.update(b":");
        inner.update(realm.as_bytes());
        inner.update(b":");
        inner.update(&self.password);
        let inner = inner.finalize();

        let mut a1 = Md5::new();
        a1.update(inner);
        a1.update(format!(":{}:{}", nonce, cnonce).as_bytes());
        if let Some(authz_id) = &self.authz_id {
            a1.update(b":");
            a1.update(authz_id.as_bytes());
        }
        hex::encode(a1.finalize())
    }

    /// `response` (A2 prefix `AUTHENTICATE`) or `rspauth` (empty prefix)
    fn kd(&self, ha1: &str, nonce: &str, cnonce: &str, a2_prefix: &str) -> String {
        let ha2 = hex::encode(Md5::digest(format!("{}:{}", a2_prefix, self.digest_uri())));
        let kd = format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, NONCE_COUNT, cnonce, QOP_AUTH, ha2
        );
        hex::encode(Md5::digest(kd))
    }

    fn answer_challenge(&mut self, challenge: &[u8]) -> Result<Bytes> {
        let directives = parse_directives(challenge)?;
        let nonce = directives
            .get("nonce")
            .ok_or_else(|| AuthError::InvalidChallenge("challenge has no nonce".into()))?
            .clone();

        if let Some(qop) = directives.get("qop") {
            if !qop.split(',').any(|q| q.trim() == QOP_AUTH) {
                return Err(AuthError::InvalidChallenge(format!(
                    "server does not offer qop=auth (offered: {})",
                    qop
                )));
            }
        }
        if let Some(algorithm) = directives.get("algorithm") {
            if !algorithm.eq_ignore_ascii_case("md5-sess") {
                return Err(AuthError::InvalidChallenge(format!(
                    "unsupported algorithm {}",
                    algorithm
                )));
            }
        }

        let realm = self
            .realm
            .clone()
            .or_else(|| directives.get("realm").cloned())
            .unwrap_or_default();
        let cnonce = self.cnonce.clone().unwrap_or_else(|| {
            let mut raw = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut raw);
            hex::encode(raw)
        });

        let ha1 = self.ha1(&realm, &nonce, &cnonce);
        let response = self.kd(&ha1, &nonce, &cnonce, "AUTHENTICATE");
        self.expected_rspauth = Some(self.kd(&ha1, &nonce, &cnonce, ""));

        let mut fields = vec![
            format!("username=\"{}\"", quote(&self.user)),
            format!("realm=\"{}\"", quote(&realm)),
            format!("nonce=\"{}\"", quote(&nonce)),
            format!("cnonce=\"{}\"", quote(&cnonce)),
            format!("nc={}", NONCE_COUNT),
            format!("qop={}", QOP_AUTH),
            format!("digest-uri=\"{}\"", quote(&self.digest_uri())),
            format!("response={}", response),
        ];
        if directives
            .get("charset")
            .is_some_and(|c| c.eq_ignore_ascii_case("utf-8"))
        {
            fields.push("charset=utf-8".to_string());
        }
        if let Some(authz_id) = &self.authz_id {
            fields.push(format!("authzid=\"{}\"", quote(authz_id)));
        }

        debug!("DIGEST-MD5 response computed for {} ({})", self.user, self.digest_uri());
        Ok(Bytes::from(fields.join(",")))
    }

    fn check_rspauth(&mut self, data: &[u8]) -> Result<()> {
        let directives = parse_directives(data)?;
        let received = directives
            .get("rspauth")
            .ok_or_else(|| AuthError::InvalidChallenge("expected rspauth".into()))?;
        match &self.expected_rspauth {
            Some(expected) if expected.eq_ignore_ascii_case(received) => {
                self.state = State::Done;
                Ok(())
            }
            _ => Err(AuthError::AuthenticationFailed(
                "server rspauth does not match".into(),
            )),
        }
    }
}

impl SaslMechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn initial_response(&mut self) -> Result<Option<Bytes>> {
        self.state = State::AwaitChallenge;
        self.expected_rspauth = None;
        Ok(None)
    }

    fn step(&mut self, challenge: &[u8]) -> Result<Option<Bytes>> {
        match self.state {
            State::AwaitChallenge => {
                let response = self.answer_challenge(challenge)?;
                self.state = State::AwaitRspauth;
                Ok(Some(response))
            }
            State::AwaitRspauth => {
                self.check_rspauth(challenge)?;
                Ok(None)
            }
            State::Done => Err(AuthError::InvalidChallenge(
                "unexpected challenge after authentication".into(),
            )),
        }
    }

    fn verify_final(&mut self, server_creds: Option<&[u8]>) -> Result<()> {
        match (self.state, server_creds) {
            (State::AwaitRspauth, Some(data)) if !data.is_empty() => self.check_rspauth(data),
            _ => Ok(()),
        }
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Parse `key=value,key="quoted, value"` directives
///
/// Keys are lowercased; for repeated keys the first occurrence wins.
fn parse_directives(data: &[u8]) -> Result<HashMap<String, String>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| AuthError::InvalidChallenge("challenge is not UTF-8".into()))?;
    let mut directives = HashMap::new();
    let mut chars = text.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(AuthError::InvalidChallenge(format!(
                "malformed directive in '{}'",
                text
            )));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => value.push(other),
                }
            }
            if !closed {
                return Err(AuthError::InvalidChallenge(format!(
                    "unterminated quoted value for {}",
                    key
                )));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        directives.entry(key).or_insert(value);
    }

    Ok(directives)
}
