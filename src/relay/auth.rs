//! Long-term credential challenge/response authentication.

use tracing::debug;

use super::handlers::challenge_response;
use crate::error::Result;
use crate::message::{
    integrity::{compute_integrity, find_attribute},
    long_term_key, AttributeType, StunMessage,
};

/// Server identity and credential configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Expected username.
    pub username: String,
    /// Shared password.
    pub password: String,
    /// Authentication realm.
    pub realm: String,
    /// Server nonce handed out in challenges.
    pub nonce: String,
    /// SOFTWARE string advertised in responses.
    pub software: String,
}

/// Result of authenticating one request.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Credentials verified; the caller proceeds to the requested operation.
    Authenticated,
    /// Authentication failed; send this error response to the client.
    Reject(StunMessage),
}

/// Verifies long-term credentials on inbound requests.
pub struct Authenticator {
    config: AuthConfig,
    key: [u8; 16],
}

impl Authenticator {
    /// Precompute the MD5 long-term key for the configured identity.
    pub fn new(config: AuthConfig) -> Self {
        let key = long_term_key(&config.username, &config.realm, &config.password);
        Self { config, key }
    }

    /// Configured identity.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// The long-term credential key, for signing responses.
    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    /// Run the long-term credential check on a request.
    ///
    /// No MESSAGE-INTEGRITY: 401 challenge carrying REALM and NONCE.
    /// Missing USERNAME/REALM/NONCE: 400 Bad Request. Unknown username or
    /// digest mismatch: 401 challenge. A matching digest authenticates the
    /// request; the response to the operation itself is the caller's job.
    pub fn authenticate(&self, msg: &StunMessage) -> Result<AuthOutcome> {
        let Some(claimed) = msg.message_integrity() else {
            debug!("auth: no MESSAGE-INTEGRITY, issuing challenge");
            return Ok(AuthOutcome::Reject(self.challenge(msg)?));
        };

        if msg.username().is_none() || msg.realm().is_none() || msg.nonce().is_none() {
            debug!("auth: integrity present but credentials incomplete");
            return Ok(AuthOutcome::Reject(super::error_response(msg, 400, "Bad Request")?));
        }

        if msg.username() != Some(self.config.username.as_str()) {
            debug!("auth: unknown username {:?}", msg.username());
            return Ok(AuthOutcome::Reject(self.challenge(msg)?));
        }

        // Recompute the digest over the prefix preceding the attribute and
        // compare byte-for-byte.
        let Some(pos) = find_attribute(&msg.raw, AttributeType::MessageIntegrity.code()) else {
            return Ok(AuthOutcome::Reject(self.challenge(msg)?));
        };
        let computed = compute_integrity(&msg.raw[..pos], &self.key)?;
        if &computed != claimed {
            debug!("auth: MESSAGE-INTEGRITY mismatch for {}", self.config.username);
            return Ok(AuthOutcome::Reject(self.challenge(msg)?));
        }

        Ok(AuthOutcome::Authenticated)
    }

    fn challenge(&self, msg: &StunMessage) -> Result<StunMessage> {
        challenge_response(msg, &self.config.realm, self.config.nonce.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Attribute, MessageBuilder, MessageClass, Method, TransactionId};

    fn authenticator() -> Authenticator {
        Authenticator::new(AuthConfig {
            username: "alice".into(),
            password: "wonderland".into(),
            realm: "example.org".into(),
            nonce: "tea-party".into(),
            software: "turnpike".into(),
        })
    }

    fn signed_allocate(auth: &Authenticator, username: &str, key: &[u8]) -> StunMessage {
        let mut b =
            MessageBuilder::new(MessageClass::Request, Method::Allocate, TransactionId::new());
        b.add_attr(Attribute::Username(username.into())).unwrap();
        b.add_attr(Attribute::Realm(auth.config().realm.clone())).unwrap();
        b.add_attr(Attribute::Nonce(auth.config().nonce.as_bytes().to_vec())).unwrap();
        b.add_message_integrity(key).unwrap();
        b.build()
    }

    #[test]
    fn missing_integrity_yields_challenge() {
        let auth = authenticator();
        let mut b =
            MessageBuilder::new(MessageClass::Request, Method::Allocate, TransactionId::new());
        b.add_attr(Attribute::Username("alice".into())).unwrap();
        let msg = b.build();

        let AuthOutcome::Reject(resp) = auth.authenticate(&msg).unwrap() else {
            panic!("expected challenge");
        };
        assert_eq!(resp.error_code().map(|(c, _)| c), Some(401));
        assert_eq!(resp.realm(), Some("example.org"));
        assert_eq!(resp.nonce(), Some(b"tea-party".as_slice()));
        assert_eq!(resp.header.transaction_id, msg.header.transaction_id);
    }

    #[test]
    fn incomplete_credentials_yield_bad_request() {
        let auth = authenticator();
        // Integrity but no USERNAME/REALM/NONCE.
        let mut b =
            MessageBuilder::new(MessageClass::Request, Method::Allocate, TransactionId::new());
        b.add_message_integrity(auth.key()).unwrap();
        let msg = b.build();

        let AuthOutcome::Reject(resp) = auth.authenticate(&msg).unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(resp.error_code().map(|(c, _)| c), Some(400));
    }

    #[test]
    fn wrong_username_yields_challenge() {
        let auth = authenticator();
        let bad_key = long_term_key("mallory", "example.org", "wonderland");
        let msg = signed_allocate(&auth, "mallory", &bad_key);

        let AuthOutcome::Reject(resp) = auth.authenticate(&msg).unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(resp.error_code().map(|(c, _)| c), Some(401));
    }

    #[test]
    fn wrong_password_yields_challenge() {
        let auth = authenticator();
        let wrong_key = long_term_key("alice", "example.org", "not-wonderland");
        let msg = signed_allocate(&auth, "alice", &wrong_key);

        let AuthOutcome::Reject(resp) = auth.authenticate(&msg).unwrap() else {
            panic!("expected rejection");
        };
        assert_eq!(resp.error_code().map(|(c, _)| c), Some(401));
    }

    #[test]
    fn valid_credentials_authenticate() {
        let auth = authenticator();
        let key = *auth.key();
        let msg = signed_allocate(&auth, "alice", &key);
        assert!(matches!(auth.authenticate(&msg).unwrap(), AuthOutcome::Authenticated));
    }
}
