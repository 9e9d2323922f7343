//! Authentication for the replication source.
//!
//! Replicas log in with a user name and password checked against a
//! [`UserStore`], and receive a session token signed with HMAC-SHA256.
//!
//! ## Token Format
//!
//! Tokens are two hex strings joined by a dot:
//! - payload: expiry (Unix millis, 8 bytes big-endian), 8 random bytes,
//!   then the user name
//! - signature: HMAC-SHA256 over the payload

use crate::error::{SourceError, SourceResult};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const PAYLOAD_HEADER: usize = 16;

struct Credential {
    salt: [u8; 16],
    digest: [u8; 32],
}

fn password_digest(salt: &[u8; 16], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Users allowed to replicate, stored as salted SHA-256 digests.
#[derive(Default)]
pub struct UserStore {
    users: RwLock<HashMap<String, Credential>>,
}

impl UserStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user or replaces its password.
    pub fn add_user(&self, username: impl Into<String>, password: &str) {
        let salt: [u8; 16] = rand::random();
        let digest = password_digest(&salt, password);
        self.users
            .write()
            .insert(username.into(), Credential { salt, digest });
    }

    /// Removes a user. Returns false if it did not exist.
    pub fn remove_user(&self, username: &str) -> bool {
        self.users.write().remove(username).is_some()
    }

    /// Returns true if the user exists and the password matches.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let users = self.users.read();
        match users.get(username) {
            Some(credential) => {
                constant_time_eq(&password_digest(&credential.salt, password), &credential.digest)
            }
            None => false,
        }
    }

    /// Number of users.
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// Returns true if there are no users.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Issues and checks session tokens.
#[derive(Clone)]
pub struct SessionTokens {
    secret: Vec<u8>,
    expiry: Duration,
}

impl SessionTokens {
    /// Creates a token signer.
    pub fn new(secret: Vec<u8>, expiry: Duration) -> Self {
        Self { secret, expiry }
    }

    /// Creates a signer with a random key.
    pub fn random(expiry: Duration) -> Self {
        let secret: [u8; 32] = rand::random();
        Self::new(secret.to_vec(), expiry)
    }

    /// Issues a token for `username`.
    pub fn issue(&self, username: &str) -> SourceResult<String> {
        let expires = now_millis().saturating_add(self.expiry.as_millis() as u64);
        let nonce: [u8; 8] = rand::random();

        let mut payload = Vec::with_capacity(PAYLOAD_HEADER + username.len());
        payload.extend_from_slice(&expires.to_be_bytes());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(username.as_bytes());

        let signature = self.mac(&payload)?.finalize().into_bytes();
        Ok(format!("{}.{}", to_hex(&payload), to_hex(&signature)))
    }

    /// Checks a token and returns the user it was issued to.
    pub fn validate(&self, token: &str) -> SourceResult<String> {
        let (payload, signature) = token
            .split_once('.')
            .and_then(|(p, s)| Some((from_hex(p)?, from_hex(s)?)))
            .ok_or_else(|| SourceError::Unauthorized("malformed token".into()))?;
        if payload.len() < PAYLOAD_HEADER {
            return Err(SourceError::Unauthorized("malformed token".into()));
        }

        self.mac(&payload)?
            .verify_slice(&signature)
            .map_err(|_| SourceError::Unauthorized("invalid signature".into()))?;

        let mut expires = [0u8; 8];
        expires.copy_from_slice(&payload[..8]);
        if now_millis() > u64::from_be_bytes(expires) {
            return Err(SourceError::Unauthorized("token expired".into()));
        }

        String::from_utf8(payload[PAYLOAD_HEADER..].to_vec())
            .map_err(|_| SourceError::Unauthorized("malformed token".into()))
    }

    fn mac(&self, payload: &[u8]) -> SourceResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SourceError::Internal(e.to_string()))?;
        mac.update(payload);
        Ok(mac)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> SessionTokens {
        SessionTokens::new(b"test-secret-key-32-bytes-long!!".to_vec(), Duration::from_secs(60))
    }

    #[test]
    fn users_authenticate() {
        let users = UserStore::new();
        users.add_user("root", "secret");
        assert!(users.authenticate("root", "secret"));
        assert!(!users.authenticate("root", "Secret"));
        assert!(!users.authenticate("nobody", "secret"));
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn same_password_different_digest() {
        let users = UserStore::new();
        users.add_user("a", "pw");
        users.add_user("b", "pw");
        let guard = users.users.read();
        assert_ne!(guard["a"].digest, guard["b"].digest);
    }

    #[test]
    fn removed_user_is_rejected() {
        let users = UserStore::new();
        users.add_user("root", "secret");
        assert!(users.remove_user("root"));
        assert!(!users.authenticate("root", "secret"));
        assert!(users.is_empty());
    }

    #[test]
    fn create_and_validate_token() {
        let tokens = tokens();
        let token = tokens.issue("root").unwrap();
        assert_eq!(tokens.validate(&token).unwrap(), "root");
    }

    #[test]
    fn reject_tampered_token() {
        let tokens = tokens();
        let token = tokens.issue("root").unwrap();
        let (payload, signature) = token.split_once('.').unwrap();
        let forged = format!("{}.{}", payload.replacen('0', "1", 1), signature);
        assert!(tokens.validate(&forged).is_err());
        assert!(tokens.validate("not-a-token").is_err());
        assert!(tokens.validate("abc.def").is_err());
    }

    #[test]
    fn reject_foreign_token() {
        let other = SessionTokens::random(Duration::from_secs(60));
        let token = other.issue("root").unwrap();
        assert!(matches!(tokens().validate(&token), Err(SourceError::Unauthorized(_))));
    }

    #[test]
    fn reject_expired_token() {
        let tokens = SessionTokens::new(b"k".to_vec(), Duration::from_secs(0));
        let token = tokens.issue("root").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(tokens.validate(&token).is_err());
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(to_hex(&[0, 15, 255]), "000fff");
        assert_eq!(from_hex("000fff"), Some(vec![0, 15, 255]));
        assert_eq!(from_hex("abc"), None);
        assert_eq!(from_hex("zz"), None);
    }
}
