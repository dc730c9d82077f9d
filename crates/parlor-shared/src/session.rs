//! Signed session tokens.
//!
//! A token is `base64url(bincode(claims) || ed25519_signature)`. The server
//! signs with its own key at issue time and verifies with the matching
//! public key on every WebSocket handshake and REST call.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::constants::SIGNATURE_SIZE;
use crate::error::TokenError;
use crate::types::UserId;

/// What a session token asserts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub user_id: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionClaims {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Issues and verifies session tokens with one Ed25519 keypair.
#[derive(Clone)]
pub struct SessionKeys {
    signing_key: SigningKey,
    ttl: Duration,
}

impl SessionKeys {
    pub fn new(signing_key: SigningKey, ttl: Duration) -> Self {
        Self { signing_key, ttl }
    }

    /// Fresh random keypair. Tokens do not survive a restart.
    pub fn generate(ttl: Duration) -> Self {
        Self::new(SigningKey::generate(&mut OsRng), ttl)
    }

    /// Load the signing key from 64 hex characters.
    pub fn from_hex(hex_key: &str, ttl: Duration) -> Result<Self, TokenError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let secret: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            TokenError::InvalidKey(format!("expected 32 bytes, got {}", b.len()))
        })?;
        Ok(Self::new(SigningKey::from_bytes(&secret), ttl))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `user_id` valid from now for the configured TTL.
    pub fn issue(&self, user_id: UserId) -> Result<(String, SessionClaims), TokenError> {
        let now = Utc::now();
        let claims = SessionClaims {
            user_id,
            issued_at: now,
            expires_at: now + self.ttl,
        };
        let token = sign_claims(&claims, &self.signing_key)?;
        Ok((token, claims))
    }

    /// Verify signature and expiry, returning the embedded claims.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        verify_token(token, &self.verifying_key(), Utc::now())
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("verifying_key", &hex::encode(self.verifying_key().to_bytes()))
            .field("ttl_hours", &self.ttl.num_hours())
            .finish()
    }
}

pub fn sign_claims(claims: &SessionClaims, signing_key: &SigningKey) -> Result<String, TokenError> {
    let mut payload =
        bincode::serialize(claims).map_err(|e| TokenError::Malformed(e.to_string()))?;
    let signature = signing_key.sign(&payload);
    payload.extend_from_slice(&signature.to_bytes());
    Ok(URL_SAFE_NO_PAD.encode(payload))
}

pub fn verify_token(
    token: &str,
    verifying_key: &VerifyingKey,
    now: DateTime<Utc>,
) -> Result<SessionClaims, TokenError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Missing);
    }

    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    if raw.len() <= SIGNATURE_SIZE {
        return Err(TokenError::Malformed("token too short".into()));
    }

    let (payload, sig_bytes) = raw.split_at(raw.len() - SIGNATURE_SIZE);
    let signature =
        Signature::from_slice(sig_bytes).map_err(|_| TokenError::BadSignature)?;
    verifying_key
        .verify(payload, &signature)
        .map_err(|_| TokenError::BadSignature)?;

    let claims: SessionClaims =
        bincode::deserialize(payload).map_err(|e| TokenError::Malformed(e.to_string()))?;
    if claims.is_expired_at(now) {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}
