//! Stateless OTP session tokens.
//!
//! A token carries the email, case id and code digest of one pending
//! verification, signed with HMAC-SHA256 so the server needs no session table:
//!
//! ```text
//! v1.<base64url(payload json)>.<base64url(hmac(v1.<payload>))>
//! ```
//!
//! Every rejection (bad format, bad signature, bad payload, expired) surfaces
//! as `None` from [`SessionSigner::verify`]; the reason is only logged at debug.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretSlice};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_VERSION: &str = "v1";
pub const MIN_KEY_LENGTH: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OtpSessionPayload {
    pub email: String,
    pub case_id: String,
    pub hash: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("signing key must be at least {} bytes", MIN_KEY_LENGTH)]
    WeakKey,
    #[error("invalid token ttl")]
    InvalidTtl,
    #[error("invalid token format")]
    TokenFormat,
    #[error("unsupported token version")]
    InvalidVersion,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
}

pub struct SessionSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSigner").field("key", &"***").finish()
    }
}

impl SessionSigner {
    /// # Errors
    /// Returns [`Error::WeakKey`] if the key is shorter than [`MIN_KEY_LENGTH`].
    pub fn new(key: &SecretSlice<u8>) -> Result<Self, Error> {
        let key = key.expose_secret();
        if key.len() < MIN_KEY_LENGTH {
            return Err(Error::WeakKey);
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| Error::WeakKey)?;
        Ok(Self { mac })
    }

    /// Issue a token valid for `ttl_seconds` from now.
    ///
    /// # Errors
    /// Returns an error if the ttl is not positive or the payload cannot be encoded.
    pub fn issue(
        &self,
        email: &str,
        case_id: &str,
        otp_hash: &str,
        ttl_seconds: i64,
    ) -> Result<String, Error> {
        self.issue_at(email, case_id, otp_hash, ttl_seconds, now_unix_seconds())
    }

    /// Issue a token with an explicit issue time.
    ///
    /// # Errors
    /// Returns an error if the ttl is not positive or the payload cannot be encoded.
    pub fn issue_at(
        &self,
        email: &str,
        case_id: &str,
        otp_hash: &str,
        ttl_seconds: i64,
        now_unix_seconds: i64,
    ) -> Result<String, Error> {
        if ttl_seconds <= 0 {
            return Err(Error::InvalidTtl);
        }
        let expires_at = now_unix_seconds
            .checked_add(ttl_seconds)
            .ok_or(Error::InvalidTtl)?;
        let payload = OtpSessionPayload {
            email: email.to_string(),
            case_id: case_id.to_string(),
            hash: otp_hash.to_string(),
            issued_at: now_unix_seconds,
            expires_at,
        };

        let payload_b64 = Base64UrlUnpadded::encode_string(&serde_json::to_vec(&payload)?);
        let signing_input = format!("{TOKEN_VERSION}.{payload_b64}");
        let signature = self.mac(signing_input.as_bytes()).finalize().into_bytes();
        let signature_b64 = Base64UrlUnpadded::encode_string(&signature);

        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Verify a token against the current time.
    #[must_use]
    pub fn verify(&self, token: &str) -> Option<OtpSessionPayload> {
        self.verify_at(token, now_unix_seconds())
    }

    /// Verify a token against an explicit time.
    #[must_use]
    pub fn verify_at(&self, token: &str, now_unix_seconds: i64) -> Option<OtpSessionPayload> {
        match self.decode(token, now_unix_seconds) {
            Ok(payload) => Some(payload),
            Err(err) => {
                debug!("Rejected OTP session token: {err}");
                None
            }
        }
    }

    /// Check the signature first, then the payload and expiry.
    ///
    /// # Errors
    /// Returns the specific reason a token was rejected.
    pub fn decode(&self, token: &str, now_unix_seconds: i64) -> Result<OtpSessionPayload, Error> {
        let mut parts = token.split('.');
        let version = parts.next().ok_or(Error::TokenFormat)?;
        let payload_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let signature_b64 = parts.next().ok_or(Error::TokenFormat)?;
        if parts.next().is_some() {
            return Err(Error::TokenFormat);
        }
        if version != TOKEN_VERSION {
            return Err(Error::InvalidVersion);
        }

        let signature = decode_canonical(signature_b64)?;
        let signing_input_len = version.len() + 1 + payload_b64.len();
        let signing_input = token
            .get(..signing_input_len)
            .ok_or(Error::TokenFormat)?;
        self.mac(signing_input.as_bytes())
            .verify_slice(&signature)
            .map_err(|_| Error::InvalidSignature)?;

        let payload: OtpSessionPayload = serde_json::from_slice(&decode_canonical(payload_b64)?)?;
        if now_unix_seconds > payload.expires_at {
            return Err(Error::Expired);
        }
        Ok(payload)
    }

    fn mac(&self, data: &[u8]) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac
    }
}

// Reject encodings with non-zero trailing bits so each MAC has exactly one spelling.
fn decode_canonical(value: &str) -> Result<Vec<u8>, Error> {
    let bytes = Base64UrlUnpadded::decode_vec(value).map_err(|_| Error::Base64)?;
    if Base64UrlUnpadded::encode_string(&bytes) != value {
        return Err(Error::Base64);
    }
    Ok(bytes)
}

#[must_use]
pub fn now_unix_seconds() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
