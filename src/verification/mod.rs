//! Passwordless email verification core.
//!
//! Three pieces, no server-side session store:
//! - [`rate_limit`]: in-memory fixed-window counters gating send and verify.
//! - [`otp`]: numeric code generation and peppered Argon2id digests.
//! - [`session`]: HMAC-signed tokens carrying `{email, caseId, hash, expiry}`
//!   through a cookie.
//!
//! [`service::VerificationService`] wires them into the send/verify flows.
//! Outbound mail goes through [`email::EmailSender`]; [`smtp`] delivers it.
//! Everything here is plain data in and out; cookies, headers and JSON belong
//! to the HTTP adapter.

pub mod config;
pub mod email;
pub mod otp;
pub mod rate_limit;
pub mod service;
pub mod session;
pub mod smtp;

pub use config::VerificationConfig;
pub use otp::OtpCodec;
pub use rate_limit::{
    InMemoryRateLimiter, NoopRateLimiter, RateLimitDecision, RateLimitPolicy, RateLimiter,
};
pub use service::{
    CompleteVerification, IssuedCode, StartOutcome, StartVerification, VerificationService,
    VerifyOutcome,
};
pub use session::{OtpSessionPayload, SessionSigner};

use anyhow::{Result, anyhow};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use sha2::Sha256;

/// Normalize an email for keying and comparison.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[must_use]
pub fn normalize_case_id(case_id: &str) -> &str {
    case_id.trim()
}

/// Derive an independent 32-byte sub-key from the process secret.
fn derive_key(secret: &SecretString, label: &str) -> Result<SecretSlice<u8>> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|_| anyhow!("invalid process secret"))?;
    mac.update(label.as_bytes());
    Ok(SecretSlice::from(mac.finalize().into_bytes().to_vec()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn normalize_case_id_trims() {
        assert_eq!(normalize_case_id("  C1 "), "C1");
    }

    #[test]
    fn derive_key_separates_labels() {
        let secret = SecretString::from("0123456789abcdef0123456789abcdef");
        let first = derive_key(&secret, "one").unwrap();
        let again = derive_key(&secret, "one").unwrap();
        let second = derive_key(&secret, "two").unwrap();
        assert_eq!(first.expose_secret().len(), 32);
        assert_eq!(first.expose_secret(), again.expose_secret());
        assert_ne!(first.expose_secret(), second.expose_secret());
    }
}
