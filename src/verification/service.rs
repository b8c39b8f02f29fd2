//! Send and verify flows over the limiter, codec and session signer.
//!
//! Flow Overview:
//! 1) `start`: send gate, fresh code, Argon2id digest, signed session token.
//! 2) `complete`: per-client verify gate, per-case verify gate, code shape,
//!    token signature/expiry, email and case match, then the code itself.
//!
//! Every verify attempt that reaches the limiter counts against the budget,
//! including malformed codes and missing sessions. The per-case gate has no
//! client address in its key, so rotating addresses cannot widen it.

use anyhow::{Context, Result, ensure};
use argon2::Params;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::config::VerificationConfig;
use super::otp::{OtpCodec, is_well_formed};
use super::rate_limit::{
    RateLimitAction, RateLimitDecision, RateLimiter, case_verify_key, rate_limit_key,
};
use super::session::{MIN_KEY_LENGTH, OtpSessionPayload, SessionSigner};
use super::{derive_key, normalize_case_id, normalize_email};

const SESSION_KEY_LABEL: &str = "otpgate/session-signing/v1";
const PEPPER_LABEL: &str = "otpgate/otp-pepper/v1";

#[derive(Debug)]
pub struct StartVerification<'a> {
    pub email: &'a str,
    pub case_id: &'a str,
    pub client_ip: Option<&'a str>,
}

#[derive(Debug)]
pub struct CompleteVerification<'a> {
    pub email: &'a str,
    pub case_id: &'a str,
    pub code: &'a str,
    pub token: Option<&'a str>,
    pub client_ip: Option<&'a str>,
}

/// A freshly issued session. `token` goes to the cookie, `code` to the mailer.
#[derive(Debug)]
pub struct IssuedCode {
    pub token: String,
    pub code: SecretString,
    pub ttl_seconds: i64,
}

#[derive(Debug)]
pub enum StartOutcome {
    Issued(IssuedCode),
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified(OtpSessionPayload),
    CodeMismatch,
    Denied,
    NoSession,
    MalformedInput,
}

pub struct VerificationService {
    config: VerificationConfig,
    limiter: Arc<dyn RateLimiter>,
    codec: Arc<OtpCodec>,
    signer: SessionSigner,
}

impl std::fmt::Debug for VerificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationService")
            .field("config", &self.config)
            .field("codec", &self.codec)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl VerificationService {
    #[must_use]
    pub fn new(
        config: VerificationConfig,
        limiter: Arc<dyn RateLimiter>,
        codec: OtpCodec,
        signer: SessionSigner,
    ) -> Self {
        Self {
            config,
            limiter,
            codec: Arc::new(codec),
            signer,
        }
    }

    /// Build the service from one process secret with the default hash cost.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or the secret is too short.
    pub fn from_secret(
        config: VerificationConfig,
        limiter: Arc<dyn RateLimiter>,
        secret: &SecretString,
    ) -> Result<Self> {
        Self::from_secret_with_params(config, limiter, secret, Params::default())
    }

    /// Build the service from one process secret and explicit Argon2id parameters.
    ///
    /// The signing key and the hash pepper are derived separately from `secret`.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or the secret is too short.
    pub fn from_secret_with_params(
        config: VerificationConfig,
        limiter: Arc<dyn RateLimiter>,
        secret: &SecretString,
        params: Params,
    ) -> Result<Self> {
        config.validate().context("invalid verification config")?;
        ensure!(
            secret.expose_secret().len() >= MIN_KEY_LENGTH,
            "session secret must be at least {MIN_KEY_LENGTH} bytes"
        );

        let signing_key = derive_key(secret, SESSION_KEY_LABEL)?;
        let pepper = derive_key(secret, PEPPER_LABEL)?;
        let signer = SessionSigner::new(&signing_key).context("invalid session signing key")?;
        let codec = OtpCodec::with_params(pepper, config.code_length(), params)?;

        Ok(Self::new(config, limiter, codec, signer))
    }

    #[must_use]
    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Issue a code and the session token carrying its digest.
    ///
    /// # Errors
    /// Returns an error if code generation, hashing or token signing fails.
    pub async fn start(&self, request: &StartVerification<'_>) -> Result<StartOutcome> {
        let email = normalize_email(request.email);
        let case_id = normalize_case_id(request.case_id);
        ensure!(
            !email.is_empty() && !case_id.is_empty(),
            "email and case id are required"
        );

        let key = rate_limit_key(RateLimitAction::SendCode, request.client_ip, &email);
        if self.limiter.check(&key, self.config.send_limit()) == RateLimitDecision::Limited {
            warn!(email = %email, case_id = %case_id, "OTP send rate limited");
            return Ok(StartOutcome::Denied);
        }

        let code = self.codec.generate()?;
        let hash = self.hash_code(code.clone()).await?;
        let ttl_seconds = self.config.session_ttl_seconds();
        let token = self
            .signer
            .issue(&email, case_id, &hash, ttl_seconds)
            .context("failed to issue OTP session token")?;

        info!(email = %email, case_id = %case_id, ttl_seconds, "issued OTP session");

        Ok(StartOutcome::Issued(IssuedCode {
            token,
            code: SecretString::from(code),
            ttl_seconds,
        }))
    }

    /// Check a submitted code against the session token from the cookie.
    ///
    /// # Errors
    /// Returns an error only if the hashing task cannot be joined.
    pub async fn complete(&self, request: &CompleteVerification<'_>) -> Result<VerifyOutcome> {
        let email = normalize_email(request.email);
        let case_id = normalize_case_id(request.case_id);

        let key = rate_limit_key(RateLimitAction::VerifyCode, request.client_ip, &email);
        if self.limiter.check(&key, self.config.verify_limit()) == RateLimitDecision::Limited {
            warn!(email = %email, case_id = %case_id, "OTP verify rate limited");
            return Ok(VerifyOutcome::Denied);
        }

        let key = case_verify_key(&email, case_id);
        if self.limiter.check(&key, self.config.case_verify_limit()) == RateLimitDecision::Limited
        {
            warn!(email = %email, case_id = %case_id, "OTP verify rate limited for case");
            return Ok(VerifyOutcome::Denied);
        }

        if !is_well_formed(request.code, self.codec.code_length()) {
            return Ok(VerifyOutcome::MalformedInput);
        }

        let Some(token) = request.token.filter(|token| !token.is_empty()) else {
            return Ok(VerifyOutcome::NoSession);
        };
        let Some(payload) = self.signer.verify(token) else {
            return Ok(VerifyOutcome::NoSession);
        };

        if payload.email != email || payload.case_id != case_id {
            // Same answer as a bad token: the cookie does not belong to this request.
            debug!(email = %email, case_id = %case_id, "OTP session does not match request");
            return Ok(VerifyOutcome::NoSession);
        }

        if self
            .verify_code(request.code.to_string(), payload.hash.clone())
            .await?
        {
            info!(email = %email, case_id = %case_id, "OTP verified");
            Ok(VerifyOutcome::Verified(payload))
        } else {
            debug!(email = %email, case_id = %case_id, "OTP mismatch");
            Ok(VerifyOutcome::CodeMismatch)
        }
    }

    // Argon2 is CPU bound; keep it off the async workers.
    async fn hash_code(&self, code: String) -> Result<String> {
        let codec = Arc::clone(&self.codec);
        tokio::task::spawn_blocking(move || codec.hash(&code))
            .await
            .context("OTP hashing task failed")?
    }

    async fn verify_code(&self, candidate: String, digest: String) -> Result<bool> {
        let codec = Arc::clone(&self.codec);
        tokio::task::spawn_blocking(move || codec.verify(&candidate, &digest))
            .await
            .context("OTP verification task failed")
    }
}
