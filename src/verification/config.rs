use anyhow::{Result, ensure};
use std::time::Duration;

use super::otp::{DEFAULT_CODE_LENGTH, MAX_CODE_LENGTH};
use super::rate_limit::RateLimitPolicy;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_LIMIT_WINDOW: Duration = Duration::from_secs(10 * 60);
const DEFAULT_SEND_MAX_REQUESTS: u32 = 5;
const DEFAULT_VERIFY_MAX_REQUESTS: u32 = 10;
const DEFAULT_CASE_VERIFY_MAX_REQUESTS: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationConfig {
    code_length: usize,
    session_ttl_seconds: i64,
    send_limit: RateLimitPolicy,
    verify_limit: RateLimitPolicy,
    case_verify_limit: RateLimitPolicy,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl VerificationConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            code_length: DEFAULT_CODE_LENGTH,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            send_limit: RateLimitPolicy::new(DEFAULT_LIMIT_WINDOW, DEFAULT_SEND_MAX_REQUESTS),
            verify_limit: RateLimitPolicy::new(DEFAULT_LIMIT_WINDOW, DEFAULT_VERIFY_MAX_REQUESTS),
            case_verify_limit: RateLimitPolicy::new(
                DEFAULT_LIMIT_WINDOW,
                DEFAULT_CASE_VERIFY_MAX_REQUESTS,
            ),
        }
    }

    #[must_use]
    pub fn with_code_length(mut self, length: usize) -> Self {
        self.code_length = length;
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_send_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.send_limit = policy;
        self
    }

    #[must_use]
    pub fn with_verify_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.verify_limit = policy;
        self
    }

    /// Budget shared by every client verifying the same `{email, caseId}`.
    #[must_use]
    pub fn with_case_verify_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.case_verify_limit = policy;
        self
    }

    #[must_use]
    pub fn code_length(&self) -> usize {
        self.code_length
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn send_limit(&self) -> RateLimitPolicy {
        self.send_limit
    }

    #[must_use]
    pub fn verify_limit(&self) -> RateLimitPolicy {
        self.verify_limit
    }

    #[must_use]
    pub fn case_verify_limit(&self) -> RateLimitPolicy {
        self.case_verify_limit
    }

    /// # Errors
    /// Returns an error describing the first out-of-range setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_CODE_LENGTH).contains(&self.code_length),
            "code length must be between 1 and {MAX_CODE_LENGTH}"
        );
        ensure!(
            self.session_ttl_seconds > 0,
            "session ttl must be positive"
        );
        for (name, policy) in [
            ("send", self.send_limit),
            ("verify", self.verify_limit),
            ("case verify", self.case_verify_limit),
        ] {
            ensure!(!policy.window.is_zero(), "{name} window must be positive");
            ensure!(
                policy.max_requests > 0,
                "{name} max requests must be positive"
            );
        }
        Ok(())
    }
}
