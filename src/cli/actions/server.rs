use crate::{
    cli::telemetry,
    otpgate::{self, ApiConfig, AppState},
    verification::{
        InMemoryRateLimiter, RateLimitPolicy, VerificationConfig, VerificationService,
        email::{EmailSender, LogEmailSender},
        rate_limit::spawn_sweeper,
        smtp::{SmtpConfig, SmtpEmailSender},
    },
};
use anyhow::{Context, Result, anyhow};
use argon2::Params;
use secrecy::SecretString;
use std::{net::IpAddr, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Args {
    pub port: u16,
    pub session_secret: SecretString,
    pub frontend_base_url: String,
    pub otp_code_length: usize,
    pub otp_ttl_seconds: i64,
    pub otp_hash_memory_kib: u32,
    pub otp_hash_iterations: u32,
    pub send_window_seconds: u64,
    pub send_max_requests: u32,
    pub verify_window_seconds: u64,
    pub verify_max_requests: u32,
    pub case_verify_max_requests: u32,
    pub trusted_proxies: Vec<IpAddr>,
    pub rate_limit_max_keys: usize,
    pub expose_code: bool,
    pub allow_undelivered: bool,
    pub smtp: Option<SmtpConfig>,
}

impl std::fmt::Debug for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Args")
            .field("port", &self.port)
            .field("session_secret", &"***")
            .field("frontend_base_url", &self.frontend_base_url)
            .field("otp_code_length", &self.otp_code_length)
            .field("otp_ttl_seconds", &self.otp_ttl_seconds)
            .field("otp_hash_memory_kib", &self.otp_hash_memory_kib)
            .field("otp_hash_iterations", &self.otp_hash_iterations)
            .field("send_window_seconds", &self.send_window_seconds)
            .field("send_max_requests", &self.send_max_requests)
            .field("verify_window_seconds", &self.verify_window_seconds)
            .field("verify_max_requests", &self.verify_max_requests)
            .field("case_verify_max_requests", &self.case_verify_max_requests)
            .field("trusted_proxies", &self.trusted_proxies)
            .field("rate_limit_max_keys", &self.rate_limit_max_keys)
            .field("expose_code", &self.expose_code)
            .field("allow_undelivered", &self.allow_undelivered)
            .field("smtp", &self.smtp)
            .finish()
    }
}

impl Args {
    fn verification_config(&self) -> VerificationConfig {
        VerificationConfig::new()
            .with_code_length(self.otp_code_length)
            .with_session_ttl_seconds(self.otp_ttl_seconds)
            .with_send_limit(RateLimitPolicy::new(
                Duration::from_secs(self.send_window_seconds),
                self.send_max_requests,
            ))
            .with_verify_limit(RateLimitPolicy::new(
                Duration::from_secs(self.verify_window_seconds),
                self.verify_max_requests,
            ))
            .with_case_verify_limit(RateLimitPolicy::new(
                Duration::from_secs(self.verify_window_seconds),
                self.case_verify_max_requests,
            ))
    }

    fn hash_params(&self) -> Result<Params> {
        Params::new(self.otp_hash_memory_kib, self.otp_hash_iterations, 1, None)
            .map_err(|err| anyhow!("invalid Argon2 parameters: {err}"))
    }

    fn api_config(&self) -> ApiConfig {
        ApiConfig::new(self.frontend_base_url.clone())
            .with_expose_code(self.expose_code)
            .with_require_email_delivery(!self.allow_undelivered)
            .with_trusted_proxies(self.trusted_proxies.clone())
    }

    fn email_sender(&self) -> Result<Arc<dyn EmailSender>> {
        match &self.smtp {
            Some(smtp) => {
                info!(host = %smtp.host, port = smtp.port, "delivering email over SMTP");
                let sender = SmtpEmailSender::new(smtp).context("Failed to build SMTP sender")?;
                Ok(Arc::new(sender))
            }
            None => {
                warn!("SMTP not configured; OTP emails are not delivered");
                Ok(Arc::new(LogEmailSender))
            }
        }
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is invalid or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    debug!("Server args: {:?}", args);

    let limiter = Arc::new(InMemoryRateLimiter::with_max_keys(args.rate_limit_max_keys));
    let service = VerificationService::from_secret_with_params(
        args.verification_config(),
        limiter.clone(),
        &args.session_secret,
        args.hash_params()?,
    )
    .context("Failed to build verification service")?;

    if args.expose_code {
        warn!("OTP codes are returned in API responses; never enable this in production");
    }

    if args.trusted_proxies.is_empty() {
        debug!("no trusted proxies; rate limits key on the socket peer address");
    }

    let state = Arc::new(AppState::new(
        args.api_config(),
        service,
        args.email_sender()?,
    ));

    let sweeper = spawn_sweeper(limiter, SWEEP_INTERVAL);
    let result = otpgate::new(args.port, state).await;

    sweeper.abort();
    telemetry::shutdown_tracer();

    result
}
