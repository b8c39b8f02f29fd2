use anyhow::{Context, Result, ensure};
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::{ExposeSecret, SecretString};
use std::net::IpAddr;

use crate::verification::session::MIN_KEY_LENGTH;

pub const ARG_SESSION_SECRET: &str = "session-secret";
pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";
pub const ARG_CODE_LENGTH: &str = "otp-code-length";
pub const ARG_TTL_SECONDS: &str = "otp-ttl-seconds";
pub const ARG_HASH_MEMORY_KIB: &str = "otp-hash-memory-kib";
pub const ARG_HASH_ITERATIONS: &str = "otp-hash-iterations";
pub const ARG_SEND_WINDOW_SECONDS: &str = "send-window-seconds";
pub const ARG_SEND_MAX_REQUESTS: &str = "send-max-requests";
pub const ARG_VERIFY_WINDOW_SECONDS: &str = "verify-window-seconds";
pub const ARG_VERIFY_MAX_REQUESTS: &str = "verify-max-requests";
pub const ARG_CASE_VERIFY_MAX_REQUESTS: &str = "case-verify-max-requests";
pub const ARG_TRUSTED_PROXY: &str = "trusted-proxy";
pub const ARG_RATE_LIMIT_MAX_KEYS: &str = "rate-limit-max-keys";
pub const ARG_EXPOSE_CODE: &str = "expose-code";
pub const ARG_ALLOW_UNDELIVERED: &str = "allow-undelivered";

pub struct Options {
    pub session_secret: SecretString,
    pub frontend_base_url: String,
    pub code_length: usize,
    pub ttl_seconds: i64,
    pub hash_memory_kib: u32,
    pub hash_iterations: u32,
    pub send_window_seconds: u64,
    pub send_max_requests: u32,
    pub verify_window_seconds: u64,
    pub verify_max_requests: u32,
    pub case_verify_max_requests: u32,
    pub trusted_proxies: Vec<IpAddr>,
    pub rate_limit_max_keys: usize,
    pub expose_code: bool,
    pub allow_undelivered: bool,
}

impl Options {
    /// Parse OTP and rate-limit options from CLI matches.
    ///
    /// # Errors
    /// Returns an error if the session secret is missing or too short.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let session_secret = matches
            .get_one::<String>(ARG_SESSION_SECRET)
            .cloned()
            .map(SecretString::from)
            .context("missing required argument: --session-secret")?;
        ensure!(
            session_secret.expose_secret().len() >= MIN_KEY_LENGTH,
            "--{ARG_SESSION_SECRET} must be at least {MIN_KEY_LENGTH} bytes"
        );

        Ok(Self {
            session_secret,
            frontend_base_url: matches
                .get_one::<String>(ARG_FRONTEND_BASE_URL)
                .cloned()
                .unwrap_or_else(|| "https://otpgate.dev".to_string()),
            code_length: matches
                .get_one::<usize>(ARG_CODE_LENGTH)
                .copied()
                .unwrap_or(6),
            ttl_seconds: matches
                .get_one::<i64>(ARG_TTL_SECONDS)
                .copied()
                .unwrap_or(600),
            hash_memory_kib: matches
                .get_one::<u32>(ARG_HASH_MEMORY_KIB)
                .copied()
                .unwrap_or(argon2::Params::DEFAULT_M_COST),
            hash_iterations: matches
                .get_one::<u32>(ARG_HASH_ITERATIONS)
                .copied()
                .unwrap_or(argon2::Params::DEFAULT_T_COST),
            send_window_seconds: matches
                .get_one::<u64>(ARG_SEND_WINDOW_SECONDS)
                .copied()
                .unwrap_or(600),
            send_max_requests: matches
                .get_one::<u32>(ARG_SEND_MAX_REQUESTS)
                .copied()
                .unwrap_or(5),
            verify_window_seconds: matches
                .get_one::<u64>(ARG_VERIFY_WINDOW_SECONDS)
                .copied()
                .unwrap_or(600),
            verify_max_requests: matches
                .get_one::<u32>(ARG_VERIFY_MAX_REQUESTS)
                .copied()
                .unwrap_or(10),
            case_verify_max_requests: matches
                .get_one::<u32>(ARG_CASE_VERIFY_MAX_REQUESTS)
                .copied()
                .unwrap_or(10),
            trusted_proxies: matches
                .get_many::<IpAddr>(ARG_TRUSTED_PROXY)
                .map(|proxies| proxies.copied().collect())
                .unwrap_or_default(),
            rate_limit_max_keys: matches
                .get_one::<usize>(ARG_RATE_LIMIT_MAX_KEYS)
                .copied()
                .unwrap_or(100_000),
            expose_code: matches.get_flag(ARG_EXPOSE_CODE),
            allow_undelivered: matches.get_flag(ARG_ALLOW_UNDELIVERED),
        })
    }
}

pub fn with_args(command: Command) -> Command {
    let command = with_code_args(command);
    let command = with_rate_limit_args(command);
    with_delivery_args(command)
}

fn with_code_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_SECRET)
                .long(ARG_SESSION_SECRET)
                .help("Secret used to derive the session signing key and OTP pepper")
                .long_help(
                    "Secret used to derive the session signing key and OTP pepper. Must be at least 32 bytes; rotating it invalidates every outstanding OTP session.",
                )
                .env("OTPGATE_SESSION_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_CODE_LENGTH)
                .long(ARG_CODE_LENGTH)
                .help("Number of digits in each one-time code")
                .env("OTPGATE_OTP_CODE_LENGTH")
                .default_value("6")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_TTL_SECONDS)
                .long(ARG_TTL_SECONDS)
                .help("OTP session lifetime in seconds")
                .env("OTPGATE_OTP_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_HASH_MEMORY_KIB)
                .long(ARG_HASH_MEMORY_KIB)
                .help("Argon2id memory cost in KiB for OTP digests")
                .env("OTPGATE_OTP_HASH_MEMORY_KIB")
                .default_value("19456")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_HASH_ITERATIONS)
                .long(ARG_HASH_ITERATIONS)
                .help("Argon2id iterations for OTP digests")
                .env("OTPGATE_OTP_HASH_ITERATIONS")
                .default_value("2")
                .value_parser(clap::value_parser!(u32)),
        )
}

fn with_rate_limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SEND_WINDOW_SECONDS)
                .long(ARG_SEND_WINDOW_SECONDS)
                .help("Send rate-limit window in seconds")
                .env("OTPGATE_SEND_WINDOW_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SEND_MAX_REQUESTS)
                .long(ARG_SEND_MAX_REQUESTS)
                .help("Send requests allowed per window per client and email")
                .env("OTPGATE_SEND_MAX_REQUESTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_VERIFY_WINDOW_SECONDS)
                .long(ARG_VERIFY_WINDOW_SECONDS)
                .help("Verify rate-limit window in seconds")
                .env("OTPGATE_VERIFY_WINDOW_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_VERIFY_MAX_REQUESTS)
                .long(ARG_VERIFY_MAX_REQUESTS)
                .help("Verify attempts allowed per window per client and email")
                .env("OTPGATE_VERIFY_MAX_REQUESTS")
                .default_value("10")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_CASE_VERIFY_MAX_REQUESTS)
                .long(ARG_CASE_VERIFY_MAX_REQUESTS)
                .help("Verify attempts allowed per window per email and caseId, across clients")
                .env("OTPGATE_CASE_VERIFY_MAX_REQUESTS")
                .default_value("10")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_TRUSTED_PROXY)
                .long(ARG_TRUSTED_PROXY)
                .help("Proxy address whose X-Forwarded-For/X-Real-IP headers are trusted")
                .long_help(
                    "Address of a reverse proxy in front of the server. Client addresses are read from X-Forwarded-For/X-Real-IP only when the connection comes from one of these; otherwise the socket peer address is used. Repeat the flag or separate values with commas.",
                )
                .env("OTPGATE_TRUSTED_PROXY")
                .action(ArgAction::Append)
                .value_delimiter(',')
                .value_parser(clap::value_parser!(IpAddr)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_MAX_KEYS)
                .long(ARG_RATE_LIMIT_MAX_KEYS)
                .help("Maximum rate-limit keys tracked in memory")
                .env("OTPGATE_RATE_LIMIT_MAX_KEYS")
                .default_value("100000")
                .value_parser(clap::value_parser!(usize)),
        )
}

fn with_delivery_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL for CORS and dashboard links")
                .env("OTPGATE_FRONTEND_BASE_URL")
                .default_value("https://otpgate.dev"),
        )
        .arg(
            Arg::new(ARG_EXPOSE_CODE)
                .long(ARG_EXPOSE_CODE)
                .help("Return the code in send responses (development only)")
                .env("OTPGATE_EXPOSE_CODE")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_ALLOW_UNDELIVERED)
                .long(ARG_ALLOW_UNDELIVERED)
                .help("Keep the session when the code email cannot be delivered")
                .env("OTPGATE_ALLOW_UNDELIVERED")
                .action(ArgAction::SetTrue),
        )
}
