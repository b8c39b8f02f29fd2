//! Map validated CLI arguments to the action the binary runs.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_PORT, otp, smtp};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let otp_opts = otp::Options::parse(matches)?;
    let smtp = smtp::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        session_secret: otp_opts.session_secret,
        frontend_base_url: otp_opts.frontend_base_url,
        otp_code_length: otp_opts.code_length,
        otp_ttl_seconds: otp_opts.ttl_seconds,
        otp_hash_memory_kib: otp_opts.hash_memory_kib,
        otp_hash_iterations: otp_opts.hash_iterations,
        send_window_seconds: otp_opts.send_window_seconds,
        send_max_requests: otp_opts.send_max_requests,
        verify_window_seconds: otp_opts.verify_window_seconds,
        verify_max_requests: otp_opts.verify_max_requests,
        case_verify_max_requests: otp_opts.case_verify_max_requests,
        trusted_proxies: otp_opts.trusted_proxies,
        rate_limit_max_keys: otp_opts.rate_limit_max_keys,
        expose_code: otp_opts.expose_code,
        allow_undelivered: otp_opts.allow_undelivered,
        smtp,
    }))
}
