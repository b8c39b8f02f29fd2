use anyhow::{Result, bail};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::verification::smtp::SmtpConfig;

pub const ARG_SMTP_HOST: &str = "smtp-host";
pub const ARG_SMTP_PORT: &str = "smtp-port";
pub const ARG_SMTP_USER: &str = "smtp-user";
pub const ARG_SMTP_PASS: &str = "smtp-pass";
pub const ARG_SMTP_FROM: &str = "smtp-from";

/// SMTP settings, all or nothing.
///
/// Returns `None` when no SMTP option is set, in which case emails are logged
/// and reported as not delivered.
///
/// # Errors
/// Returns an error naming the missing options when only some are set.
pub fn parse(matches: &ArgMatches) -> Result<Option<SmtpConfig>> {
    let value = |name: &str| {
        matches
            .get_one::<String>(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let host = value(ARG_SMTP_HOST);
    let port = matches.get_one::<u16>(ARG_SMTP_PORT).copied();
    let username = value(ARG_SMTP_USER);
    let password = value(ARG_SMTP_PASS);
    let from = value(ARG_SMTP_FROM);

    match (host, port, username, password, from) {
        (None, None, None, None, None) => Ok(None),
        (Some(host), Some(port), Some(username), Some(password), Some(from)) => {
            Ok(Some(SmtpConfig {
                host,
                port,
                username,
                password: SecretString::from(password),
                from,
            }))
        }
        (host, port, username, password, from) => {
            let missing = [
                (host.is_none(), ARG_SMTP_HOST),
                (port.is_none(), ARG_SMTP_PORT),
                (username.is_none(), ARG_SMTP_USER),
                (password.is_none(), ARG_SMTP_PASS),
                (from.is_none(), ARG_SMTP_FROM),
            ]
            .into_iter()
            .filter(|(absent, _)| *absent)
            .map(|(_, name)| format!("--{name}"))
            .collect::<Vec<_>>();
            bail!("incomplete SMTP configuration, missing: {}", missing.join(", "))
        }
    }
}

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SMTP_HOST)
                .long(ARG_SMTP_HOST)
                .help("SMTP relay host; without SMTP settings codes are not emailed")
                .env("OTPGATE_SMTP_HOST"),
        )
        .arg(
            Arg::new(ARG_SMTP_PORT)
                .long(ARG_SMTP_PORT)
                .help("SMTP port; 465 uses implicit TLS, others STARTTLS")
                .env("OTPGATE_SMTP_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_SMTP_USER)
                .long(ARG_SMTP_USER)
                .help("SMTP username")
                .env("OTPGATE_SMTP_USER"),
        )
        .arg(
            Arg::new(ARG_SMTP_PASS)
                .long(ARG_SMTP_PASS)
                .help("SMTP password")
                .env("OTPGATE_SMTP_PASS")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_SMTP_FROM)
                .long(ARG_SMTP_FROM)
                .help("Sender address, e.g. \"Otpgate <no-reply@otpgate.dev>\"")
                .env("OTPGATE_SMTP_FROM"),
        )
}
