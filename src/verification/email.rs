//! Outbound email boundary.
//!
//! The verification core never talks to a mail provider. The HTTP layer hands
//! an [`EmailMessage`] to an [`EmailSender`]; [`super::smtp::SmtpEmailSender`]
//! delivers it over SMTP. `LogEmailSender` stands in when SMTP is not
//! configured: it logs the recipient and template only, never the payload,
//! since it carries the code, and reports the message as not delivered.

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::warn;

pub const TEMPLATE_OTP_CODE: &str = "otp_code";
pub const TEMPLATE_WELCOME: &str = "verification_welcome";

pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: SecretString,
}

impl std::fmt::Debug for EmailMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailMessage")
            .field("to_email", &self.to_email)
            .field("template", &self.template)
            .field("payload_json", &"***")
            .finish()
    }
}

/// What happened to a message that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to a mail server.
    Sent,
    /// Nothing is configured to carry it; the recipient gets nothing.
    Skipped,
}

/// Email delivery abstraction.
///
/// Implementations may block; callers on the async runtime run them on the
/// blocking pool.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error so the caller can decide whether to fail.
    ///
    /// # Errors
    /// Returns an error when delivery fails.
    fn send(&self, message: &EmailMessage) -> Result<Delivery>;

    /// Whether `send` can reach a mailbox at all.
    fn delivers_mail(&self) -> bool {
        true
    }
}

/// Fallback sender used when SMTP is not configured. Logs metadata only.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<Delivery> {
        warn!(
            to_email = %message.to_email,
            template = %message.template,
            "SMTP not configured; email not delivered"
        );
        Ok(Delivery::Skipped)
    }

    fn delivers_mail(&self) -> bool {
        false
    }
}

/// Message carrying a one-time code for a case.
///
/// # Errors
/// Returns an error if the payload cannot be serialized.
pub fn otp_code_message(
    to_email: &str,
    case_id: &str,
    code: &SecretString,
    ttl_seconds: i64,
) -> Result<EmailMessage> {
    let payload = json!({
        "case_id": case_id,
        "code": code.expose_secret(),
        "expires_in_minutes": ttl_seconds.div_euclid(60).max(1),
    });
    Ok(EmailMessage {
        to_email: to_email.to_string(),
        template: TEMPLATE_OTP_CODE.to_string(),
        payload_json: SecretString::from(
            serde_json::to_string(&payload).context("failed to encode OTP email payload")?,
        ),
    })
}

/// Informational message sent once the email address is verified.
///
/// # Errors
/// Returns an error if the payload cannot be serialized.
pub fn welcome_message(to_email: &str, case_id: &str, dashboard_url: &str) -> Result<EmailMessage> {
    let payload = json!({
        "case_id": case_id,
        "dashboard_url": dashboard_url,
    });
    Ok(EmailMessage {
        to_email: to_email.to_string(),
        template: TEMPLATE_WELCOME.to_string(),
        payload_json: SecretString::from(
            serde_json::to_string(&payload).context("failed to encode welcome email payload")?,
        ),
    })
}
