//! SMTP delivery for [`EmailMessage`]s.
//!
//! Templates are plain text with `{{key}}` placeholders filled from the
//! message's JSON payload. Port 465 uses implicit TLS, every other port
//! upgrades with STARTTLS.

use anyhow::{Context, Result, anyhow};
use lettre::{
    Message, SmtpTransport, Transport,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use super::email::{Delivery, EmailMessage, EmailSender, TEMPLATE_OTP_CODE, TEMPLATE_WELCOME};

const IMPLICIT_TLS_PORT: u16 = 465;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const OTP_CODE_SUBJECT: &str = "Your verification code";
const OTP_CODE_BODY: &str = "Your verification code for case {{case_id}} is {{code}}.

It expires in {{expires_in_minutes}} minutes. If you did not ask for it, ignore this email.
";

const WELCOME_SUBJECT: &str = "Email verified";
const WELCOME_BODY: &str = "Your email address is verified for case {{case_id}}.

Continue at {{dashboard_url}}
";

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from: String,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("from", &self.from)
            .finish()
    }
}

pub struct SmtpEmailSender {
    mailer: SmtpTransport,
    from: Mailbox,
}

impl SmtpEmailSender {
    /// Build the transport. No connection is made until the first send.
    ///
    /// # Errors
    /// Returns an error if the sender address or relay host is invalid.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .with_context(|| format!("invalid SMTP from address: {}", config.from))?;

        let builder = if config.port == IMPLICIT_TLS_PORT {
            SmtpTransport::relay(&config.host)
        } else {
            SmtpTransport::starttls_relay(&config.host)
        }
        .with_context(|| format!("invalid SMTP host: {}", config.host))?;

        let credentials = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let mailer = builder
            .port(config.port)
            .credentials(credentials)
            .timeout(Some(SEND_TIMEOUT))
            .build();

        Ok(Self { mailer, from })
    }
}

impl EmailSender for SmtpEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<Delivery> {
        let (subject, body) = render(message)?;
        let to: Mailbox = message
            .to_email
            .parse()
            .with_context(|| format!("invalid recipient address: {}", message.to_email))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .context("failed to build email")?;

        self.mailer.send(&email).context("SMTP delivery failed")?;

        info!(
            to_email = %message.to_email,
            template = %message.template,
            "email sent"
        );
        Ok(Delivery::Sent)
    }
}

/// Subject and body for a message, placeholders filled from its payload.
fn render(message: &EmailMessage) -> Result<(&'static str, String)> {
    let (subject, mut body) = match message.template.as_str() {
        TEMPLATE_OTP_CODE => (OTP_CODE_SUBJECT, OTP_CODE_BODY.to_string()),
        TEMPLATE_WELCOME => (WELCOME_SUBJECT, WELCOME_BODY.to_string()),
        other => return Err(anyhow!("unknown email template: {other}")),
    };

    let payload: Value = serde_json::from_str(message.payload_json.expose_secret())
        .context("failed to decode email payload")?;
    let Some(fields) = payload.as_object() else {
        return Err(anyhow!("email payload must be a JSON object"));
    };

    for (key, value) in fields {
        let placeholder = format!("{{{{{key}}}}}");
        let value = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        body = body.replace(&placeholder, &value);
    }

    Ok((subject, body))
}
