//! Shared HTTP state: the verification service plus adapter-only settings.

use std::{net::IpAddr, sync::Arc};

use crate::verification::{VerificationService, email::EmailSender};

#[derive(Clone, Debug)]
pub struct ApiConfig {
    frontend_base_url: String,
    expose_code: bool,
    require_email_delivery: bool,
    trusted_proxies: Vec<IpAddr>,
}

impl ApiConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url,
            expose_code: false,
            require_email_delivery: true,
            trusted_proxies: Vec::new(),
        }
    }

    /// Echo the code in the send response. Development only.
    #[must_use]
    pub fn with_expose_code(mut self, expose: bool) -> Self {
        self.expose_code = expose;
        self
    }

    /// Fail the send request when the code email cannot be delivered.
    #[must_use]
    pub fn with_require_email_delivery(mut self, require: bool) -> Self {
        self.require_email_delivery = require;
        self
    }

    /// Peers whose `x-forwarded-for`/`x-real-ip` headers are believed.
    #[must_use]
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies.into_iter().map(|ip| ip.to_canonical()).collect();
        self
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn expose_code(&self) -> bool {
        self.expose_code
    }

    #[must_use]
    pub fn require_email_delivery(&self) -> bool {
        self.require_email_delivery
    }

    #[must_use]
    pub fn trusted_proxies(&self) -> &[IpAddr] {
        &self.trusted_proxies
    }

    pub(crate) fn dashboard_url(&self) -> String {
        let base = self.frontend_base_url.trim_end_matches('/');
        format!("{base}/dashboard")
    }
}

pub struct AppState {
    config: ApiConfig,
    service: VerificationService,
    email_sender: Arc<dyn EmailSender>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: ApiConfig,
        service: VerificationService,
        email_sender: Arc<dyn EmailSender>,
    ) -> Self {
        Self {
            config,
            service,
            email_sender,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    #[must_use]
    pub fn service(&self) -> &VerificationService {
        &self.service
    }

    pub(crate) fn email_sender(&self) -> Arc<dyn EmailSender> {
        Arc::clone(&self.email_sender)
    }

    /// Whether outbound email reaches a real mailbox.
    #[must_use]
    pub fn delivers_mail(&self) -> bool {
        self.email_sender.delivers_mail()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::ApiConfig;

    #[test]
    fn api_config_defaults_and_overrides() {
        let config = ApiConfig::new("https://otpgate.dev/".to_string());
        assert_eq!(config.frontend_base_url(), "https://otpgate.dev/");
        assert!(!config.expose_code());
        assert!(config.require_email_delivery());
        assert!(config.trusted_proxies().is_empty());
        assert_eq!(config.dashboard_url(), "https://otpgate.dev/dashboard");

        let config = config
            .with_expose_code(true)
            .with_require_email_delivery(false)
            .with_trusted_proxies(vec!["::ffff:10.0.0.1".parse().unwrap()]);
        assert!(config.expose_code());
        assert!(!config.require_email_delivery());
        assert_eq!(
            config.trusted_proxies(),
            &["10.0.0.1".parse::<std::net::IpAddr>().unwrap()]
        );
    }
}
