//! Blocking SMTP transport.

use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use super::MailTransport;
use crate::config::SmtpConfig;
use crate::error::TransportError;

/// Relays through the configured SMTP server.
pub struct SmtpMailTransport {
    transport: SmtpTransport,
    from_address: String,
}

impl SmtpMailTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self, TransportError> {
        let builder = if config.starttls {
            SmtpTransport::starttls_relay(&config.host)
        } else {
            SmtpTransport::relay(&config.host)
        }
        .map_err(|e| TransportError::Relay(e.to_string()))?
        .port(config.port);

        let builder = if config.username.is_empty() {
            builder
        } else {
            builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ))
        };

        tracing::info!(host = %config.host, port = config.port, "SMTP transport ready");
        Ok(Self {
            transport: builder.build(),
            from_address: config.from_address.clone(),
        })
    }
}

impl MailTransport for SmtpMailTransport {
    fn send(&self, message: &Message) -> Result<(), TransportError> {
        self.transport
            .send(message)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        tracing::debug!(recipients = message.envelope().to().len(), "SMTP send accepted");
        Ok(())
    }

    fn default_from(&self) -> Option<String> {
        Some(self.from_address.clone())
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn config(starttls: bool) -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".into(),
            port: 2525,
            username: String::new(),
            password: SecretString::from(""),
            from_address: "robot@example.com".into(),
            starttls,
        }
    }

    #[test]
    fn builds_without_connecting() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        for starttls in [true, false] {
            let transport = SmtpMailTransport::new(&config(starttls)).unwrap();
            assert_eq!(transport.default_from().as_deref(), Some("robot@example.com"));
        }
    }
}
