//! Configuration types.
//!
//! Every config struct is built from environment variables through
//! `from_env()`. The `*_from` variants take a lookup function so the
//! parsing rules can be exercised without touching the process
//! environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Engine-wide policy shared by import and dispatch.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL used when rewriting in-app document links in outbound mail.
    pub application_url: String,
    /// Send with the caller's address as `From` instead of the transport identity.
    pub send_as_user: bool,
    /// Root folder under which per-user inboxes live.
    pub mail_root: String,
    /// Prefix of the `X-Message-Id` header.
    pub message_id_prefix: String,
    /// Value of the `X-Mailer` header.
    pub x_mailer: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            application_url: "http://localhost:8080/docmail/".to_string(),
            send_as_user: false,
            mail_root: "/mail".to_string(),
            message_id_prefix: "okm".to_string(),
            x_mailer: "OpenKM".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mail_root = lookup("DOCMAIL_MAIL_ROOT")
            .map(|root| root.trim_end_matches('/').to_string())
            .unwrap_or(defaults.mail_root);
        if !mail_root.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "DOCMAIL_MAIL_ROOT".into(),
                message: format!("must be an absolute path, got {mail_root:?}"),
            });
        }

        Ok(Self {
            application_url: lookup("DOCMAIL_APPLICATION_URL").unwrap_or(defaults.application_url),
            send_as_user: parse_var(&lookup, "DOCMAIL_SEND_AS_USER")?.unwrap_or(false),
            mail_root,
            message_id_prefix: lookup("DOCMAIL_MESSAGE_ID_PREFIX")
                .unwrap_or(defaults.message_id_prefix),
            x_mailer: lookup("DOCMAIL_X_MAILER").unwrap_or(defaults.x_mailer),
        })
    }

    /// Compatibility-mode inbox of a user: `<mail_root>/<user>/Inbox`.
    pub fn user_inbox(&self, user: &str) -> String {
        format!("{}/{}/Inbox", self.mail_root, user)
    }
}

/// Outbound SMTP settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Default identity used when mail is not sent as the user.
    pub from_address: String,
    pub starttls: bool,
}

impl SmtpConfig {
    /// Returns `None` if `DOCMAIL_SMTP_HOST` is not set (outbound mail disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        let Some(host) = lookup("DOCMAIL_SMTP_HOST") else {
            return Ok(None);
        };

        let username = lookup("DOCMAIL_SMTP_USERNAME").unwrap_or_default();
        let from_address = lookup("DOCMAIL_SMTP_FROM")
            .or_else(|| (!username.is_empty()).then(|| username.clone()))
            .ok_or_else(|| ConfigError::MissingEnvVar("DOCMAIL_SMTP_FROM".into()))?;

        Ok(Some(Self {
            host,
            port: parse_var(&lookup, "DOCMAIL_SMTP_PORT")?.unwrap_or(587),
            password: SecretString::from(lookup("DOCMAIL_SMTP_PASSWORD").unwrap_or_default()),
            username,
            from_address,
            starttls: parse_var(&lookup, "DOCMAIL_SMTP_STARTTLS")?.unwrap_or(true),
        }))
    }
}

/// Settings for the background import poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub db_path: PathBuf,
    pub repository_root: PathBuf,
    pub poll_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/docmail.db"),
            repository_root: PathBuf::from("./data/repository"),
            poll_interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl PollerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let secs: Option<u64> = parse_var(&lookup, "DOCMAIL_POLL_INTERVAL_SECS")?;
        if secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "DOCMAIL_POLL_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            db_path: lookup("DOCMAIL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            repository_root: lookup("DOCMAIL_REPOSITORY_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.repository_root),
            poll_interval: secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn engine_defaults() {
        let cfg = EngineConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(cfg.mail_root, "/mail");
        assert!(!cfg.send_as_user);
        assert_eq!(cfg.user_inbox("bob"), "/mail/bob/Inbox");
    }

    #[test]
    fn engine_trims_trailing_slash_on_root() {
        let cfg = EngineConfig::from_lookup(vars(&[
            ("DOCMAIL_MAIL_ROOT", "/archive/mail/"),
            ("DOCMAIL_SEND_AS_USER", "true"),
        ]))
        .unwrap();
        assert_eq!(cfg.user_inbox("ann"), "/archive/mail/ann/Inbox");
        assert!(cfg.send_as_user);
    }

    #[test]
    fn engine_rejects_relative_root() {
        let err = EngineConfig::from_lookup(vars(&[("DOCMAIL_MAIL_ROOT", "mail")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn engine_rejects_bad_bool() {
        let err =
            EngineConfig::from_lookup(vars(&[("DOCMAIL_SEND_AS_USER", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("DOCMAIL_SEND_AS_USER"));
    }

    #[test]
    fn smtp_disabled_without_host() {
        assert!(SmtpConfig::from_lookup(vars(&[])).unwrap().is_none());
    }

    #[test]
    fn smtp_from_falls_back_to_username() {
        let cfg = SmtpConfig::from_lookup(vars(&[
            ("DOCMAIL_SMTP_HOST", "smtp.example.com"),
            ("DOCMAIL_SMTP_USERNAME", "robot@example.com"),
            ("DOCMAIL_SMTP_PASSWORD", "hunter2"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(cfg.port, 587);
        assert_eq!(cfg.from_address, "robot@example.com");
        assert_eq!(cfg.password.expose_secret(), "hunter2");
        assert!(cfg.starttls);
    }

    #[test]
    fn smtp_requires_some_identity() {
        let err = SmtpConfig::from_lookup(vars(&[("DOCMAIL_SMTP_HOST", "smtp.example.com")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn poller_rejects_zero_interval() {
        let err = PollerConfig::from_lookup(vars(&[("DOCMAIL_POLL_INTERVAL_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn poller_reads_paths() {
        let cfg = PollerConfig::from_lookup(vars(&[
            ("DOCMAIL_DB_PATH", "/tmp/x.db"),
            ("DOCMAIL_POLL_INTERVAL_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
    }
}
