//! Configuration module for environment variable parsing.
//!
//! Broker settings are forgiving: anything missing or unparsable falls back to
//! the local RabbitMQ defaults. SMTP settings are required and fail fast.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use lapin::uri::AMQPUri;
use tracing::warn;

use crate::error::ConfigError;
use crate::processor::DeliveryPolicy;
use crate::queue::EMAIL_QUEUE;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// RabbitMQ connection settings
    pub broker: BrokerConfig,

    /// SMTP relay settings
    pub smtp: SmtpConfig,

    /// Port for the web server to listen on
    pub port: u16,

    /// Queue that requests are published to and consumed from
    pub queue_name: String,

    /// Maximum number of unacknowledged deliveries held by the consumer
    pub prefetch_count: u16,

    /// First delay before the consumer reconnects after losing the broker
    pub reconnect_delay: Duration,

    /// Upper bound for the consumer reconnect delay
    pub reconnect_max_delay: Duration,

    /// What to do with a message whose SMTP delivery failed
    pub delivery_policy: DeliveryPolicy,
}

/// RabbitMQ connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub vhost: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            pass: "guest".to_string(),
            vhost: "/".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Read broker settings, falling back to defaults for anything missing.
    ///
    /// A port that does not parse is silently replaced by the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            host: read("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: read("RABBITMQ_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            user: read("RABBITMQ_USER").unwrap_or(defaults.user),
            pass: read("RABBITMQ_PASS").unwrap_or(defaults.pass),
            vhost: read("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
        }
    }

    /// Build the AMQP URI used to open a connection.
    pub fn uri(&self) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = self.host.clone();
        uri.authority.port = self.port;
        uri.authority.userinfo.username = self.user.clone();
        uri.authority.userinfo.password = self.pass.clone();
        uri.vhost = self.vhost.clone();
        uri
    }
}

/// SMTP relay settings.
#[derive(Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub from_name: String,
    pub from_email: String,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("from_name", &self.from_name)
            .field("from_email", &self.from_email)
            .finish()
    }
}

impl SmtpConfig {
    /// Read SMTP settings. Every setting except the port is required.
    ///
    /// Each key is looked up as `EMAIL_HOST` first, then as `Email:Host`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str, alias: &str| {
            lookup(key)
                .or_else(|| lookup(alias))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str, alias: &str| {
            read(key, alias).ok_or_else(|| ConfigError::Missing(key.to_string()))
        };

        let port = match read("EMAIL_PORT", "Email:Port") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "EMAIL_PORT".to_string(),
                value: raw,
            })?,
            None => 587,
        };

        let pass = normalize_secret(&require("EMAIL_PASS", "Email:Pass")?);
        if pass.is_empty() {
            return Err(ConfigError::Missing("EMAIL_PASS".to_string()));
        }

        Ok(Self {
            host: require("EMAIL_HOST", "Email:Host")?,
            port,
            user: require("EMAIL_USER", "Email:User")?,
            pass,
            from_name: require("EMAIL_FROM_NAME", "Email:FromName")?,
            from_email: require("EMAIL_FROM_EMAIL", "Email:FromEmail")?,
        })
    }
}

/// Normalize a pasted credential.
///
/// Trims the value, strips one pair of matching surrounding quotes, then
/// removes all remaining whitespace. App passwords are usually shown as
/// space-separated groups ("abcd efgh ijkl mnop") and pasted that way.
pub fn normalize_secret(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|q| {
            trimmed
                .strip_prefix(*q)
                .and_then(|rest| rest.strip_suffix(*q))
        })
        .unwrap_or(trimmed);

    unquoted.chars().filter(|c| !c.is_whitespace()).collect()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Config {
            broker: BrokerConfig::from_lookup(&lookup),
            smtp: SmtpConfig::from_lookup(&lookup)?,
            port: parse_or(&lookup, "PORT", 8080),
            queue_name: lookup("QUEUE_NAME")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| EMAIL_QUEUE.to_string()),
            prefetch_count: parse_nonzero_or(&lookup, "PREFETCH_COUNT", 5),
            reconnect_delay: Duration::from_millis(parse_nonzero_or(
                &lookup,
                "CONSUMER_RECONNECT_DELAY_MS",
                1000,
            )),
            reconnect_max_delay: Duration::from_millis(parse_nonzero_or(
                &lookup,
                "CONSUMER_RECONNECT_MAX_DELAY_MS",
                30_000,
            )),
            delivery_policy: match lookup("FAILED_DELIVERY_POLICY") {
                Some(raw) => raw.parse().unwrap_or_else(|_| {
                    warn!(
                        env_var = "FAILED_DELIVERY_POLICY",
                        value = %raw,
                        "Invalid policy, using default"
                    );
                    DeliveryPolicy::default()
                }),
                None => DeliveryPolicy::default(),
            },
        })
    }
}

/// Parse a setting, warning and falling back to the default when invalid.
fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = match lookup(name) {
        Some(v) => v,
        None => return default,
    };

    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

/// Like `parse_or`, but zero also counts as invalid.
fn parse_nonzero_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Default + PartialEq + Copy,
{
    let value = parse_or(lookup, name, default);
    if value == T::default() {
        warn!(env_var = name, "Zero is not allowed, using default");
        return default;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const SMTP: &[(&str, &str)] = &[
        ("EMAIL_HOST", "smtp.example.com"),
        ("EMAIL_USER", "mailer@example.com"),
        ("EMAIL_PASS", "secret"),
        ("EMAIL_FROM_NAME", "Example"),
        ("EMAIL_FROM_EMAIL", "noreply@example.com"),
    ];

    #[test]
    fn test_broker_reads_settings() {
        let broker = BrokerConfig::from_lookup(source(&[
            ("RABBITMQ_HOST", "rabbitmq.local"),
            ("RABBITMQ_PORT", "5679"),
            ("RABBITMQ_USER", "app-user"),
            ("RABBITMQ_PASS", "app-pass"),
        ]));

        assert_eq!(broker.host, "rabbitmq.local");
        assert_eq!(broker.port, 5679);
        assert_eq!(broker.user, "app-user");
        assert_eq!(broker.pass, "app-pass");
    }

    #[test]
    fn test_broker_defaults_when_missing_or_invalid() {
        let broker = BrokerConfig::from_lookup(source(&[("RABBITMQ_PORT", "invalid")]));
        assert_eq!(broker, BrokerConfig::default());
        assert_eq!(broker.host, "localhost");
        assert_eq!(broker.port, 5672);
        assert_eq!(broker.user, "guest");
        assert_eq!(broker.pass, "guest");
    }

    #[test]
    fn test_broker_uri() {
        let broker = BrokerConfig::from_lookup(source(&[
            ("RABBITMQ_HOST", "mq"),
            ("RABBITMQ_USER", "u"),
            ("RABBITMQ_PASS", "p@ss"),
        ]));
        let uri = broker.uri();
        assert_eq!(uri.authority.host, "mq");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.password, "p@ss");
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn test_smtp_requires_all_settings() {
        let mut pairs = SMTP.to_vec();
        pairs.retain(|(k, _)| *k != "EMAIL_FROM_EMAIL");
        let err = SmtpConfig::from_lookup(source(&pairs)).unwrap_err();
        assert_eq!(err, ConfigError::Missing("EMAIL_FROM_EMAIL".to_string()));
    }

    #[test]
    fn test_smtp_accepts_colon_keys() {
        let smtp = SmtpConfig::from_lookup(source(&[
            ("Email:Host", "smtp.example.com"),
            ("Email:Port", "2525"),
            ("Email:User", "user"),
            ("Email:Pass", "pass"),
            ("Email:FromName", "Example"),
            ("Email:FromEmail", "noreply@example.com"),
        ]))
        .unwrap();
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.port, 2525);
    }

    #[test]
    fn test_smtp_port_defaults_but_rejects_garbage() {
        let smtp = SmtpConfig::from_lookup(source(SMTP)).unwrap();
        assert_eq!(smtp.port, 587);

        let mut pairs = SMTP.to_vec();
        pairs.push(("EMAIL_PORT", "smtp"));
        let err = SmtpConfig::from_lookup(source(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "EMAIL_PORT"));
    }

    #[test]
    fn test_smtp_password_is_normalized() {
        let mut pairs = SMTP.to_vec();
        pairs.retain(|(k, _)| *k != "EMAIL_PASS");
        pairs.push(("EMAIL_PASS", " \"abcd efgh ijkl mnop\" "));
        let smtp = SmtpConfig::from_lookup(source(&pairs)).unwrap();
        assert_eq!(smtp.pass, "abcdefghijklmnop");
        assert!(!format!("{:?}", smtp).contains("abcd"));
    }

    #[test]
    fn test_normalize_secret() {
        assert_eq!(normalize_secret("plain"), "plain");
        assert_eq!(normalize_secret("'quoted value'"), "quotedvalue");
        assert_eq!(normalize_secret("\"mismatched'"), "\"mismatched'");
        assert_eq!(normalize_secret("  \t\"\"  "), "");
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(source(SMTP)).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.queue_name, "email-sender");
        assert_eq!(config.prefetch_count, 5);
        assert_eq!(config.reconnect_delay, Duration::from_millis(1000));
        assert_eq!(config.delivery_policy, DeliveryPolicy::Drop);
    }

    #[test]
    fn test_config_overrides() {
        let mut pairs = SMTP.to_vec();
        pairs.extend([
            ("PORT", "9000"),
            ("QUEUE_NAME", "mail"),
            ("PREFETCH_COUNT", "70000"),
            ("FAILED_DELIVERY_POLICY", "requeue"),
        ]);
        let config = Config::from_lookup(source(&pairs)).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.queue_name, "mail");
        assert_eq!(config.prefetch_count, 5);
        assert_eq!(config.delivery_policy, DeliveryPolicy::Requeue);
    }

    #[test]
    fn test_config_rejects_zero_prefetch_and_delays() {
        let mut pairs = SMTP.to_vec();
        pairs.extend([
            ("PREFETCH_COUNT", "0"),
            ("CONSUMER_RECONNECT_DELAY_MS", "0"),
            ("CONSUMER_RECONNECT_MAX_DELAY_MS", " 0 "),
        ]);
        let config = Config::from_lookup(source(&pairs)).unwrap();
        assert_eq!(config.prefetch_count, 5);
        assert_eq!(config.reconnect_delay, Duration::from_millis(1000));
        assert_eq!(config.reconnect_max_delay, Duration::from_millis(30_000));
    }
}
