//! Server configuration.
//!
//! Loaded from a TOML file with environment variable overrides. Recognized
//! keys:
//!
//! ```toml
//! server-domain = "vysper.org"
//!
//! [tls]
//! certificate-file = "/etc/gannet/cert.pem"
//! key-file = "/etc/gannet/key.pem"
//! required = true
//!
//! [sasl]
//! mechanisms = ["PLAIN", "DIGEST-MD5", "SCRAM-SHA-1"]
//!
//! [bosh]
//! wait-max = 60
//! hold = 1
//! polling = 15
//! inactivity = 60
//!
//! [s2s]
//! enabled = true
//! # secret = "..."   # auto-generated each start when absent
//! ```
//!
//! # Environment Variables
//!
//! - `GANNET_DOMAIN`: overrides `server-domain`
//! - `GANNET_C2S_LISTEN`, `GANNET_S2S_LISTEN`, `GANNET_BOSH_LISTEN`:
//!   override the listener addresses

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required key is missing or invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A SASL mechanism the server may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SaslMechanismKind {
    /// RFC 4616 PLAIN; only offered over TLS.
    #[serde(rename = "PLAIN")]
    Plain,
    /// RFC 2831 DIGEST-MD5.
    #[serde(rename = "DIGEST-MD5")]
    DigestMd5,
    /// RFC 5802 SCRAM-SHA-1.
    #[serde(rename = "SCRAM-SHA-1")]
    ScramSha1,
}

impl SaslMechanismKind {
    /// The mechanism name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanismKind::Plain => "PLAIN",
            SaslMechanismKind::DigestMd5 => "DIGEST-MD5",
            SaslMechanismKind::ScramSha1 => "SCRAM-SHA-1",
        }
    }

    /// Parse a mechanism name.
    pub fn from_str(s: &str) -> Option<SaslMechanismKind> {
        match s {
            "PLAIN" => Some(SaslMechanismKind::Plain),
            "DIGEST-MD5" => Some(SaslMechanismKind::DigestMd5),
            "SCRAM-SHA-1" => Some(SaslMechanismKind::ScramSha1),
            _ => None,
        }
    }
}

/// TLS settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub certificate_file: Option<PathBuf>,
    /// PEM private key.
    pub key_file: Option<PathBuf>,
    /// When true, only `<starttls required/>` is offered until the stream
    /// is encrypted.
    pub required: bool,
}

/// SASL settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SaslConfig {
    /// Mechanisms the server offers, in preference order.
    pub mechanisms: Vec<SaslMechanismKind>,
}

impl Default for SaslConfig {
    fn default() -> Self {
        SaslConfig {
            mechanisms: vec![
                SaslMechanismKind::ScramSha1,
                SaslMechanismKind::DigestMd5,
                SaslMechanismKind::Plain,
            ],
        }
    }
}

/// BOSH (XEP-0124) settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BoshConfig {
    /// Upper bound for the client-requested `wait`, in seconds.
    pub wait_max: u64,
    /// Default number of requests the server may hold open.
    pub hold: u16,
    /// Minimum seconds between empty client requests.
    pub polling: u64,
    /// Seconds of inactivity before a session is terminated.
    pub inactivity: u64,
}

impl Default for BoshConfig {
    fn default() -> Self {
        BoshConfig {
            wait_max: 60,
            hold: 1,
            polling: 15,
            inactivity: 60,
        }
    }
}

/// Server-to-server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct S2sConfig {
    /// Whether federation is enabled at all.
    pub enabled: bool,
    /// Dialback secret; auto-generated each start when absent.
    pub secret: Option<String>,
}

impl Default for S2sConfig {
    fn default() -> Self {
        S2sConfig {
            enabled: true,
            secret: None,
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct XmppConfig {
    /// The domain this server is authoritative for. Required.
    pub server_domain: String,
    /// Client-to-server listener address.
    pub c2s_listen: String,
    /// Server-to-server listener address.
    pub s2s_listen: String,
    /// BOSH HTTP listener address.
    pub bosh_listen: String,
    /// TLS settings.
    pub tls: TlsConfig,
    /// SASL settings.
    pub sasl: SaslConfig,
    /// BOSH settings.
    pub bosh: BoshConfig,
    /// S2S settings.
    pub s2s: S2sConfig,
}

impl Default for XmppConfig {
    fn default() -> Self {
        XmppConfig {
            server_domain: String::new(),
            c2s_listen: "0.0.0.0:5222".to_owned(),
            s2s_listen: "0.0.0.0:5269".to_owned(),
            bosh_listen: "0.0.0.0:5280".to_owned(),
            tls: TlsConfig::default(),
            sasl: SaslConfig::default(),
            bosh: BoshConfig::default(),
            s2s: S2sConfig::default(),
        }
    }
}

impl XmppConfig {
    /// Minimal configuration for a given domain, defaults everywhere else.
    pub fn for_domain(domain: impl Into<String>) -> XmppConfig {
        XmppConfig {
            server_domain: domain.into(),
            ..XmppConfig::default()
        }
    }

    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: &std::path::Path) -> Result<XmppConfig, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: XmppConfig = toml::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from environment variables alone.
    pub fn from_env() -> Result<XmppConfig, ConfigError> {
        let mut config = XmppConfig::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(domain) = std::env::var("GANNET_DOMAIN") {
            self.server_domain = domain;
        }
        if let Ok(addr) = std::env::var("GANNET_C2S_LISTEN") {
            self.c2s_listen = addr;
        }
        if let Ok(addr) = std::env::var("GANNET_S2S_LISTEN") {
            self.s2s_listen = addr;
        }
        if let Ok(addr) = std::env::var("GANNET_BOSH_LISTEN") {
            self.bosh_listen = addr;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server_domain.is_empty() {
            return Err(ConfigError::Invalid(
                "server-domain must be set (config key or GANNET_DOMAIN)".to_owned(),
            ));
        }
        if self.sasl.mechanisms.is_empty() {
            return Err(ConfigError::Invalid(
                "sasl.mechanisms must not be empty".to_owned(),
            ));
        }
        if self.tls.certificate_file.is_some() != self.tls.key_file.is_some() {
            return Err(ConfigError::Invalid(
                "tls.certificate-file and tls.key-file must be set together".to_owned(),
            ));
        }
        if self.tls.required && self.tls.certificate_file.is_none() {
            return Err(ConfigError::Invalid(
                "tls.required needs tls.certificate-file/tls.key-file".to_owned(),
            ));
        }
        Ok(())
    }

    /// Whether `domain` is served locally.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        domain.eq_ignore_ascii_case(&self.server_domain)
    }

    /// Log the effective configuration at startup.
    pub fn log_config(&self) {
        info!(domain = %self.server_domain, "Serving domain");
        info!(c2s = %self.c2s_listen, s2s = %self.s2s_listen, bosh = %self.bosh_listen, "Listeners");
        info!(
            tls_required = self.tls.required,
            tls_configured = self.tls.certificate_file.is_some(),
            "TLS"
        );
        let mechanisms: Vec<&str> = self.sasl.mechanisms.iter().map(|m| m.as_str()).collect();
        info!(mechanisms = ?mechanisms, "SASL");
        info!(
            enabled = self.s2s.enabled,
            secret_configured = self.s2s.secret.is_some(),
            "S2S"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = XmppConfig::for_domain("vysper.org");
        assert_eq!(config.bosh.wait_max, 60);
        assert_eq!(config.bosh.hold, 1);
        assert_eq!(config.bosh.polling, 15);
        assert_eq!(config.bosh.inactivity, 60);
        assert!(config.s2s.enabled);
        assert!(!config.tls.required);
        assert_eq!(config.sasl.mechanisms.len(), 3);
    }

    #[test]
    fn parses_kebab_case_toml() {
        let raw = r#"
            server-domain = "vysper.org"

            [tls]
            required = false

            [sasl]
            mechanisms = ["PLAIN", "SCRAM-SHA-1"]

            [bosh]
            wait-max = 30
            hold = 2

            [s2s]
            enabled = false
        "#;
        let config: XmppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server_domain, "vysper.org");
        assert_eq!(config.bosh.wait_max, 30);
        assert_eq!(config.bosh.hold, 2);
        assert!(!config.s2s.enabled);
        assert_eq!(
            config.sasl.mechanisms,
            vec![SaslMechanismKind::Plain, SaslMechanismKind::ScramSha1]
        );
    }

    #[test]
    fn missing_domain_is_invalid() {
        let config = XmppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn local_domain_is_case_insensitive() {
        let config = XmppConfig::for_domain("vysper.org");
        assert!(config.is_local_domain("Vysper.ORG"));
        assert!(!config.is_local_domain("example.org"));
    }
}
