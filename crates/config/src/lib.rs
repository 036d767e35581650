use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Environment variable that overrides `email.sender_password` when non-empty.
pub const SMTP_PASSWORD_ENV: &str = "SITEWATCH_SMTP_PASSWORD";

/// Failure to produce a usable [`AppConfig`].  Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Monitor config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between two fetches of the same target.
    #[serde(deserialize_with = "int_or_string")]
    pub check_interval: u64,
    /// Upper bound in seconds for a single page fetch.  Exceeding it counts
    /// as a fetch failure for that cycle.
    #[serde(default = "default_fetch_timeout", deserialize_with = "int_or_string")]
    pub fetch_timeout: u64,
    /// Seconds between two checks of the target file's modification marker.
    #[serde(default = "default_watch_interval", deserialize_with = "int_or_string")]
    pub watch_interval: u64,
    /// `User-Agent` header sent with every fetch.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval)
    }
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_watch_interval() -> u64 {
    300
}

fn default_user_agent() -> String {
    concat!("sitewatch/", env!("CARGO_PKG_VERSION")).to_string()
}

// ── Email config ─────────────────────────────────────────────────────────────

/// How the SMTP connection is secured.
///
/// | Mode       | Behaviour                                           |
/// |------------|-----------------------------------------------------|
/// | `implicit` | TLS from the first byte (SMTPS, usually port 465).  |
/// | `starttls` | Plain connect, then mandatory STARTTLS (port 587).  |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    #[default]
    Implicit,
    Starttls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_server: String,
    #[serde(deserialize_with = "int_or_string")]
    pub smtp_port: u16,
    pub sender_email: String,
    pub sender_password: String,
    pub recipient_email: String,
    #[serde(default)]
    pub tls: SmtpTls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub monitor: MonitorConfig,
    pub email: EmailConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Read, parse and validate the JSON config at `path`, then apply the
    /// environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides looked up through `lookup` (the process environment in
    /// production).  Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(SMTP_PASSWORD_ENV).filter(|v| !v.is_empty()) {
            self.email.sender_password = password;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.check_interval == 0 {
            return Err(ConfigError::Invalid(
                "monitor.check_interval must be at least 1 second".to_string(),
            ));
        }
        if self.monitor.fetch_timeout == 0 {
            return Err(ConfigError::Invalid(
                "monitor.fetch_timeout must be at least 1 second".to_string(),
            ));
        }
        if self.monitor.watch_interval == 0 {
            return Err(ConfigError::Invalid(
                "monitor.watch_interval must be at least 1 second".to_string(),
            ));
        }
        if self.email.smtp_server.trim().is_empty() {
            return Err(ConfigError::Invalid("email.smtp_server is empty".to_string()));
        }
        if self.email.smtp_port == 0 {
            return Err(ConfigError::Invalid("email.smtp_port must be non-zero".to_string()));
        }
        for (field, value) in [
            ("email.sender_email", &self.email.sender_email),
            ("email.recipient_email", &self.email.recipient_email),
        ] {
            if !value.contains('@') {
                return Err(ConfigError::Invalid(format!(
                    "{field} is not an email address: {value:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Accept either a JSON integer or a string holding one (`"465"`), which is
/// how hand-written config files often spell ports and intervals.
fn int_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Str(String),
    }

    let value = match Raw::deserialize(deserializer)? {
        Raw::Int(n) => n,
        Raw::Str(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("expected an integer, got {s:?}")))?,
    };
    T::try_from(value).map_err(|_| serde::de::Error::custom(format!("{value} is out of range")))
}

// ── Tests ────────────────────────────────────────────────────────────────────
