//! SFU controller configuration.
//!
//! Configuration is loaded from environment variables. The admission key secret is
//! redacted in Debug output.

use base64::Engine as _;
use secrecy::{ExposeSecret, SecretBox, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8090";

/// Default time a join may wait for the admission authority.
pub const DEFAULT_ADMISSION_TIMEOUT_SECONDS: u64 = 30;

/// Default time to wait for an endpoint task to finish after cancellation.
pub const DEFAULT_ENDPOINT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 5;

/// Default SFU instance ID prefix.
pub const DEFAULT_SFU_ID_PREFIX: &str = "sfu";

/// Minimum decoded length of the admission key secret (HMAC-SHA256).
pub const MIN_ADMISSION_SECRET_LENGTH: usize = 32;

/// Which peers are skipped when a departing peer's tracks are withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WithdrawalExclusion {
    /// Every remaining peer is told about withdrawn tracks.
    #[default]
    None,
    /// The peer currently marked as screen-share source is not told.
    ScreenShareSource,
}

impl WithdrawalExclusion {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ScreenShareSource => "screen-share-source",
        }
    }

    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "none" => Ok(Self::None),
            "screen-share-source" => Ok(Self::ScreenShareSource),
            other => Err(ConfigError::InvalidValue(format!(
                "SFU_WITHDRAWAL_EXCLUSION must be 'none' or 'screen-share-source', got '{other}'"
            ))),
        }
    }
}

/// SFU controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Unique identifier for this SFU instance. Also the HKDF salt for admission keys.
    pub sfu_id: String,

    /// Health endpoint bind address (default: "0.0.0.0:8090").
    pub health_bind_address: String,

    /// How long a join waits for accept/deny before it is treated as denied.
    pub admission_timeout: Duration,

    /// How long removal waits for an endpoint task before logging a timeout.
    pub endpoint_shutdown_timeout: Duration,

    /// Withdrawal notification exclusion policy.
    pub withdrawal_exclusion: WithdrawalExclusion,

    /// Master secret for admission key HMAC (base64-encoded).
    pub admission_key_secret: SecretString,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sfu_id", &self.sfu_id)
            .field("health_bind_address", &self.health_bind_address)
            .field("admission_timeout", &self.admission_timeout)
            .field("endpoint_shutdown_timeout", &self.endpoint_shutdown_timeout)
            .field("withdrawal_exclusion", &self.withdrawal_exclusion)
            .field("admission_key_secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let admission_key_secret = SecretString::from(
            vars.get("SFU_ADMISSION_KEY_SECRET")
                .ok_or_else(|| {
                    ConfigError::MissingEnvVar("SFU_ADMISSION_KEY_SECRET".to_string())
                })?
                .clone(),
        );

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let admission_timeout = Duration::from_secs(parse_seconds(
            vars,
            "SFU_ADMISSION_TIMEOUT_SECONDS",
            DEFAULT_ADMISSION_TIMEOUT_SECONDS,
        )?);

        let endpoint_shutdown_timeout = Duration::from_secs(parse_seconds(
            vars,
            "SFU_ENDPOINT_SHUTDOWN_TIMEOUT_SECONDS",
            DEFAULT_ENDPOINT_SHUTDOWN_TIMEOUT_SECONDS,
        )?);

        let withdrawal_exclusion = vars
            .get("SFU_WITHDRAWAL_EXCLUSION")
            .map(|v| WithdrawalExclusion::parse(v))
            .transpose()?
            .unwrap_or_default();

        let sfu_id = vars.get("SFU_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SFU_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            sfu_id,
            health_bind_address,
            admission_timeout,
            endpoint_shutdown_timeout,
            withdrawal_exclusion,
            admission_key_secret,
        })
    }

    /// Decode the base64 admission key secret and check its length.
    pub fn admission_secret_bytes(&self) -> Result<SecretBox<Vec<u8>>, ConfigError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.admission_key_secret.expose_secret())
            .map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "SFU_ADMISSION_KEY_SECRET is not valid base64: {e}"
                ))
            })?;

        if bytes.len() < MIN_ADMISSION_SECRET_LENGTH {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_ADMISSION_KEY_SECRET must be at least {MIN_ADMISSION_SECRET_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }

        Ok(SecretBox::new(Box::new(bytes)))
    }
}

fn parse_seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| {
                ConfigError::InvalidValue(format!("{name} must be an integer, got '{raw}'"))
            }),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // 32 bytes of 0x2a, base64-encoded.
    const TEST_SECRET_B64: &str = "KioqKioqKioqKioqKioqKioqKioqKioqKioqKioqKio=";

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "SFU_ADMISSION_KEY_SECRET".to_string(),
            TEST_SECRET_B64.to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(
            config.admission_timeout,
            Duration::from_secs(DEFAULT_ADMISSION_TIMEOUT_SECONDS)
        );
        assert_eq!(
            config.endpoint_shutdown_timeout,
            Duration::from_secs(DEFAULT_ENDPOINT_SHUTDOWN_TIMEOUT_SECONDS)
        );
        assert_eq!(config.withdrawal_exclusion, WithdrawalExclusion::None);
        assert!(config.sfu_id.starts_with("sfu-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("SFU_ID".to_string(), "sfu-custom-001".to_string());
        vars.insert(
            "SFU_HEALTH_BIND_ADDRESS".to_string(),
            "127.0.0.1:9000".to_string(),
        );
        vars.insert("SFU_ADMISSION_TIMEOUT_SECONDS".to_string(), "10".to_string());
        vars.insert(
            "SFU_ENDPOINT_SHUTDOWN_TIMEOUT_SECONDS".to_string(),
            "2".to_string(),
        );
        vars.insert(
            "SFU_WITHDRAWAL_EXCLUSION".to_string(),
            "screen-share-source".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.sfu_id, "sfu-custom-001");
        assert_eq!(config.health_bind_address, "127.0.0.1:9000");
        assert_eq!(config.admission_timeout, Duration::from_secs(10));
        assert_eq!(config.endpoint_shutdown_timeout, Duration::from_secs(2));
        assert_eq!(
            config.withdrawal_exclusion,
            WithdrawalExclusion::ScreenShareSource
        );
    }

    #[test]
    fn test_from_vars_missing_secret() {
        let result = Config::from_vars(&HashMap::new());
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "SFU_ADMISSION_KEY_SECRET")
        );
    }

    #[test]
    fn test_from_vars_rejects_bad_timeout() {
        let mut vars = base_vars();
        vars.insert(
            "SFU_ADMISSION_TIMEOUT_SECONDS".to_string(),
            "soon".to_string(),
        );
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_from_vars_rejects_unknown_exclusion() {
        let mut vars = base_vars();
        vars.insert(
            "SFU_WITHDRAWAL_EXCLUSION".to_string(),
            "everyone".to_string(),
        );
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_admission_secret_bytes_decodes() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let secret = config.admission_secret_bytes().unwrap();
        assert_eq!(secret.expose_secret().len(), 32);
    }

    #[test]
    fn test_admission_secret_too_short() {
        let mut vars = base_vars();
        // "short" in base64
        vars.insert("SFU_ADMISSION_KEY_SECRET".to_string(), "c2hvcnQ=".to_string());
        let config = Config::from_vars(&vars).unwrap();
        assert!(matches!(
            config.admission_secret_bytes(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains(TEST_SECRET_B64));
    }
}
