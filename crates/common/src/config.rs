use std::path::Path;

use serde::{Deserialize, Serialize};

/// Largest scrypt work factor we are still willing to decrypt.
pub const MAX_WORK_FACTOR: u8 = 22;

/// Errors produced while loading or validating the device configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration {path:?} is not protected from other users: chmod it to 0600 for safety")]
    Permissions { path: String },

    #[error("invalid secret key: length is 0")]
    EmptySecretKey,

    #[error("invalid work factor")]
    WorkFactor,

    #[error("broker URL is not a valid HTTPS URL")]
    BrokerUrl,

    #[error("bucket prefix is not a valid HTTPS URL ending in '/'")]
    BucketPrefix,

    #[error("invalid device name")]
    DeviceName,

    #[error("invalid device token")]
    DeviceToken,
}

/// Per-device configuration, persisted as a mode-0600 JSON file under
/// `$HOME/.nightmarket/<name>` by the setup tool.
///
/// The configuration is read once per process; the clerk built from it is
/// immutable and shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClerkConfig {
    /// Symmetric passphrase material shared by all devices.
    pub secret_key: String,
    /// scrypt log2(N) for the passphrase recipient; 0 means the library
    /// default.
    #[serde(default)]
    pub work_factor: u8,
    /// Base URL of the watchdemon broker.
    pub broker_url: String,
    /// Every presigned URL the broker hands back must start with this.
    pub bucket_prefix: String,
    pub device_name: String,
    pub device_token: String,
}

impl ClerkConfig {
    /// Read and validate the configuration file.
    ///
    /// Refuses files that other users can read: the secret key lives in
    /// here, so anything other than mode 0600 is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let metadata = std::fs::metadata(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o777 != 0o600 {
                return Err(ConfigError::Permissions {
                    path: path.display().to_string(),
                });
            }
        }
        let data = std::fs::read(path)?;
        let config: ClerkConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_key.is_empty() {
            return Err(ConfigError::EmptySecretKey);
        }
        // allow 0, which means "the library default"
        if self.work_factor > MAX_WORK_FACTOR {
            return Err(ConfigError::WorkFactor);
        }
        if !self.broker_url.starts_with("https://") {
            return Err(ConfigError::BrokerUrl);
        }
        if !self.bucket_prefix.starts_with("https://") || !self.bucket_prefix.ends_with('/') {
            return Err(ConfigError::BucketPrefix);
        }
        if self.device_name.is_empty() {
            return Err(ConfigError::DeviceName);
        }
        if self.device_token.is_empty() {
            return Err(ConfigError::DeviceToken);
        }
        Ok(())
    }
}
