// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Configuration validation

use tracing::warn;

use super::error::ConfigError;
use super::types::{Config, Environment};

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NOXRUN_PORT".to_string(),
                value: "0".to_string(),
                reason: "Port cannot be 0".to_string(),
            });
        }

        if self.storage.bucket.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "NOXRUN_S3_BUCKET".to_string(),
                value: String::new(),
                reason: "Bucket name cannot be empty".to_string(),
            });
        }

        if self.lifecycle.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NOXRUN_HEARTBEAT_TIMEOUT".to_string(),
                value: "0".to_string(),
                reason: "Heartbeat timeout must be positive".to_string(),
            });
        }

        if self.lifecycle.idle_timeout_secs == 0 || self.lifecycle.max_lifetime_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NOXRUN_SESSION_IDLE_TIMEOUT/MAX_LIFETIME".to_string(),
                value: "0".to_string(),
                reason: "Use -1 to disable a threshold, not 0".to_string(),
            });
        }

        if self.security.api_token == self.security.internal_token {
            return Err(ConfigError::InvalidValue {
                key: "NOXRUN_INTERNAL_TOKEN".to_string(),
                value: "<redacted>".to_string(),
                reason: "Internal token must differ from the external API token".to_string(),
            });
        }

        if self.server.environment == Environment::Production {
            if self.security.api_token.len() < 32 {
                warn!("External API token is shorter than 32 characters in production");
            }
            if self.storage.access_key.is_empty() {
                warn!("Object store access key is empty in production");
            }
            if self.lifecycle.idle_timeout_secs < 0 {
                warn!("Idle session reaping is disabled in production");
            }
            if self.lifecycle.max_lifetime_secs < 0 {
                warn!("Session lifetime cap is disabled in production");
            }
        }

        Ok(())
    }
}
