use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::api::ConfigError;
use crate::redis::{Client as RedisClient, CustomRedisError};

/// Ephemeral (ip, type) -> flow pins used by QA to preview a variant
/// before assignment logic runs. Lives entirely in redis under a TTL.
/// At most one override exists per (ip, type); `set` overwrites.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TestOverride {
    pub ip: String,
    #[serde(rename = "type")]
    pub config_type: String,
    pub flow_id: i32,
}

fn override_key(prefix: &str, ip: &str, config_type: &str) -> String {
    format!("{prefix}{ip}:{config_type}")
}

pub struct TestOverrideStore {
    redis_client: Arc<dyn RedisClient + Send + Sync>,
    key_prefix: String,
    ttl_secs: u64,
}

impl TestOverrideStore {
    pub fn new(
        redis_client: Arc<dyn RedisClient + Send + Sync>,
        key_prefix: String,
        ttl_secs: u64,
    ) -> Self {
        Self {
            redis_client,
            key_prefix,
            ttl_secs,
        }
    }

    pub async fn set(&self, override_: TestOverride) -> Result<(), ConfigError> {
        let key = override_key(&self.key_prefix, &override_.ip, &override_.config_type);
        let value = serde_json::to_string(&override_).map_err(|e| {
            tracing::error!("failed to serialize test override: {}", e);
            ConfigError::DataParsingError
        })?;

        self.redis_client.set_ex(key, value, self.ttl_secs).await?;
        Ok(())
    }

    pub async fn find_by_ip_and_type(
        &self,
        ip: &str,
        config_type: &str,
    ) -> Result<Option<TestOverride>, ConfigError> {
        let key = override_key(&self.key_prefix, ip, config_type);
        match self.redis_client.get(key).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(override_) => Ok(Some(override_)),
                Err(e) => {
                    tracing::error!("failed to parse test override: {}", e);
                    Ok(None)
                }
            },
            Err(CustomRedisError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, ip: &str, config_type: &str) -> Result<(), ConfigError> {
        self.redis_client
            .del(override_key(&self.key_prefix, ip, config_type))
            .await?;
        Ok(())
    }

    /// Removes every override, regardless of ip and type. Admin-only.
    pub async fn clear(&self) -> Result<(), ConfigError> {
        let keys = self
            .redis_client
            .keys_by_prefix(self.key_prefix.clone())
            .await?;
        for key in keys {
            self.redis_client.del(key).await?;
        }
        Ok(())
    }

    /// Removes every override for one config type, across all ips.
    pub async fn clear_type(&self, config_type: &str) -> Result<(), ConfigError> {
        let suffix = format!(":{config_type}");
        let keys = self
            .redis_client
            .keys_by_prefix(self.key_prefix.clone())
            .await?;
        for key in keys {
            if key.ends_with(&suffix) {
                self.redis_client.del(key).await?;
            }
        }
        Ok(())
    }
}
