use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::instrument;

use crate::api::ConfigError;
use crate::assignment::AssignmentService;
use crate::config::Config;
use crate::flow_definitions::DefaultFlowCache;
use crate::redis::Client as RedisClient;
use crate::storage::Storage;
use crate::test_overrides::TestOverrideStore;
use crate::v0_request::{Principal, TargetingAttributes};

/// Deep-merges `overlay` over `base`: object keys merge recursively,
/// everything else (scalars and arrays alike) is replaced wholesale.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// What one resolution produced: the merged document plus which
/// experiment/flow (if any) the principal landed in.
#[derive(Debug, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub config: Value,
    pub experiment_id: Option<i32>,
    pub flow_id: Option<i32>,
}

impl ResolvedConfig {
    fn base(config: Value) -> Self {
        Self {
            config,
            experiment_id: None,
            flow_id: None,
        }
    }
}

/// The decision pipeline: QA override, then locked winner, then
/// experiment assignment, then base config. Each stage either
/// short-circuits with a merged result or falls through; a failing stage
/// degrades to the stages below it rather than failing the request.
pub struct ConfigResolver {
    storage: Arc<dyn Storage + Send + Sync>,
    default_flows: DefaultFlowCache,
    test_overrides: TestOverrideStore,
    assignments: AssignmentService,
    config: Config,
}

impl ConfigResolver {
    pub fn new(
        storage: Arc<dyn Storage + Send + Sync>,
        redis_client: Arc<dyn RedisClient + Send + Sync>,
        config: Config,
    ) -> Self {
        let default_flows = DefaultFlowCache::new(
            storage.clone(),
            Duration::from_secs(config.default_flow_cache_ttl_secs),
        );
        let test_overrides = TestOverrideStore::new(
            redis_client.clone(),
            config.test_override_key_prefix.clone(),
            config.test_override_ttl_secs,
        );
        let assignments = AssignmentService::new(storage.clone(), redis_client, config.clone());

        Self {
            storage,
            default_flows,
            test_overrides,
            assignments,
            config,
        }
    }

    pub fn assignment_service(&self) -> &AssignmentService {
        &self.assignments
    }

    pub fn test_override_store(&self) -> &TestOverrideStore {
        &self.test_overrides
    }

    pub fn default_flow_cache(&self) -> &DefaultFlowCache {
        &self.default_flows
    }

    #[instrument(skip_all, fields(principal_id = %principal.principal_id, config_type))]
    pub async fn resolve(
        &self,
        principal: &Principal,
        config_type: &str,
        attributes: &TargetingAttributes,
        client_ip: Option<&str>,
    ) -> Result<ResolvedConfig, ConfigError> {
        let mut config = match self.default_flows.get(config_type).await {
            Ok(Some(flow)) => flow.content,
            Ok(None) => Value::Object(Default::default()),
            Err(e) => return Err(e.into()),
        };

        if !*self.config.enabled {
            return Ok(ResolvedConfig::base(config));
        }

        // 1. QA override wins unconditionally and bypasses everything else
        if *self.config.testing_enabled {
            if let Some(ip) = client_ip {
                match self.apply_test_override(ip, config_type, &mut config).await {
                    Ok(true) => return Ok(ResolvedConfig::base(config)),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!("test override lookup failed, continuing: {}", e);
                    }
                }
            }
        }

        // 2. a locked winner for the exact targeting tuple beats any
        // experiment; requires all three attributes
        if let (Some(platform), Some(country), Some(language)) = (
            attributes.platform.as_deref(),
            attributes.country.as_deref(),
            attributes.language.as_deref(),
        ) {
            match self
                .storage
                .winner(config_type, platform, country, language)
                .await
            {
                Ok(Some(winner)) => {
                    deep_merge(&mut config, &winner.content);
                    return Ok(ResolvedConfig::base(config));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("winner lookup failed, continuing: {}", e);
                }
            }
        }

        // 3. experiment assignment; any failure degrades to base config
        // (availability over strict placement correctness)
        match self
            .assignments
            .get_or_create(principal, config_type, attributes)
            .await
        {
            Ok(Some(assignment)) => match self.storage.flow(assignment.flow_id).await {
                Ok(Some(flow)) => {
                    deep_merge(&mut config, &flow.content);
                    return Ok(ResolvedConfig {
                        config,
                        experiment_id: Some(assignment.experiment_id),
                        flow_id: Some(assignment.flow_id),
                    });
                }
                Ok(None) => {
                    tracing::error!(
                        flow_id = assignment.flow_id,
                        "assignment references a missing flow"
                    );
                }
                Err(e) => {
                    tracing::error!("assigned flow lookup failed, returning base: {}", e);
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::error!("assignment failed, returning base: {}", e);
            }
        }

        // 4. base config only
        Ok(ResolvedConfig::base(config))
    }

    /// Applies a matching override's flow content. Returns whether one
    /// was applied; a pin referencing a missing flow is ignored.
    async fn apply_test_override(
        &self,
        ip: &str,
        config_type: &str,
        config: &mut Value,
    ) -> Result<bool, ConfigError> {
        let Some(override_) = self
            .test_overrides
            .find_by_ip_and_type(ip, config_type)
            .await?
        else {
            return Ok(false);
        };

        match self.storage.flow(override_.flow_id).await? {
            Some(flow) => {
                deep_merge(config, &flow.content);
                Ok(true)
            }
            None => {
                tracing::error!(
                    flow_id = override_.flow_id,
                    "test override references a missing flow"
                );
                Ok(false)
            }
        }
    }
}
