use std::sync::Arc;

use crate::redis::{Client as RedisClient, CustomRedisError};

/// Per-variant selection counters, keyed by (experiment, flow) under a
/// configurable prefix. Backed by redis INCR so concurrent assignments
/// never lose updates. An unreachable store propagates the error; a
/// fabricated value here would silently corrupt ratio convergence.

pub fn counter_key(prefix: &str, experiment_id: i32, flow_id: i32) -> String {
    format!("{prefix}experiment:{experiment_id}:flow:{flow_id}")
}

fn experiment_prefix(prefix: &str, experiment_id: i32) -> String {
    format!("{prefix}experiment:{experiment_id}:flow:")
}

pub async fn increment_selection_count(
    client: Arc<dyn RedisClient + Send + Sync>,
    prefix: &str,
    experiment_id: i32,
    flow_id: i32,
) -> Result<i64, CustomRedisError> {
    client
        .incr(counter_key(prefix, experiment_id, flow_id))
        .await
}

pub async fn get_selection_count(
    client: Arc<dyn RedisClient + Send + Sync>,
    prefix: &str,
    experiment_id: i32,
    flow_id: i32,
) -> Result<i64, CustomRedisError> {
    match client.get(counter_key(prefix, experiment_id, flow_id)).await {
        Ok(value) => Ok(value.parse().unwrap_or(0)),
        Err(CustomRedisError::NotFound) => Ok(0),
        Err(e) => Err(e),
    }
}

/// All counters for an experiment, as (flow_id, count) pairs. Admin-only:
/// scans keys by prefix.
pub async fn get_experiment_counters(
    client: Arc<dyn RedisClient + Send + Sync>,
    prefix: &str,
    experiment_id: i32,
) -> Result<Vec<(i32, i64)>, CustomRedisError> {
    let key_prefix = experiment_prefix(prefix, experiment_id);
    let keys = client.keys_by_prefix(key_prefix.clone()).await?;

    let mut counters = Vec::with_capacity(keys.len());
    for key in keys {
        let Some(flow_id) = key
            .strip_prefix(&key_prefix)
            .and_then(|id| id.parse::<i32>().ok())
        else {
            continue;
        };
        let count = match client.get(key).await {
            Ok(value) => value.parse().unwrap_or(0),
            Err(CustomRedisError::NotFound) => 0,
            Err(e) => return Err(e),
        };
        counters.push((flow_id, count));
    }
    counters.sort_unstable();

    Ok(counters)
}

/// Zeroes every counter for an experiment. Only reached from the admin
/// reset operation, never from the resolution path.
pub async fn reset_experiment_counters(
    client: Arc<dyn RedisClient + Send + Sync>,
    prefix: &str,
    experiment_id: i32,
) -> Result<(), CustomRedisError> {
    let keys = client
        .keys_by_prefix(experiment_prefix(prefix, experiment_id))
        .await?;

    for key in keys {
        client.del(key).await?;
    }

    Ok(())
}
