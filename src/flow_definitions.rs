use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::storage::{Storage, StorageError};

/// A named, versioned JSON configuration document, the unit a principal is
/// ultimately shown. At most one flow per type may be the default; the
/// default's content is the base every resolution starts from.
#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct Flow {
    pub id: i32,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub flow_type: String,
    pub name: String,
    pub content: Value,
    pub is_default: bool,
    pub is_active: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewFlow {
    #[serde(rename = "type")]
    pub flow_type: String,
    pub name: String,
    pub content: Value,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Lifecycle-scoped cache for per-type default flows, refreshed on a TTL.
/// Held by the resolver instead of hiding a process-global memo.
pub struct DefaultFlowCache {
    storage: Arc<dyn Storage + Send + Sync>,
    ttl: Duration,
    entries: Mutex<HashMap<String, (Option<Flow>, Instant)>>,
}

impl DefaultFlowCache {
    pub fn new(storage: Arc<dyn Storage + Send + Sync>, ttl: Duration) -> Self {
        Self {
            storage,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The default flow for a type, or None if the type has no default.
    /// Negative results are cached too, so unknown types don't hammer pg.
    pub async fn get(&self, flow_type: &str) -> Result<Option<Flow>, StorageError> {
        {
            let entries = self.entries.lock().await;
            if let Some((flow, fetched_at)) = entries.get(flow_type) {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(flow.clone());
                }
            }
        }

        let flow = self.storage.default_flow(flow_type).await?;

        let mut entries = self.entries.lock().await;
        entries.insert(flow_type.to_string(), (flow.clone(), Instant::now()));

        Ok(flow)
    }

    /// Drops all cached entries; used after admin writes to flows.
    pub async fn invalidate(&self) {
        self.entries.lock().await.clear();
    }
}
